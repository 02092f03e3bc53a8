//! Sales ledger: debt tracking and payment allocation for a repair-shop
//! point of sale.

pub mod config;
pub mod engine;
pub mod models;
pub mod services;
pub mod store;
