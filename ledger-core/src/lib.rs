//! ledger-core: Shared infrastructure for the sales-ledger workspace.
pub mod error;
pub mod gate;
pub mod observability;
pub mod retry;
