//! Payments embedded in invoices, and allocation results.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a payment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOrigin {
    /// Recorded directly against a single invoice.
    Manual,
    /// Allocated from a bulk payment across hand-picked invoices.
    Bulk,
    /// Allocated from a payment against a group's open invoices.
    Group,
    /// Taken at sale time (cash sale or credit deposit).
    Initial,
}

impl Default for PaymentOrigin {
    fn default() -> Self {
        PaymentOrigin::Manual
    }
}

impl PaymentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOrigin::Manual => "manual",
            PaymentOrigin::Bulk => "bulk",
            PaymentOrigin::Group => "group",
            PaymentOrigin::Initial => "initial",
        }
    }
}

/// A payment recorded against an invoice.
///
/// Everything the engine mints carries a `reference_id`; only documents
/// written by older clients lack one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    pub amount: Decimal,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub origin: PaymentOrigin,
}

impl Payment {
    pub fn new(amount: Decimal, origin: PaymentOrigin, date: DateTime<Utc>) -> Self {
        Self {
            reference_id: Some(Uuid::new_v4()),
            amount,
            date,
            origin,
        }
    }
}

/// One row of an allocation result: how much landed on which invoice.
/// Candidates that received nothing appear with a zero amount.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub invoice_id: Uuid,
    pub amount: Decimal,
}
