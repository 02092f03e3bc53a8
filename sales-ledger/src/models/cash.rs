//! Cash ledger records: income entries and withdrawals.

use bson::Document;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledger_core::error::StoreError;

use crate::store::collections;

/// Categories the engine assigns to entries it generates from invoice
/// activity. Manual entries carry whatever the caller supplies.
pub mod categories {
    pub const SALES: &str = "sales";
    pub const RECEIVABLES: &str = "receivables";
}

/// Money received, mirrored from an invoice payment or recorded by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeEntry {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub concept: String,
    pub amount: Decimal,
    pub category: String,
    pub date: DateTime<Utc>,
    /// Set when the entry mirrors a payment on an invoice.
    #[serde(default)]
    pub invoice_id: Option<Uuid>,
    /// Shared with the mirrored payment; reversals match on it.
    #[serde(default)]
    pub reference_id: Option<Uuid>,
}

impl IncomeEntry {
    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        bson::from_document(doc).map_err(|e| StoreError::Corrupt {
            collection: collections::INCOME_ENTRIES.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        bson::to_document(self)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("encode income entry: {e}")))
    }
}

/// Money taken out of the till.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub concept: String,
    pub amount: Decimal,
    pub category: String,
    pub date: DateTime<Utc>,
}

impl Withdrawal {
    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        bson::from_document(doc).map_err(|e| StoreError::Corrupt {
            collection: collections::WITHDRAWALS.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        bson::to_document(self)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("encode withdrawal: {e}")))
    }
}

/// Input for manual cash-ledger records.
#[derive(Debug, Clone)]
pub struct RecordCashEntry {
    pub concept: String,
    pub amount: Decimal,
    pub category: String,
    /// Defaults to now.
    pub date: Option<DateTime<Utc>>,
}
