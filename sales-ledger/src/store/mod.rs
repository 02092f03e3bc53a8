//! Document store boundary.
//!
//! The engine talks to its backing store through [`DocumentStore`]: a thin,
//! collection-oriented interface with single-field equality queries, atomic
//! multi-document batches, and change notifications. Documents cross the
//! boundary as BSON; the models normalize them on the way in.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::sync::broadcast;
use uuid::Uuid;

use ledger_core::error::StoreError;

/// Collections used by the ledger.
pub mod collections {
    pub const INVOICES: &str = "invoices";
    pub const GROUPS: &str = "groups";
    pub const INCOME_ENTRIES: &str = "income_entries";
    pub const WITHDRAWALS: &str = "withdrawals";
    pub const SALE_COUNTERS: &str = "sale_counters";
}

/// Equality predicate on a single top-level field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub value: Bson,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Insert {
        collection: &'static str,
        doc: Document,
    },
    Update {
        collection: &'static str,
        id: String,
        patch: Document,
    },
    Delete {
        collection: &'static str,
        id: String,
    },
}

/// Notification that a collection changed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
}

/// Backing store for ledger documents.
///
/// `update` merges the patch into the stored document and fails when the
/// target is missing; `delete` is idempotent. `commit_batch` is
/// all-or-nothing when `supports_batch` reports true and fails with
/// [`StoreError::BatchUnsupported`] otherwise.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Insert a document, minting a UUID `_id` when the caller did not set
    /// one. Returns the id.
    async fn insert(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// All documents matching every filter (conjunction).
    async fn query(&self, collection: &str, filters: &[Filter])
        -> Result<Vec<Document>, StoreError>;

    fn supports_batch(&self) -> bool {
        true
    }

    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Change notifications for a collection. Receivers that fall behind get
    /// a lag error and can simply re-read current state.
    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent>;
}

pub(crate) fn ensure_id(doc: &mut Document) -> String {
    match doc.get_str("_id") {
        Ok(id) => id.to_string(),
        Err(_) => {
            let id = Uuid::new_v4().to_string();
            doc.insert("_id", id.clone());
            id
        }
    }
}
