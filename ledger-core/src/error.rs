use std::time::Duration;
use thiserror::Error;

/// Failures at the document-store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed document in {collection}: {reason}")]
    Corrupt { collection: String, reason: String },

    #[error("Atomic batches are not supported by this store")]
    BatchUnsupported,

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether retrying the call has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Unavailable(_))
    }
}

/// Errors surfaced by the ledger engine.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Duplicate invoice number: {0}")]
    DuplicateInvoiceNumber(String),

    #[error("Could not acquire operation lock within {0:?}")]
    LockBusy(Duration),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
