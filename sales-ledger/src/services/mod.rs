//! Services module for the sales ledger.

pub mod accounts;
pub mod allocation;
pub mod cash;
pub mod groups;
pub mod invoices;
pub mod metrics;

pub use accounts::AccountAggregator;
pub use allocation::{AllocationTarget, PaymentAllocator};
pub use cash::CashLedger;
pub use groups::GroupRegistry;
pub use invoices::InvoiceLedger;
pub use metrics::{get_metrics, init_metrics};

use std::sync::Arc;

use bson::Document;
use tracing::warn;
use uuid::Uuid;

use ledger_core::error::{AppError, StoreError};
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::Invoice;
use crate::store::{collections, BatchOp, DocumentStore};

/// Fetch and decode an invoice, mapping a miss to `NotFound`.
pub(crate) async fn load_invoice(
    store: &Arc<dyn DocumentStore>,
    retry: &RetryConfig,
    id: Uuid,
) -> Result<Invoice, AppError> {
    let id_str = id.to_string();
    let doc = retry_store_call(retry, "get_invoice", || {
        store.get(collections::INVOICES, &id_str)
    })
    .await?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {id} does not exist")))?;
    Ok(Invoice::from_document(doc)?)
}

/// Decode a query result into invoices.
pub(crate) fn decode_invoices(docs: Vec<Document>) -> Result<Vec<Invoice>, StoreError> {
    docs.into_iter().map(Invoice::from_document).collect()
}

/// Apply writes atomically when the store supports batches. Otherwise fall
/// back to sequential writes, where a mid-sequence failure leaves the earlier
/// writes in place and surfaces the error.
pub(crate) async fn commit_ops(
    store: &Arc<dyn DocumentStore>,
    retry: &RetryConfig,
    ops: Vec<BatchOp>,
    operation: &str,
) -> Result<(), AppError> {
    if ops.is_empty() {
        return Ok(());
    }

    if store.supports_batch() {
        retry_store_call(retry, operation, || store.commit_batch(ops.clone())).await?;
        return Ok(());
    }

    warn!(operation, "Store lacks atomic batches; applying writes sequentially");
    for (applied, op) in ops.into_iter().enumerate() {
        let result = match op {
            BatchOp::Insert { collection, doc } => {
                retry_store_call(retry, operation, || store.insert(collection, doc.clone()))
                    .await
                    .map(|_| ())
            }
            BatchOp::Update { collection, id, patch } => {
                retry_store_call(retry, operation, || {
                    store.update(collection, &id, patch.clone())
                })
                .await
            }
            BatchOp::Delete { collection, id } => {
                retry_store_call(retry, operation, || store.delete(collection, &id)).await
            }
        };

        if let Err(e) = result {
            warn!(
                operation,
                applied,
                error = %e,
                "Sequential write failed part-way; earlier writes remain"
            );
            return Err(e.into());
        }
    }
    Ok(())
}
