//! Payment allocation: single-invoice payments, oldest-first bulk and group
//! allocation, and reversals.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use ledger_core::error::AppError;
use ledger_core::gate::OperationGate;
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::cash::categories;
use crate::models::{
    Allocation, Group, IncomeEntry, Invoice, InvoiceStatus, Payment, PaymentOrigin,
    BALANCE_EPSILON,
};
use crate::services::accounts::AccountAggregator;
use crate::services::metrics::{PAYMENTS_TOTAL, REVERSALS_TOTAL, STORE_OP_DURATION};
use crate::services::{commit_ops, decode_invoices, load_invoice};
use crate::store::{collections, BatchOp, DocumentStore, Filter};

/// What a bulk payment is applied against.
#[derive(Debug, Clone)]
pub enum AllocationTarget {
    /// Hand-picked invoices.
    Invoices(Vec<Uuid>),
    /// Every open invoice back-linked to the group.
    Group(Uuid),
}

/// Append a freshly minted payment to an invoice and build the mirrored
/// income entry. The caller persists both; the shared `reference_id` is what
/// ties them together for reversal.
pub(crate) fn stage_payment(
    invoice: &mut Invoice,
    amount: Decimal,
    origin: PaymentOrigin,
    at: DateTime<Utc>,
) -> IncomeEntry {
    let payment = Payment::new(amount, origin, at);
    let reference_id = payment.reference_id;
    invoice.payments.push(payment);
    invoice.recompute_balance();
    invoice.updated_at = at;

    let (concept, category) = match origin {
        PaymentOrigin::Initial => (
            format!("Sale {}", invoice.invoice_number),
            categories::SALES,
        ),
        _ => (
            format!("Payment on sale {}", invoice.invoice_number),
            categories::RECEIVABLES,
        ),
    };

    IncomeEntry {
        id: Uuid::new_v4(),
        concept,
        amount,
        category: category.to_string(),
        date: at,
        invoice_id: Some(invoice.id),
        reference_id,
    }
}

/// Records payments against invoices and keeps the income ledger in step.
/// The only code path that mints [`Payment`] values after a sale.
pub struct PaymentAllocator {
    store: Arc<dyn DocumentStore>,
    gate: OperationGate,
    retry: RetryConfig,
    accounts: Arc<AccountAggregator>,
}

impl PaymentAllocator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gate: OperationGate,
        retry: RetryConfig,
        accounts: Arc<AccountAggregator>,
    ) -> Self {
        Self {
            store,
            gate,
            retry,
            accounts,
        }
    }

    /// Record a payment against a single invoice. Returns the new balance.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, amount = %amount))]
    pub async fn apply_to_invoice(
        &self,
        invoice_id: Uuid,
        amount: Decimal,
    ) -> Result<Decimal, AppError> {
        let _guard = self.gate.acquire("apply_payment").await?;

        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Payment amount must be greater than zero"
            )));
        }

        let mut invoice = load_invoice(&self.store, &self.retry, invoice_id).await?;
        if invoice.is_cancelled() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Invoice {} is cancelled and cannot take payments",
                invoice.invoice_number
            )));
        }
        if amount > invoice.balance_due + BALANCE_EPSILON {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Payment amount {} exceeds the pending balance {}",
                amount,
                invoice.balance_due
            )));
        }

        let timer = STORE_OP_DURATION
            .with_label_values(&["apply_payment"])
            .start_timer();

        let entry = stage_payment(&mut invoice, amount, PaymentOrigin::Manual, Utc::now());
        let ops = vec![
            BatchOp::Update {
                collection: collections::INVOICES,
                id: invoice.id.to_string(),
                patch: invoice.to_patch()?,
            },
            BatchOp::Insert {
                collection: collections::INCOME_ENTRIES,
                doc: entry.to_document()?,
            },
        ];
        commit_ops(&self.store, &self.retry, ops, "apply_payment").await?;
        timer.observe_duration();

        PAYMENTS_TOTAL
            .with_label_values(&[PaymentOrigin::Manual.as_str()])
            .inc();
        info!(
            invoice_number = %invoice.invoice_number,
            amount = %amount,
            balance_due = %invoice.balance_due,
            status = invoice.status.as_str(),
            "Payment recorded"
        );

        self.accounts.refresh(true).await?;
        Ok(invoice.balance_due)
    }

    /// Split one payment across several invoices, oldest first. Each invoice
    /// takes the lesser of what it still owes and what remains. Returns one
    /// row per candidate, zero rows included, in application order.
    #[instrument(skip(self, target), fields(total_amount = %total_amount))]
    pub async fn apply_across(
        &self,
        target: AllocationTarget,
        total_amount: Decimal,
    ) -> Result<Vec<Allocation>, AppError> {
        let _guard = self.gate.acquire("apply_across").await?;

        if total_amount <= Decimal::ZERO {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Payment amount must be greater than zero"
            )));
        }

        let origin = match &target {
            AllocationTarget::Invoices(_) => PaymentOrigin::Bulk,
            AllocationTarget::Group(_) => PaymentOrigin::Group,
        };

        let mut candidates = match target {
            AllocationTarget::Invoices(mut ids) => {
                // An id listed twice is still one candidate.
                let mut seen = HashSet::new();
                ids.retain(|id| seen.insert(*id));
                let mut invoices = Vec::with_capacity(ids.len());
                for id in ids {
                    invoices.push(load_invoice(&self.store, &self.retry, id).await?);
                }
                invoices
            }
            AllocationTarget::Group(group_id) => self.group_candidates(group_id).await?,
        };

        candidates.retain(|invoice| invoice.is_open());
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        if !candidates.iter().any(|inv| inv.balance_due > BALANCE_EPSILON) {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Nothing to apply: no candidate invoice has an open balance"
            )));
        }

        let timer = STORE_OP_DURATION
            .with_label_values(&["apply_across"])
            .start_timer();

        let now = Utc::now();
        let mut remaining = total_amount;
        let mut allocations = Vec::with_capacity(candidates.len());
        let mut ops = Vec::new();
        let mut applied_count = 0u64;

        for mut invoice in candidates {
            let applied = if remaining > BALANCE_EPSILON {
                remaining.min(invoice.balance_due)
            } else {
                Decimal::ZERO
            };

            if applied > Decimal::ZERO {
                let entry = stage_payment(&mut invoice, applied, origin, now);
                ops.push(BatchOp::Update {
                    collection: collections::INVOICES,
                    id: invoice.id.to_string(),
                    patch: invoice.to_patch()?,
                });
                ops.push(BatchOp::Insert {
                    collection: collections::INCOME_ENTRIES,
                    doc: entry.to_document()?,
                });
                remaining -= applied;
                applied_count += 1;
            }

            allocations.push(Allocation {
                invoice_id: invoice.id,
                amount: applied,
            });
        }

        commit_ops(&self.store, &self.retry, ops, "apply_across").await?;
        timer.observe_duration();

        PAYMENTS_TOTAL
            .with_label_values(&[origin.as_str()])
            .inc_by(applied_count as f64);
        info!(
            origin = origin.as_str(),
            total_amount = %total_amount,
            invoices_paid = applied_count,
            remainder = %remaining,
            "Bulk payment allocated"
        );

        self.accounts.refresh(true).await?;
        Ok(allocations)
    }

    /// Remove a payment and its mirrored income entry.
    ///
    /// The payment is matched by `reference_id` when one is given, falling
    /// back to the oldest payment with the same amount for documents written
    /// before references existed. Degrades gracefully: a missing invoice or
    /// payment warns and still removes the income entry.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, amount = %amount))]
    pub async fn reverse(
        &self,
        invoice_id: Uuid,
        reference_id: Option<Uuid>,
        amount: Decimal,
    ) -> Result<(), AppError> {
        let _guard = self.gate.acquire("reverse_payment").await?;

        let id_str = invoice_id.to_string();
        let invoice_doc = retry_store_call(&self.retry, "get_invoice", || {
            self.store.get(collections::INVOICES, &id_str)
        })
        .await?;

        match invoice_doc {
            Some(doc) => {
                let mut invoice = Invoice::from_document(doc)?;
                let position = match reference_id {
                    Some(reference) => invoice
                        .payments
                        .iter()
                        .position(|p| p.reference_id == Some(reference)),
                    None => invoice.payments.iter().position(|p| p.amount == amount),
                };

                match position {
                    Some(index) => {
                        let removed = invoice.payments.remove(index);
                        invoice.recompute_balance();
                        invoice.updated_at = Utc::now();

                        let patch = invoice.to_patch()?;
                        retry_store_call(&self.retry, "update_invoice", || {
                            self.store.update(collections::INVOICES, &id_str, patch.clone())
                        })
                        .await?;

                        REVERSALS_TOTAL.with_label_values(&["reversed"]).inc();
                        info!(
                            invoice_number = %invoice.invoice_number,
                            amount = %removed.amount,
                            balance_due = %invoice.balance_due,
                            status = invoice.status.as_str(),
                            "Payment reversed"
                        );
                    }
                    None => {
                        REVERSALS_TOTAL
                            .with_label_values(&["payment_missing"])
                            .inc();
                        warn!(
                            invoice_number = %invoice.invoice_number,
                            "Payment to reverse not found on invoice; removing income entry only"
                        );
                    }
                }
            }
            None => {
                REVERSALS_TOTAL
                    .with_label_values(&["invoice_missing"])
                    .inc();
                warn!(
                    invoice_id = %invoice_id,
                    "Invoice for reversal not found; removing income entry only"
                );
            }
        }

        self.delete_income_entry(invoice_id, reference_id, amount).await?;
        self.accounts.refresh(true).await?;
        Ok(())
    }

    async fn group_candidates(&self, group_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let id_str = group_id.to_string();
        let group_doc = retry_store_call(&self.retry, "get_group", || {
            self.store.get(collections::GROUPS, &id_str)
        })
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Group {group_id} does not exist")))?;
        let group = Group::from_document(group_doc)?;

        let filters = [
            Filter::eq("group_id", id_str.clone()),
            Filter::eq("status", InvoiceStatus::Open.as_str()),
        ];
        let docs = retry_store_call(&self.retry, "group_open_invoices", || {
            self.store.query(collections::INVOICES, &filters)
        })
        .await?;
        let invoices = decode_invoices(docs)?;

        debug!(
            group = %group.name,
            candidates = invoices.len(),
            "Resolved group allocation candidates"
        );
        Ok(invoices)
    }

    /// Best-effort removal of the income entry mirroring a reversed payment.
    async fn delete_income_entry(
        &self,
        invoice_id: Uuid,
        reference_id: Option<Uuid>,
        amount: Decimal,
    ) -> Result<(), AppError> {
        let docs = match reference_id {
            Some(reference) => {
                let filters = [Filter::eq("reference_id", reference.to_string())];
                retry_store_call(&self.retry, "find_income_entry", || {
                    self.store.query(collections::INCOME_ENTRIES, &filters)
                })
                .await?
            }
            None => {
                let filters = [Filter::eq("invoice_id", invoice_id.to_string())];
                retry_store_call(&self.retry, "find_income_entry", || {
                    self.store.query(collections::INCOME_ENTRIES, &filters)
                })
                .await?
            }
        };

        let mut entries = docs
            .into_iter()
            .map(IncomeEntry::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.date.cmp(&b.date));

        let target = match reference_id {
            Some(_) => entries.into_iter().next(),
            None => entries.into_iter().find(|entry| entry.amount == amount),
        };

        match target {
            Some(entry) => {
                let entry_id = entry.id.to_string();
                retry_store_call(&self.retry, "delete_income_entry", || {
                    self.store.delete(collections::INCOME_ENTRIES, &entry_id)
                })
                .await?;
            }
            None => {
                warn!(invoice_id = %invoice_id, "No matching income entry to remove");
            }
        }
        Ok(())
    }
}
