//! Invoice lifecycle: creation, edits, cancellation, deletion, numbering.

use std::sync::Arc;

use bson::doc;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use ledger_core::error::AppError;
use ledger_core::gate::OperationGate;
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::account::default_customer_label;
use crate::models::invoice::invoice_total;
use crate::models::{
    CreateInvoice, Invoice, InvoiceStatus, LineItem, PaymentKind, PaymentOrigin,
};
use crate::services::accounts::AccountAggregator;
use crate::services::allocation::stage_payment;
use crate::services::metrics::{INVOICES_TOTAL, PAYMENTS_TOTAL, STORE_OP_DURATION};
use crate::services::{commit_ops, decode_invoices, load_invoice};
use crate::store::{collections, BatchOp, DocumentStore, Filter};

/// Invoice lifecycle operations. Every mutation runs under the operation
/// gate and forces an aggregate refresh on success.
pub struct InvoiceLedger {
    store: Arc<dyn DocumentStore>,
    gate: OperationGate,
    retry: RetryConfig,
    accounts: Arc<AccountAggregator>,
}

impl InvoiceLedger {
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

    /// Create an invoice. Cash sales settle in full at creation; credit
    /// sales may carry a deposit. Either way the sale-time payment and its
    /// income entry land in the same commit as the invoice.
    #[instrument(skip(self, input), fields(equipment_id = %input.equipment_id))]
    pub async fn create_invoice(&self, input: CreateInvoice) -> Result<Invoice, AppError> {
        let _guard = self.gate.acquire("create_invoice").await?;

        let equipment_id = input.equipment_id.trim().to_string();
        if equipment_id.is_empty() || !equipment_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Equipment id '{}' must be numeric",
                input.equipment_id
            )));
        }

        validate_line_items(&input.line_items)?;

        let today = Utc::now().date_naive();
        if input.sale_date > today && !input.allow_future_date {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Sale date {} is in the future",
                input.sale_date
            )));
        }

        let total = invoice_total(&input.line_items);
        let initial = match (input.payment_kind, input.initial_payment) {
            (PaymentKind::Cash, None) => total,
            (PaymentKind::Cash, Some(_)) => {
                return Err(AppError::Validation(anyhow::anyhow!(
                    "Cash sales settle in full; an initial payment only applies to credit sales"
                )));
            }
            (PaymentKind::Credit, None) => Decimal::ZERO,
            (PaymentKind::Credit, Some(amount)) => {
                if amount < Decimal::ZERO {
                    return Err(AppError::Validation(anyhow::anyhow!(
                        "Initial payment must not be negative"
                    )));
                }
                if amount > total {
                    return Err(AppError::Validation(anyhow::anyhow!(
                        "Initial payment {amount} exceeds the sale total {total}"
                    )));
                }
                amount
            }
        };

        let timer = STORE_OP_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let invoice_number = self.next_invoice_number(input.sale_date).await?;
        self.ensure_number_unique(&invoice_number).await?;

        let now = Utc::now();
        let customer_name = match input.customer_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => default_customer_label(&equipment_id),
        };

        let mut invoice = Invoice {
            id: Uuid::new_v4(),
            invoice_number,
            equipment_id,
            customer_name,
            line_items: input.line_items,
            total,
            payment_kind: input.payment_kind,
            status: InvoiceStatus::Open,
            balance_due: total,
            payments: Vec::new(),
            group_id: None,
            sale_date: input.sale_date,
            created_at: now,
            updated_at: now,
        };

        if initial > Decimal::ZERO {
            let entry = stage_payment(&mut invoice, initial, PaymentOrigin::Initial, now);
            let ops = vec![
                BatchOp::Insert {
                    collection: collections::INVOICES,
                    doc: invoice.to_document()?,
                },
                BatchOp::Insert {
                    collection: collections::INCOME_ENTRIES,
                    doc: entry.to_document()?,
                },
            ];
            commit_ops(&self.store, &self.retry, ops, "create_invoice").await?;
            PAYMENTS_TOTAL
                .with_label_values(&[PaymentOrigin::Initial.as_str()])
                .inc();
        } else {
            let doc = invoice.to_document()?;
            retry_store_call(&self.retry, "insert_invoice", || {
                self.store.insert(collections::INVOICES, doc.clone())
            })
            .await?;
        }

        timer.observe_duration();
        INVOICES_TOTAL
            .with_label_values(&[invoice.status.as_str()])
            .inc();
        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            status = invoice.status.as_str(),
            "Invoice created"
        );

        if input.payment_kind == PaymentKind::Credit {
            self.accounts.refresh(true).await?;
        }

        Ok(invoice)
    }

    /// Replace the line items of a non-terminal invoice and recompute its
    /// totals. Recorded payments are preserved; the settle rule may flip the
    /// status in either direction.
    #[instrument(skip(self, line_items), fields(invoice_id = %id))]
    pub async fn edit_invoice(
        &self,
        id: Uuid,
        line_items: Vec<LineItem>,
    ) -> Result<Invoice, AppError> {
        let _guard = self.gate.acquire("edit_invoice").await?;

        validate_line_items(&line_items)?;

        let mut invoice = load_invoice(&self.store, &self.retry, id).await?;
        if invoice.is_cancelled() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Invoice {} is cancelled and can no longer be edited",
                invoice.invoice_number
            )));
        }

        invoice.line_items = line_items;
        invoice.total = invoice_total(&invoice.line_items);
        invoice.recompute_balance();
        invoice.updated_at = Utc::now();

        let id_str = invoice.id.to_string();
        let patch = invoice.to_patch()?;
        retry_store_call(&self.retry, "update_invoice", || {
            self.store.update(collections::INVOICES, &id_str, patch.clone())
        })
        .await?;

        info!(
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            balance_due = %invoice.balance_due,
            status = invoice.status.as_str(),
            "Invoice line items replaced"
        );

        self.accounts.refresh(true).await?;
        Ok(invoice)
    }

    /// Terminal transition: cancelled, zero balance, cash. Recorded payments
    /// and income entries are left untouched. Cancelling twice is a no-op.
    #[instrument(skip(self), fields(invoice_id = %id))]
    pub async fn cancel_invoice(&self, id: Uuid) -> Result<Invoice, AppError> {
        let _guard = self.gate.acquire("cancel_invoice").await?;

        let mut invoice = load_invoice(&self.store, &self.retry, id).await?;
        if invoice.is_cancelled() {
            info!(invoice_number = %invoice.invoice_number, "Invoice already cancelled");
            return Ok(invoice);
        }

        invoice.status = InvoiceStatus::Cancelled;
        invoice.payment_kind = PaymentKind::Cash;
        invoice.balance_due = Decimal::ZERO;
        invoice.updated_at = Utc::now();

        let id_str = invoice.id.to_string();
        let patch = invoice.to_patch()?;
        retry_store_call(&self.retry, "update_invoice", || {
            self.store.update(collections::INVOICES, &id_str, patch.clone())
        })
        .await?;

        INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
        info!(invoice_number = %invoice.invoice_number, "Invoice cancelled");

        self.accounts.refresh(true).await?;
        Ok(invoice)
    }

    /// Hard delete. Income entries that reference the invoice stay in the
    /// cash ledger.
    #[instrument(skip(self), fields(invoice_id = %id))]
    pub async fn delete_invoice(&self, id: Uuid) -> Result<(), AppError> {
        let _guard = self.gate.acquire("delete_invoice").await?;

        let invoice = load_invoice(&self.store, &self.retry, id).await?;
        let id_str = invoice.id.to_string();
        retry_store_call(&self.retry, "delete_invoice", || {
            self.store.delete(collections::INVOICES, &id_str)
        })
        .await?;

        info!(invoice_number = %invoice.invoice_number, "Invoice deleted");

        self.accounts.refresh(true).await?;
        Ok(())
    }

    pub async fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, AppError> {
        let id_str = id.to_string();
        let doc = retry_store_call(&self.retry, "get_invoice", || {
            self.store.get(collections::INVOICES, &id_str)
        })
        .await?;
        doc.map(Invoice::from_document)
            .transpose()
            .map_err(AppError::from)
    }

    /// All open invoices, oldest first.
    pub async fn list_open_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        let filters = [Filter::eq("status", InvoiceStatus::Open.as_str())];
        let docs = retry_store_call(&self.retry, "list_open_invoices", || {
            self.store.query(collections::INVOICES, &filters)
        })
        .await?;

        let mut invoices = decode_invoices(docs)?;
        invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(invoices)
    }

    /// Next number for the date, from the per-date counter document (read,
    /// then bumped). A failure after the bump leaves a gap in the sequence,
    /// never a duplicate; uniqueness is checked separately before commit.
    async fn next_invoice_number(&self, sale_date: NaiveDate) -> Result<String, AppError> {
        let date_key = sale_date.format("%y%m%d").to_string();

        let existing = retry_store_call(&self.retry, "get_sale_counter", || {
            self.store.get(collections::SALE_COUNTERS, &date_key)
        })
        .await?;

        let seq = match &existing {
            Some(counter) => counter.get_i64("seq").unwrap_or(0) + 1,
            None => 1,
        };

        if existing.is_some() {
            let patch = doc! { "seq": seq };
            retry_store_call(&self.retry, "bump_sale_counter", || {
                self.store
                    .update(collections::SALE_COUNTERS, &date_key, patch.clone())
            })
            .await?;
        } else {
            let counter = doc! { "_id": &date_key, "seq": seq };
            retry_store_call(&self.retry, "init_sale_counter", || {
                self.store.insert(collections::SALE_COUNTERS, counter.clone())
            })
            .await?;
        }

        Ok(format!("{date_key}{seq:04}"))
    }

    async fn ensure_number_unique(&self, invoice_number: &str) -> Result<(), AppError> {
        let filters = [Filter::eq("invoice_number", invoice_number)];
        let hits = retry_store_call(&self.retry, "check_invoice_number", || {
            self.store.query(collections::INVOICES, &filters)
        })
        .await?;

        if !hits.is_empty() {
            warn!(invoice_number, "Invoice number already taken");
            return Err(AppError::DuplicateInvoiceNumber(invoice_number.to_string()));
        }
        Ok(())
    }
}

fn validate_line_items(line_items: &[LineItem]) -> Result<(), AppError> {
    if line_items.is_empty() {
        return Err(AppError::Validation(anyhow::anyhow!(
            "An invoice needs at least one line item"
        )));
    }
    for item in line_items {
        if item.unit_price <= Decimal::ZERO {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Line item '{}' must have a positive price",
                item.description
            )));
        }
        if item.quantity <= Decimal::ZERO {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Line item '{}' must have a positive quantity",
                item.description
            )));
        }
    }
    Ok(())
}
