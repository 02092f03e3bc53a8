//! Invoice model and balance arithmetic.

use bson::Document;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledger_core::error::StoreError;

use crate::models::account::default_customer_label;
use crate::models::payment::Payment;
use crate::store::collections;

/// Tolerance for balance comparisons. Repeated subtraction of currency
/// amounts can leave sub-cent residue; anything at or below this counts as
/// settled in full.
pub const BALANCE_EPSILON: Decimal = dec!(0.01);

/// How a sale is (or was) paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Cash,
    Credit,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Cash => "cash",
            PaymentKind::Credit => "credit",
        }
    }
}

/// Invoice lifecycle state. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

/// Line item on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub unit_price: Decimal,
    pub quantity: Decimal,
}

impl LineItem {
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * self.quantity
    }
}

/// Sum of line-item subtotals.
pub fn invoice_total(line_items: &[LineItem]) -> Decimal {
    line_items.iter().map(|item| item.subtotal()).sum()
}

/// Total minus recorded payments, floored at zero.
pub fn outstanding(total: Decimal, payments: &[Payment]) -> Decimal {
    let paid: Decimal = payments.iter().map(|p| p.amount).sum();
    (total - paid).max(Decimal::ZERO)
}

/// Invoice document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// `<YYMMDD><4-digit sequence>`, unique across the store.
    pub invoice_number: String,
    pub equipment_id: String,
    pub customer_name: String,
    pub line_items: Vec<LineItem>,
    pub total: Decimal,
    pub payment_kind: PaymentKind,
    pub status: InvoiceStatus,
    pub balance_due: Decimal,
    pub payments: Vec<Payment>,
    /// Back-link maintained by the group registry.
    pub group_id: Option<Uuid>,
    pub sale_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store-facing shape; tolerates documents written by older clients that
/// omitted the balance, the payment list, or the customer name.
#[derive(Debug, Deserialize)]
struct StoredInvoice {
    #[serde(rename = "_id")]
    id: Uuid,
    invoice_number: String,
    equipment_id: String,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    line_items: Vec<LineItem>,
    total: Decimal,
    payment_kind: PaymentKind,
    status: InvoiceStatus,
    #[serde(default)]
    balance_due: Option<Decimal>,
    #[serde(default)]
    payments: Vec<Payment>,
    #[serde(default)]
    group_id: Option<Uuid>,
    sale_date: NaiveDate,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Decode a raw store document, normalizing legacy gaps exactly once:
    /// a missing payment list becomes empty, a missing balance is recomputed
    /// from the total, a missing customer name gets the synthesized label.
    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        let raw: StoredInvoice = bson::from_document(doc).map_err(|e| StoreError::Corrupt {
            collection: collections::INVOICES.to_string(),
            reason: e.to_string(),
        })?;

        let customer_name = match raw.customer_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => default_customer_label(&raw.equipment_id),
        };
        let balance_due = raw
            .balance_due
            .unwrap_or_else(|| outstanding(raw.total, &raw.payments))
            .max(Decimal::ZERO);

        Ok(Self {
            id: raw.id,
            invoice_number: raw.invoice_number,
            equipment_id: raw.equipment_id,
            customer_name,
            line_items: raw.line_items,
            total: raw.total,
            payment_kind: raw.payment_kind,
            status: raw.status,
            balance_due,
            payments: raw.payments,
            group_id: raw.group_id,
            sale_date: raw.sale_date,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        bson::to_document(self)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("encode invoice: {e}")))
    }

    /// Full-document patch: everything but the immutable `_id`.
    pub fn to_patch(&self) -> Result<Document, StoreError> {
        let mut doc = self.to_document()?;
        doc.remove("_id");
        Ok(doc)
    }

    /// Recompute the balance from the payment list and apply the settle rule.
    pub fn recompute_balance(&mut self) {
        self.balance_due = outstanding(self.total, &self.payments);
        self.apply_settle_rule();
    }

    /// Couple balance, status, and kind: a balance at or below the tolerance
    /// means the invoice is settled in full, cash. Cancelled stays cancelled
    /// with a zero balance.
    fn apply_settle_rule(&mut self) {
        if self.status == InvoiceStatus::Cancelled {
            self.balance_due = Decimal::ZERO;
            return;
        }
        if self.balance_due <= BALANCE_EPSILON {
            self.balance_due = Decimal::ZERO;
            self.status = InvoiceStatus::Paid;
            self.payment_kind = PaymentKind::Cash;
        } else {
            self.status = InvoiceStatus::Open;
            self.payment_kind = PaymentKind::Credit;
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == InvoiceStatus::Open
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub equipment_id: String,
    /// Defaults to a label synthesized from the equipment id.
    pub customer_name: Option<String>,
    pub line_items: Vec<LineItem>,
    pub payment_kind: PaymentKind,
    /// Deposit taken at sale time; credit sales only.
    pub initial_payment: Option<Decimal>,
    pub sale_date: NaiveDate,
    /// Future-dated sales are rejected unless explicitly allowed.
    pub allow_future_date: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payment::PaymentOrigin;
    use bson::doc;

    fn sample_invoice(total: Decimal) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            invoice_number: "2608200001".to_string(),
            equipment_id: "65".to_string(),
            customer_name: "Workshop North".to_string(),
            line_items: vec![LineItem {
                description: "Repair".to_string(),
                unit_price: total,
                quantity: dec!(1),
            }],
            total,
            payment_kind: PaymentKind::Credit,
            status: InvoiceStatus::Open,
            balance_due: total,
            payments: Vec::new(),
            group_id: None,
            sale_date: now.date_naive(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn outstanding_floors_at_zero() {
        let payments = vec![Payment::new(dec!(150), PaymentOrigin::Manual, Utc::now())];
        assert_eq!(outstanding(dec!(100), &payments), Decimal::ZERO);
    }

    #[test]
    fn settle_rule_flips_to_paid_cash_at_epsilon() {
        let mut invoice = sample_invoice(dec!(100));
        invoice
            .payments
            .push(Payment::new(dec!(99.99), PaymentOrigin::Manual, Utc::now()));
        invoice.recompute_balance();

        assert_eq!(invoice.balance_due, Decimal::ZERO);
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.payment_kind, PaymentKind::Cash);
    }

    #[test]
    fn settle_rule_reopens_when_balance_returns() {
        let mut invoice = sample_invoice(dec!(100));
        invoice
            .payments
            .push(Payment::new(dec!(100), PaymentOrigin::Manual, Utc::now()));
        invoice.recompute_balance();
        assert_eq!(invoice.status, InvoiceStatus::Paid);

        invoice.payments.clear();
        invoice.recompute_balance();

        assert_eq!(invoice.balance_due, dec!(100));
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.payment_kind, PaymentKind::Credit);
    }

    #[test]
    fn cancelled_invoice_keeps_zero_balance() {
        let mut invoice = sample_invoice(dec!(100));
        invoice.status = InvoiceStatus::Cancelled;
        invoice.recompute_balance();

        assert_eq!(invoice.balance_due, Decimal::ZERO);
        assert_eq!(invoice.status, InvoiceStatus::Cancelled);
    }

    #[test]
    fn decode_normalizes_legacy_document() {
        let doc = doc! {
            "_id": Uuid::new_v4().to_string(),
            "invoice_number": "2608200001",
            "equipment_id": "65",
            "total": "100",
            "payment_kind": "credit",
            "status": "open",
            "sale_date": "2026-08-20",
            "created_at": "2026-08-20T10:00:00Z",
            "updated_at": "2026-08-20T10:00:00Z",
        };

        let invoice = Invoice::from_document(doc).unwrap();
        assert_eq!(invoice.customer_name, "Equipment 65");
        assert_eq!(invoice.balance_due, dec!(100));
        assert!(invoice.payments.is_empty());
    }

    #[test]
    fn decode_recomputes_balance_from_payments() {
        let mut invoice = sample_invoice(dec!(100));
        invoice
            .payments
            .push(Payment::new(dec!(40), PaymentOrigin::Manual, Utc::now()));
        let mut doc = invoice.to_document().unwrap();
        doc.remove("balance_due");

        let decoded = Invoice::from_document(doc).unwrap();
        assert_eq!(decoded.balance_due, dec!(60));
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut invoice = sample_invoice(dec!(250));
        invoice
            .payments
            .push(Payment::new(dec!(75), PaymentOrigin::Initial, Utc::now()));
        invoice.recompute_balance();

        let decoded = Invoice::from_document(invoice.to_document().unwrap()).unwrap();
        assert_eq!(decoded.id, invoice.id);
        assert_eq!(decoded.balance_due, dec!(175));
        assert_eq!(decoded.payments.len(), 1);
        assert_eq!(decoded.payments[0].reference_id, invoice.payments[0].reference_id);
    }
}
