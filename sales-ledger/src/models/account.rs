//! Derived receivable accounts and account-key normalization.
//!
//! Older records stored account keys and group members as the bare equipment
//! id (`"65"`); newer ones use the composite `"65-Equipment 65"` form. Both
//! forms funnel through [`AccountKey::parse`] exactly once, at ingestion
//! ([`normalize_member_id`] is its id-only shorthand), so the rest of the
//! engine compares plain fields.

use rust_decimal::Decimal;

use crate::models::invoice::Invoice;

/// Canonical identity of a receivable account: one piece of equipment plus
/// the customer it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    pub equipment_id: String,
    pub customer_name: String,
}

impl AccountKey {
    pub fn new(equipment_id: impl Into<String>, customer_name: impl Into<String>) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            customer_name: customer_name.into(),
        }
    }

    /// Parse a stored key, accepting both the bare equipment id and the
    /// composite `<equipment>-<customer>` form.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('-') {
            Some((equipment, customer)) if !customer.trim().is_empty() => {
                Self::new(equipment.trim(), customer.trim())
            }
            Some((equipment, _)) => {
                let equipment = equipment.trim();
                Self::new(equipment, default_customer_label(equipment))
            }
            None => {
                let equipment = raw.trim();
                Self::new(equipment, default_customer_label(equipment))
            }
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.equipment_id, self.customer_name)
    }
}

/// Reduce a stored member/key string to its equipment id.
pub fn normalize_member_id(raw: &str) -> String {
    AccountKey::parse(raw).equipment_id
}

/// Label used when a sale was recorded without a customer name.
pub fn default_customer_label(equipment_id: &str) -> String {
    format!("Equipment {equipment_id}")
}

/// Open receivables for one account, derived from open invoices. Never
/// persisted; rebuilt by the aggregator on refresh.
#[derive(Debug, Clone)]
pub struct Account {
    pub key: AccountKey,
    pub open_invoices: Vec<Invoice>,
    pub total_owed: Decimal,
}

impl Account {
    pub fn new(key: AccountKey) -> Self {
        Self {
            key,
            open_invoices: Vec::new(),
            total_owed: Decimal::ZERO,
        }
    }

    pub fn push_invoice(&mut self, invoice: Invoice) {
        self.total_owed += invoice.balance_due;
        self.open_invoices.push(invoice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_key() {
        let key = AccountKey::parse("65-Workshop North");
        assert_eq!(key.equipment_id, "65");
        assert_eq!(key.customer_name, "Workshop North");
    }

    #[test]
    fn parses_bare_equipment_id() {
        let key = AccountKey::parse("65");
        assert_eq!(key.equipment_id, "65");
        assert_eq!(key.customer_name, "Equipment 65");
    }

    #[test]
    fn parses_trailing_separator_as_bare() {
        let key = AccountKey::parse("65-");
        assert_eq!(key.equipment_id, "65");
        assert_eq!(key.customer_name, "Equipment 65");
    }

    #[test]
    fn keeps_separators_inside_customer_name() {
        let key = AccountKey::parse("65-Perez-Garcia");
        assert_eq!(key.equipment_id, "65");
        assert_eq!(key.customer_name, "Perez-Garcia");
    }

    #[test]
    fn normalizes_member_ids() {
        assert_eq!(normalize_member_id("65"), "65");
        assert_eq!(normalize_member_id("65-Equipment 65"), "65");
        assert_eq!(normalize_member_id(" 65 "), "65");
    }
}
