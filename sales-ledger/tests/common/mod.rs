//! Shared harness for ledger integration tests.

use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::Secret;

use ledger_core::retry::RetryConfig;
use sales_ledger::config::{AggregatorConfig, Config, DatabaseConfig, GateConfig};
use sales_ledger::engine::SalesLedger;
use sales_ledger::models::{CreateInvoice, Invoice, LineItem, PaymentKind};
use sales_ledger::store::memory::MemoryStore;

static TRACING: Once = Once::new();

fn init_test_tracing() {
    TRACING.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// An engine over an in-memory store, plus the store itself for seeding
/// documents behind the engine's back.
pub struct TestLedger {
    pub ledger: SalesLedger,
    pub store: Arc<MemoryStore>,
}

pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            url: Secret::new("mongodb://localhost:27017".to_string()),
            db_name: format!("sales_ledger_test_{}", uuid::Uuid::new_v4()),
        },
        gate: GateConfig {
            max_wait: Duration::from_millis(500),
        },
        retry: RetryConfig::quick(),
        aggregator: AggregatorConfig {
            debounce: Duration::from_secs(30),
        },
        service_name: "sales-ledger-test".to_string(),
        log_level: "warn".to_string(),
    }
}

pub fn spawn_ledger() -> TestLedger {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new());
    let ledger = SalesLedger::new(store.clone(), &test_config());
    TestLedger { ledger, store }
}

/// Same engine over a store that refuses atomic batches, exercising the
/// sequential write fallback.
pub fn spawn_sequential_ledger() -> TestLedger {
    init_test_tracing();
    let store = Arc::new(MemoryStore::without_batches());
    let ledger = SalesLedger::new(store.clone(), &test_config());
    TestLedger { ledger, store }
}

pub fn line(description: &str, price: Decimal) -> LineItem {
    LineItem {
        description: description.to_string(),
        unit_price: price,
        quantity: dec!(1),
    }
}

pub fn sale_date() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn credit_sale(equipment_id: &str, amount: Decimal) -> CreateInvoice {
    CreateInvoice {
        equipment_id: equipment_id.to_string(),
        customer_name: None,
        line_items: vec![line("Repair", amount)],
        payment_kind: PaymentKind::Credit,
        initial_payment: None,
        sale_date: sale_date(),
        allow_future_date: false,
    }
}

pub fn cash_sale(equipment_id: &str, amount: Decimal) -> CreateInvoice {
    CreateInvoice {
        payment_kind: PaymentKind::Cash,
        ..credit_sale(equipment_id, amount)
    }
}

/// Create a credit invoice, spacing creations so allocation order (which
/// follows `created_at`) is deterministic.
pub async fn create_credit_invoice(
    ledger: &SalesLedger,
    equipment_id: &str,
    amount: Decimal,
) -> Invoice {
    tokio::time::sleep(Duration::from_millis(5)).await;
    ledger
        .invoices
        .create_invoice(credit_sale(equipment_id, amount))
        .await
        .expect("Failed to create invoice")
}
