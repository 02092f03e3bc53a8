//! Cash ledger integration tests.

mod common;

use chrono::{NaiveDate, TimeZone, Utc};
use common::{cash_sale, spawn_ledger};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ledger_core::error::AppError;
use sales_ledger::models::RecordCashEntry;

fn entry(concept: &str, amount: Decimal, category: &str) -> RecordCashEntry {
    RecordCashEntry {
        concept: concept.to_string(),
        amount,
        category: category.to_string(),
        date: None,
    }
}

#[tokio::test]
async fn manual_income_and_withdrawals_round_trip() {
    let app = spawn_ledger();

    let income = app
        .ledger
        .cash
        .record_income(entry("Scrap metal sale", dec!(25), "other"))
        .await
        .expect("Failed to record income");
    assert_eq!(income.amount, dec!(25));
    assert_eq!(income.invoice_id, None);
    assert_eq!(income.reference_id, None);

    let withdrawal = app
        .ledger
        .cash
        .record_withdrawal(entry("Parts run", dec!(40), "supplies"))
        .await
        .expect("Failed to record withdrawal");
    assert_eq!(withdrawal.amount, dec!(40));

    assert_eq!(
        app.ledger
            .cash
            .income_entries()
            .await
            .expect("Failed to list income")
            .len(),
        1
    );
    assert_eq!(
        app.ledger
            .cash
            .withdrawals()
            .await
            .expect("Failed to list withdrawals")
            .len(),
        1
    );
}

#[tokio::test]
async fn blank_concepts_and_nonpositive_amounts_are_rejected() {
    let app = spawn_ledger();

    let err = app
        .ledger
        .cash
        .record_income(entry("   ", dec!(10), "other"))
        .await
        .expect_err("Expected validation error");
    assert!(matches!(err, AppError::Validation(_)));

    let err = app
        .ledger
        .cash
        .record_withdrawal(entry("Parts run", Decimal::ZERO, "supplies"))
        .await
        .expect_err("Expected validation error");
    assert!(matches!(err, AppError::Validation(_)));

    let err = app
        .ledger
        .cash
        .record_income(entry("Refund", dec!(-5), "other"))
        .await
        .expect_err("Expected validation error");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn day_filters_pick_out_one_business_day() {
    let app = spawn_ledger();

    let monday = Utc.with_ymd_and_hms(2026, 8, 24, 9, 30, 0).unwrap();
    let tuesday = Utc.with_ymd_and_hms(2026, 8, 25, 16, 0, 0).unwrap();

    app.ledger
        .cash
        .record_income(RecordCashEntry {
            date: Some(monday),
            ..entry("Scrap metal sale", dec!(25), "other")
        })
        .await
        .expect("Failed to record income");
    app.ledger
        .cash
        .record_income(RecordCashEntry {
            date: Some(tuesday),
            ..entry("Vending machine", dec!(12), "other")
        })
        .await
        .expect("Failed to record income");
    app.ledger
        .cash
        .record_withdrawal(RecordCashEntry {
            date: Some(tuesday),
            ..entry("Parts run", dec!(40), "supplies")
        })
        .await
        .expect("Failed to record withdrawal");

    let monday_key = NaiveDate::from_ymd_opt(2026, 8, 24).unwrap();
    let tuesday_key = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();

    let monday_income = app
        .ledger
        .cash
        .income_on(monday_key)
        .await
        .expect("Failed to filter income");
    assert_eq!(monday_income.len(), 1);
    assert_eq!(monday_income[0].concept, "Scrap metal sale");

    let monday_withdrawals = app
        .ledger
        .cash
        .withdrawals_on(monday_key)
        .await
        .expect("Failed to filter withdrawals");
    assert!(monday_withdrawals.is_empty());

    let tuesday_withdrawals = app
        .ledger
        .cash
        .withdrawals_on(tuesday_key)
        .await
        .expect("Failed to filter withdrawals");
    assert_eq!(tuesday_withdrawals.len(), 1);
}

#[tokio::test]
async fn invoice_payments_and_manual_entries_share_the_ledger() {
    let app = spawn_ledger();

    app.ledger
        .invoices
        .create_invoice(cash_sale("65", dec!(120)))
        .await
        .expect("Failed to create invoice");
    app.ledger
        .cash
        .record_income(entry("Scrap metal sale", dec!(25), "other"))
        .await
        .expect("Failed to record income");

    let income = app
        .ledger
        .cash
        .income_entries()
        .await
        .expect("Failed to list income");
    assert_eq!(income.len(), 2);

    let categories: Vec<&str> = income.iter().map(|e| e.category.as_str()).collect();
    assert!(categories.contains(&"sales"));
    assert!(categories.contains(&"other"));
}
