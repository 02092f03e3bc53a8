//! Manual cash ledger: other income and withdrawals.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use ledger_core::error::AppError;
use ledger_core::gate::OperationGate;
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::{IncomeEntry, RecordCashEntry, Withdrawal};
use crate::store::{collections, DocumentStore};

/// Income and withdrawal records that are not tied to invoice activity.
/// Invoice payments land in the same income collection, but through the
/// allocator.
pub struct CashLedger {
    store: Arc<dyn DocumentStore>,
    gate: OperationGate,
    retry: RetryConfig,
}

impl CashLedger {
    pub fn new(store: Arc<dyn DocumentStore>, gate: OperationGate, retry: RetryConfig) -> Self {
        Self { store, gate, retry }
    }

    /// Record income unrelated to an invoice payment.
    #[instrument(skip(self, input))]
    pub async fn record_income(&self, input: RecordCashEntry) -> Result<IncomeEntry, AppError> {
        let _guard = self.gate.acquire("record_income").await?;
        validate_entry(&input)?;

        let entry = IncomeEntry {
            id: Uuid::new_v4(),
            concept: input.concept.trim().to_string(),
            amount: input.amount,
            category: input.category.trim().to_string(),
            date: input.date.unwrap_or_else(Utc::now),
            invoice_id: None,
            reference_id: None,
        };

        let doc = entry.to_document()?;
        retry_store_call(&self.retry, "insert_income_entry", || {
            self.store.insert(collections::INCOME_ENTRIES, doc.clone())
        })
        .await?;

        info!(amount = %entry.amount, category = %entry.category, "Income entry recorded");
        Ok(entry)
    }

    /// Record money taken out of the till.
    #[instrument(skip(self, input))]
    pub async fn record_withdrawal(&self, input: RecordCashEntry) -> Result<Withdrawal, AppError> {
        let _guard = self.gate.acquire("record_withdrawal").await?;
        validate_entry(&input)?;

        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            concept: input.concept.trim().to_string(),
            amount: input.amount,
            category: input.category.trim().to_string(),
            date: input.date.unwrap_or_else(Utc::now),
        };

        let doc = withdrawal.to_document()?;
        retry_store_call(&self.retry, "insert_withdrawal", || {
            self.store.insert(collections::WITHDRAWALS, doc.clone())
        })
        .await?;

        info!(amount = %withdrawal.amount, category = %withdrawal.category, "Withdrawal recorded");
        Ok(withdrawal)
    }

    /// All income entries, newest first.
    pub async fn income_entries(&self) -> Result<Vec<IncomeEntry>, AppError> {
        let docs = retry_store_call(&self.retry, "list_income_entries", || {
            self.store.query(collections::INCOME_ENTRIES, &[])
        })
        .await?;

        let mut entries = docs
            .into_iter()
            .map(IncomeEntry::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(entries)
    }

    /// Income received on one business day, newest first.
    pub async fn income_on(&self, day: NaiveDate) -> Result<Vec<IncomeEntry>, AppError> {
        let mut entries = self.income_entries().await?;
        entries.retain(|entry| entry.date.date_naive() == day);
        Ok(entries)
    }

    /// All withdrawals, newest first.
    pub async fn withdrawals(&self) -> Result<Vec<Withdrawal>, AppError> {
        let docs = retry_store_call(&self.retry, "list_withdrawals", || {
            self.store.query(collections::WITHDRAWALS, &[])
        })
        .await?;

        let mut withdrawals = docs
            .into_iter()
            .map(Withdrawal::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        withdrawals.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(withdrawals)
    }

    /// Withdrawals made on one business day, newest first.
    pub async fn withdrawals_on(&self, day: NaiveDate) -> Result<Vec<Withdrawal>, AppError> {
        let mut withdrawals = self.withdrawals().await?;
        withdrawals.retain(|withdrawal| withdrawal.date.date_naive() == day);
        Ok(withdrawals)
    }
}

fn validate_entry(input: &RecordCashEntry) -> Result<(), AppError> {
    if input.concept.trim().is_empty() {
        return Err(AppError::Validation(anyhow::anyhow!(
            "Concept must not be blank"
        )));
    }
    if input.amount <= Decimal::ZERO {
        return Err(AppError::Validation(anyhow::anyhow!(
            "Amount must be greater than zero"
        )));
    }
    Ok(())
}
