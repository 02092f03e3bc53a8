//! Derived receivable accounts, rebuilt from open invoices.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bson::doc;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use ledger_core::error::AppError;
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::account::normalize_member_id;
use crate::models::{Account, AccountKey, Group, InvoiceStatus, BALANCE_EPSILON};
use crate::services::decode_invoices;
use crate::services::metrics::REFRESH_DURATION;
use crate::store::{collections, DocumentStore, Filter};

/// Snapshot of derived state: open receivables bucketed by account, plus the
/// active groups as of the last refresh.
#[derive(Default)]
struct Aggregates {
    accounts: BTreeMap<AccountKey, Account>,
    groups: Vec<Group>,
}

struct AggregateState {
    aggregates: Aggregates,
    last_refresh: Option<Instant>,
}

/// Rebuilds receivable accounts from open invoices and reconciles cached
/// group totals. Reads are served from the last snapshot; the lock is never
/// held across an await.
pub struct AccountAggregator {
    store: Arc<dyn DocumentStore>,
    retry: RetryConfig,
    debounce: Duration,
    state: RwLock<AggregateState>,
}

impl AccountAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryConfig, debounce: Duration) -> Self {
        Self {
            store,
            retry,
            debounce,
            state: RwLock::new(AggregateState {
                aggregates: Aggregates::default(),
                last_refresh: None,
            }),
        }
    }

    /// Rebuild the snapshot from the store. Unforced refreshes inside the
    /// debounce window are skipped; ledger mutations pass `force`.
    #[instrument(skip(self))]
    pub async fn refresh(&self, force: bool) -> Result<(), AppError> {
        if !force && !self.is_due() {
            debug!("Skipping aggregate refresh inside the debounce window");
            return Ok(());
        }

        let trigger = if force { "forced" } else { "passive" };
        let timer = REFRESH_DURATION.with_label_values(&[trigger]).start_timer();

        let open_filters = [Filter::eq("status", InvoiceStatus::Open.as_str())];
        let invoice_docs = retry_store_call(&self.retry, "open_invoices", || {
            self.store.query(collections::INVOICES, &open_filters)
        })
        .await?;
        let invoices = decode_invoices(invoice_docs)?;

        // The active flag is filtered after decoding: groups written before
        // the flag existed carry no field for a store-level match.
        let group_docs = retry_store_call(&self.retry, "load_groups", || {
            self.store.query(collections::GROUPS, &[])
        })
        .await?;
        let mut groups = group_docs
            .into_iter()
            .map(Group::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        groups.retain(|group| group.active);
        groups.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let mut accounts: BTreeMap<AccountKey, Account> = BTreeMap::new();
        for invoice in invoices {
            let key = AccountKey::new(invoice.equipment_id.clone(), invoice.customer_name.clone());
            accounts
                .entry(key.clone())
                .or_insert_with(|| Account::new(key))
                .push_invoice(invoice);
        }

        // Reconcile cached group totals, persisting only real changes.
        for group in &mut groups {
            let total = total_for(&accounts, &group.equipment_ids);
            if total != group.cached_total {
                let id_str = group.id.to_string();
                let patch = doc! { "cached_total": total.to_string() };
                retry_store_call(&self.retry, "update_group_total", || {
                    self.store.update(collections::GROUPS, &id_str, patch.clone())
                })
                .await?;

                info!(group = %group.name, cached_total = %total, "Group total reconciled");
                group.cached_total = total;
            }
        }

        {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            state.aggregates = Aggregates { accounts, groups };
            state.last_refresh = Some(Instant::now());
        }

        timer.observe_duration();
        Ok(())
    }

    fn is_due(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.last_refresh {
            Some(at) => at.elapsed() >= self.debounce,
            None => true,
        }
    }

    /// All accounts, ordered by key.
    pub fn accounts(&self) -> Vec<Account> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.aggregates.accounts.values().cloned().collect()
    }

    pub fn account(&self, key: &AccountKey) -> Option<Account> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.aggregates.accounts.get(key).cloned()
    }

    /// Accounts whose equipment is not claimed by any active group.
    pub fn accounts_without_group(&self) -> Vec<Account> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let claimed: HashSet<&str> = state
            .aggregates
            .groups
            .iter()
            .flat_map(|g| g.equipment_ids.iter().map(String::as_str))
            .collect();
        state
            .aggregates
            .accounts
            .values()
            .filter(|account| !claimed.contains(account.key.equipment_id.as_str()))
            .cloned()
            .collect()
    }

    /// Sum of open balances across every account owned by the given members,
    /// accepting legacy composite member forms.
    pub fn total_for_members(&self, members: &[String]) -> Decimal {
        let normalized: Vec<String> = members.iter().map(|m| normalize_member_id(m)).collect();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        total_for(&state.aggregates.accounts, &normalized)
    }

    /// Whether any of the members still owes something.
    pub fn members_owe(&self, members: &[String]) -> bool {
        self.total_for_members(members) > BALANCE_EPSILON
    }

    /// Active groups as of the last refresh, totals reconciled.
    pub fn groups(&self) -> Vec<Group> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.aggregates.groups.clone()
    }
}

fn total_for(accounts: &BTreeMap<AccountKey, Account>, members: &[String]) -> Decimal {
    let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
    accounts
        .values()
        .filter(|account| member_set.contains(account.key.equipment_id.as_str()))
        .map(|account| account.total_owed)
        .sum()
}
