//! Engine wiring: construction and the change-feed listener.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ledger_core::error::AppError;
use ledger_core::gate::OperationGate;

use crate::config::Config;
use crate::services::{
    init_metrics, AccountAggregator, CashLedger, GroupRegistry, InvoiceLedger, PaymentAllocator,
};
use crate::store::mongo::MongoStore;
use crate::store::{collections, DocumentStore};

/// The assembled engine: one operation gate, one aggregator, and the
/// services that share them. Construct once per process.
pub struct SalesLedger {
    store: Arc<dyn DocumentStore>,
    pub invoices: InvoiceLedger,
    pub payments: PaymentAllocator,
    pub groups: GroupRegistry,
    pub cash: CashLedger,
    pub accounts: Arc<AccountAggregator>,
}

impl SalesLedger {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        init_metrics();

        let gate = OperationGate::new(config.gate.max_wait);
        let accounts = Arc::new(AccountAggregator::new(
            Arc::clone(&store),
            config.retry.clone(),
            config.aggregator.debounce,
        ));

        let invoices = InvoiceLedger::new(
            Arc::clone(&store),
            gate.clone(),
            config.retry.clone(),
            Arc::clone(&accounts),
        );
        let payments = PaymentAllocator::new(
            Arc::clone(&store),
            gate.clone(),
            config.retry.clone(),
            Arc::clone(&accounts),
        );
        let groups = GroupRegistry::new(
            Arc::clone(&store),
            gate.clone(),
            config.retry.clone(),
            Arc::clone(&accounts),
        );
        let cash = CashLedger::new(Arc::clone(&store), gate, config.retry.clone());

        Self {
            store,
            invoices,
            payments,
            groups,
            cash,
            accounts,
        }
    }

    /// Connect to the backing database and assemble the engine.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        let store = MongoStore::connect(&config.database).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Start the invoice change feed. A write observed from elsewhere forces
    /// an aggregate refresh; these refreshes run outside the operation gate.
    pub fn spawn_change_listener(&self) -> JoinHandle<()> {
        let mut events = self.store.subscribe(collections::INVOICES);
        let accounts = Arc::clone(&self.accounts);

        tokio::spawn(async move {
            info!("Invoice change listener started");
            loop {
                match events.recv().await {
                    Ok(_) => {
                        if let Err(e) = accounts.refresh(true).await {
                            warn!(error = %e, "Change-driven aggregate refresh failed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Change feed lagged; refreshing from current state");
                        if let Err(e) = accounts.refresh(true).await {
                            warn!(error = %e, "Change-driven aggregate refresh failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Change feed closed; listener stopping");
                        break;
                    }
                }
            }
        })
    }
}
