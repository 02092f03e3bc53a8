//! Mutation serialization for the ledger engine.
//!
//! Every state-changing operation funnels through a single-permit gate so
//! invoice numbering, balance updates, and group reconciliation never
//! interleave within the process. Acquisition is bounded: a caller that
//! cannot get the permit in time is rejected instead of queueing forever.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::warn;

use crate::error::AppError;

/// Single-permit gate with a bounded acquisition wait.
///
/// Cloning shares the underlying permit; clones gate against each other.
#[derive(Clone, Debug)]
pub struct OperationGate {
    permit: Arc<Semaphore>,
    max_wait: Duration,
}

/// Proof that the gate is held. The permit returns to the gate when this
/// guard drops, on success and error paths alike.
#[derive(Debug)]
pub struct GateGuard {
    _permit: OwnedSemaphorePermit,
}

impl OperationGate {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            max_wait,
        }
    }

    /// Wait for exclusive access, giving up after the configured bound.
    pub async fn acquire(&self, operation: &str) -> Result<GateGuard, AppError> {
        match timeout(self.max_wait, Arc::clone(&self.permit).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(GateGuard { _permit: permit }),
            Ok(Err(_)) => {
                // The semaphore is never closed; treat it like contention anyway.
                warn!(operation, "operation gate closed unexpectedly");
                Err(AppError::LockBusy(self.max_wait))
            }
            Err(_) => {
                warn!(
                    operation,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "operation gate busy, rejecting"
                );
                Err(AppError::LockBusy(self.max_wait))
            }
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_when_free() {
        let gate = OperationGate::new(Duration::from_millis(100));
        assert!(gate.acquire("first").await.is_ok());
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let gate = OperationGate::new(Duration::from_millis(50));
        let _held = gate.acquire("first").await.unwrap();
        let err = gate.acquire("second").await.unwrap_err();
        assert!(matches!(err, AppError::LockBusy(_)));
    }

    #[tokio::test]
    async fn permit_returns_on_guard_drop() {
        let gate = OperationGate::new(Duration::from_millis(50));
        {
            let _held = gate.acquire("first").await.unwrap();
        }
        assert!(gate.acquire("second").await.is_ok());
    }

    #[tokio::test]
    async fn waiting_acquire_proceeds_once_released() {
        let gate = OperationGate::new(Duration::from_millis(500));
        let held = gate.acquire("first").await.unwrap();

        let contender = gate.clone();
        let waiter = tokio::spawn(async move { contender.acquire("second").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }
}
