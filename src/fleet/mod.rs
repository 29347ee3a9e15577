//! Fan-out of one operation to every storage node.
//!
//! Node discovery failure aborts the whole call. Once dispatched, each node
//! succeeds or fails on its own; the outcomes are collected into a
//! [`FleetReport`] so the caller decides how to present them.

use crate::client::StoreDirectory;
use crate::models::{LodeError, Result, Store, StoreState};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a fleet-wide operation, one entry per dispatched node.
#[derive(Debug)]
pub struct FleetReport<T> {
    /// Sorted by store id
    pub outcomes: Vec<(Store, Result<T>)>,
    /// Nodes excluded by state
    pub skipped: Vec<Store>,
}

impl<T> FleetReport<T> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// Consume the report, keeping only the failures as per-node errors.
    pub fn into_failures(self) -> Vec<LodeError> {
        self.outcomes
            .into_iter()
            .filter_map(|(store, result)| result.err().map(|e| LodeError::per_node(store.address, e)))
            .collect()
    }
}

/// States no admin call can reach.
pub const UNREACHABLE_STATES: &[StoreState] =
    &[StoreState::Disconnected, StoreState::Tombstone];

/// Run `op` against every store whose state is not in `exclude`, at most
/// `concurrency` at a time.
///
/// Fails only when discovery fails or `cancel` fires; node failures are in
/// the report. On cancellation no further nodes are dispatched and in-flight
/// calls are abandoned.
pub async fn for_all_stores<T, F, Fut>(
    cancel: &CancellationToken,
    directory: &dyn StoreDirectory,
    exclude: &[StoreState],
    concurrency: usize,
    op: F,
) -> Result<FleetReport<T>>
where
    T: Send + 'static,
    F: Fn(Store) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let stores = tokio::select! {
        _ = cancel.cancelled() => return Err(LodeError::Cancelled),
        stores = directory.list_stores() => stores?,
    };

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let op = Arc::new(op);
    let mut handles = Vec::with_capacity(stores.len());
    let mut skipped = Vec::new();

    for store in stores {
        if exclude.contains(&store.state) {
            debug!(address = %store.address, state = %store.state, "Skipping store");
            skipped.push(store);
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => permit
                .map_err(|_| LodeError::Internal("Semaphore closed".to_string()))?,
        };

        let op = Arc::clone(&op);
        let token = cancel.clone();
        let target = store.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = token.cancelled() => Err(LodeError::Cancelled),
                result = op(target) => result,
            }
        });
        handles.push((store, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (store, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(address = %store.address, error = %e, "Task panicked");
                Err(LodeError::Internal(format!("task for {} panicked", store.address)))
            }
        };
        if let Err(e) = &result {
            warn!(address = %store.address, error = %e, "Store operation failed");
        }
        outcomes.push((store, result));
    }

    if cancel.is_cancelled() {
        return Err(LodeError::Cancelled);
    }

    outcomes.sort_by_key(|(store, _)| store.id);
    Ok(FleetReport { outcomes, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedDirectory(Vec<Store>);

    #[async_trait]
    impl StoreDirectory for FixedDirectory {
        async fn list_stores(&self) -> Result<Vec<Store>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl StoreDirectory for BrokenDirectory {
        async fn list_stores(&self) -> Result<Vec<Store>> {
            Err(LodeError::BackendUnavailable {
                what: "placement driver".into(),
                source: None,
            })
        }
    }

    fn store(id: u64, state: StoreState) -> Store {
        Store {
            id,
            address: format!("10.0.0.{id}:20160"),
            state,
            version: String::new(),
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let directory = FixedDirectory((1..=5).map(|id| store(id, StoreState::Up)).collect());
        let report = for_all_stores(
            &CancellationToken::new(),
            &directory,
            UNREACHABLE_STATES,
            2,
            |store: Store| async move {
                if store.id == 3 {
                    Err(LodeError::Remote {
                        status: 500,
                        message: "compaction failed".into(),
                    })
                } else {
                    Ok(store.id)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.succeeded(), 4);

        let errors = report.into_failures();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            LodeError::PerNodeFailure { address, .. } if address == "10.0.0.3:20160"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_states_are_skipped() {
        let directory = FixedDirectory(vec![
            store(1, StoreState::Up),
            store(2, StoreState::Tombstone),
            store(3, StoreState::Disconnected),
            store(4, StoreState::Offline),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let report = for_all_stores(
            &CancellationToken::new(),
            &directory,
            UNREACHABLE_STATES,
            4,
            move |_store: Store| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.id).collect();
        assert_eq!(skipped, vec![2, 3]);
        let dispatched: Vec<_> = report.outcomes.iter().map(|(s, _)| s.id).collect();
        assert_eq!(dispatched, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let directory = FixedDirectory((1..=8).map(|id| store(id, StoreState::Up)).collect());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        for_all_stores(
            &CancellationToken::new(),
            &directory,
            UNREACHABLE_STATES,
            3,
            move |_store: Store| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let result = for_all_stores(
            &CancellationToken::new(),
            &BrokenDirectory,
            UNREACHABLE_STATES,
            4,
            |_store: Store| async move { Ok(()) },
        )
        .await;
        assert!(matches!(result, Err(LodeError::BackendUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let directory = FixedDirectory((1..=4).map(|id| store(id, StoreState::Up)).collect());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = for_all_stores(&cancel, &directory, UNREACHABLE_STATES, 1, move |_store: Store| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(result, Err(LodeError::Cancelled)));
    }
}
