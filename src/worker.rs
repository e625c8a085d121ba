use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio_retry2::{
    Retry, RetryError,
    strategy::{ExponentialBackoff, jitter},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    api::ClusterApi,
    config::{RetryConfig, SyncConfig},
    error::CacheError,
    queue::{WorkItem, WorkQueue},
    reconciler::{PassReport, Reconciler},
};

/// Counts consecutive exhausted work items per namespace.
#[derive(Debug, Default)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: BTreeMap<String, u32>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: BTreeMap::new(),
        }
    }

    /// Records a namespace whose retries ran out. Returns the new streak length and whether
    /// it now counts as persistent.
    pub fn record_failure(&mut self, namespace: &str) -> (u32, bool) {
        let count = self.consecutive.entry(namespace.to_owned()).or_default();
        *count = count.saturating_add(1);
        (*count, *count >= self.threshold)
    }

    /// Clears the namespace's streak. Returns true when it had been persistently failing.
    pub fn record_success(&mut self, namespace: &str) -> bool {
        self.consecutive
            .remove(namespace)
            .is_some_and(|count| count >= self.threshold)
    }

    pub fn consecutive_failures(&self, namespace: &str) -> u32 {
        self.consecutive.get(namespace).copied().unwrap_or(0)
    }
}

/// The single reconcile worker. Items are processed strictly one at a time.
pub struct Worker<A> {
    reconciler: Arc<Reconciler<A>>,
    queue: Arc<WorkQueue>,
    debounce: Duration,
    retry: RetryConfig,
    failures: FailureTracker,
}

impl<A: ClusterApi> Worker<A> {
    pub fn new(reconciler: Arc<Reconciler<A>>, queue: Arc<WorkQueue>, config: &SyncConfig) -> Self {
        Self {
            reconciler,
            queue,
            debounce: config.debounce(),
            retry: config.retry.clone(),
            failures: FailureTracker::new(config.retry.persistent_failure_threshold),
        }
    }

    /// Runs until `shutdown` fires. An item already being reconciled is finished first.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), CacheError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.ready() => {}
            }

            // Let a burst of events settle into one batch.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }

            for item in self.queue.take() {
                if shutdown.is_cancelled() {
                    break;
                }
                self.process(&item, &shutdown).await?;
            }
        }

        info!("Reconcile worker stopped");
        Ok(())
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> + use<A> {
        // 2^n * base/2 yields base, 2*base, 4*base, ...
        ExponentialBackoff::from_millis(2)
            .factor((self.retry.base_delay_millis / 2).max(1))
            .max_delay(Duration::from_millis(self.retry.max_delay_millis))
            .map(jitter)
            .take(self.retry.max_attempts.saturating_sub(1))
    }

    /// Reconciles one item, retrying only the namespaces that failed.
    pub async fn process(
        &mut self,
        item: &WorkItem,
        shutdown: &CancellationToken,
    ) -> Result<(), CacheError> {
        debug!("Processing work item: {}", item);

        let pending = Mutex::new(vec![item.clone()]);
        let reports: Mutex<Vec<PassReport>> = Mutex::new(Vec::new());

        let reconciler = &self.reconciler;
        let (pending_ref, reports_ref) = (&pending, &reports);
        let outcome = Retry::spawn(self.backoff(), || async move {
            let items = std::mem::take(&mut *pending_ref.lock().unwrap_or_else(PoisonError::into_inner));

            let mut failed = BTreeSet::new();
            for item in &items {
                let report = match reconciler.reconcile(item).await {
                    Ok(report) => report,
                    Err(e) => return Err(RetryError::permanent(Some(e))),
                };
                failed.extend(report.failed_namespaces());
                reports_ref
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(report);
            }

            if failed.is_empty() {
                return Ok(());
            }
            warn!(namespaces = ?failed, "Reconcile failed for some namespaces");
            *pending_ref.lock().unwrap_or_else(PoisonError::into_inner) =
                failed.into_iter().map(WorkItem::Namespace).collect();

            if shutdown.is_cancelled() {
                return Err(RetryError::permanent(None));
            }
            Err(RetryError::transient(None))
        })
        .await;

        if let Err(Some(e)) = outcome {
            return Err(e);
        }

        let still_failing: BTreeSet<String> = pending
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .filter_map(|item| match item {
                WorkItem::Namespace(ns) => Some(ns),
                WorkItem::All => None,
            })
            .collect();
        let reports = reports.into_inner().unwrap_or_else(PoisonError::into_inner);
        self.track(&reports, &still_failing);

        Ok(())
    }

    fn track(&mut self, reports: &[PassReport], still_failing: &BTreeSet<String>) {
        let visited: BTreeSet<&str> = reports.iter().flat_map(|r| r.visited_namespaces()).collect();

        for ns in visited {
            if still_failing.contains(ns) {
                let (count, persistent) = self.failures.record_failure(ns);
                if persistent {
                    error!(
                        consecutive = count,
                        "Namespace '{}' is persistently failing to reconcile", ns
                    );
                } else {
                    warn!(
                        attempts = self.retry.max_attempts,
                        "Giving up on namespace '{}' until the next pass", ns
                    );
                }
            } else if self.failures.record_success(ns) {
                info!("Namespace '{}' recovered", ns);
            }
        }
    }
}
