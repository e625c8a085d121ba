use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    api::ClusterApi,
    cache::WatchCache,
    config::SyncConfig,
    error::ControllerError,
    notifier::ChangeNotifier,
    queue::{WorkItem, WorkQueue},
    reconciler::Reconciler,
    worker::Worker,
};

pub struct Controller<A> {
    api: Arc<A>,
    config: SyncConfig,
}

impl<A: ClusterApi> Controller<A> {
    pub fn new(api: Arc<A>, config: SyncConfig) -> Self {
        Self { api, config }
    }

    /// Runs the control loop until `shutdown` fires.
    ///
    /// Fails without reconciling anything if the cache cannot complete its first listing in
    /// time. On shutdown the notifier stops enqueueing, the worker finishes its current item,
    /// and only then are the watches released.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let cache_shutdown = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (cache, cache_task) = WatchCache::spawn(
            self.api.watch_secrets(),
            self.api.watch_namespaces(),
            notify_tx,
            cache_shutdown.clone(),
        );

        info!("Waiting for cache sync");
        let timeout = self.config.initial_sync_timeout();
        let synced = tokio::select! {
            synced = cache.wait_for_initial_sync(timeout) => synced,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before cache sync");
                cache_shutdown.cancel();
                return join("watch cache", cache_task).await;
            }
        };

        if !synced {
            error!("Timeout waiting for cache sync");
            cache_shutdown.cancel();
            join("watch cache", cache_task).await?;
            return Err(ControllerError::InitialSyncTimeout(timeout));
        }
        info!("Caches are synced");

        let queue = Arc::new(WorkQueue::new());
        queue.push(WorkItem::All);

        let reconciler = Arc::new(Reconciler::new(self.api.clone(), cache, &self.config));
        let stop = shutdown.child_token();

        let notifier = tokio::spawn(
            ChangeNotifier::new(queue.clone(), &self.config).run(notify_rx, stop.clone()),
        );
        let worker = tokio::spawn(Worker::new(reconciler, queue, &self.config).run(stop.clone()));

        let worked = worker.await;
        // The worker only returns early if the cache died; take the notifier down with it.
        stop.cancel();
        join("change notifier", notifier).await?;

        cache_shutdown.cancel();
        join("watch cache", cache_task).await?;

        worked
            .map_err(|source| ControllerError::Task {
                task: "reconcile worker",
                source,
            })?
            .map_err(ControllerError::from)?;

        info!("Controller stopped");
        Ok(())
    }
}

async fn join(task: &'static str, handle: tokio::task::JoinHandle<()>) -> Result<(), ControllerError> {
    handle
        .await
        .map_err(|source| ControllerError::Task { task, source })
}
