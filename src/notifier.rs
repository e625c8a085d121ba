use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::{ChangeKind, Notification},
    config::SyncConfig,
    queue::{WorkItem, WorkQueue},
};

/// Turns cache notifications into work items.
///
/// Every notification enqueues something: changes at the source fan out to a full pass,
/// anything else is scoped to the namespace it happened in.
pub struct ChangeNotifier {
    queue: Arc<WorkQueue>,
    source_namespace: String,
    resync: Option<Duration>,
}

impl ChangeNotifier {
    pub fn new(queue: Arc<WorkQueue>, config: &SyncConfig) -> Self {
        Self {
            queue,
            source_namespace: config.source_namespace.clone(),
            resync: config.resync_interval(),
        }
    }

    pub fn work_for(&self, notification: &Notification) -> WorkItem {
        match notification {
            Notification::Secret { namespace, .. } if *namespace == self.source_namespace => WorkItem::All,
            Notification::Secret { namespace, .. } => WorkItem::Namespace(namespace.clone()),
            Notification::Namespace { name, .. } => WorkItem::Namespace(name.clone()),
            Notification::Relisted(_) => WorkItem::All,
        }
    }

    fn log(&self, notification: &Notification) {
        match notification {
            Notification::Secret {
                kind,
                namespace,
                name,
            } if *namespace == self.source_namespace => {
                info!("Source secret '{}' {}", name, describe(*kind));
            }
            Notification::Secret {
                kind,
                namespace,
                name,
            } => debug!("Secret '{}/{}' {}", namespace, name, describe(*kind)),
            Notification::Namespace { kind, name } => {
                info!("Namespace '{}' {}", name, describe(*kind));
            }
            Notification::Relisted(resource) => {
                info!("{:?} watch relisted, scheduling full reconcile", resource);
            }
        }
    }

    /// Forwards notifications until `shutdown` fires or the cache goes away.
    pub async fn run(
        self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        shutdown: CancellationToken,
    ) {
        let mut resync = self.resync.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        self.log(&notification);
                        self.queue.push(self.work_for(&notification));
                    }
                    None => break,
                },

                _ = tick(resync.as_mut()) => {
                    debug!("Periodic resync");
                    self.queue.push(WorkItem::All);
                }
            }
        }

        debug!("Change notifier stopped");
    }
}

async fn tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn describe(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Add => "added",
        ChangeKind::Update => "updated",
        ChangeKind::Delete => "deleted",
    }
}
