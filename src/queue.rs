use std::{
    collections::BTreeSet,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkItem {
    /// Reconcile every target namespace.
    All,
    /// Reconcile a single namespace, whether or not it is currently a target.
    Namespace(String),
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::All => f.write_str("all namespaces"),
            WorkItem::Namespace(ns) => write!(f, "namespace '{ns}'"),
        }
    }
}

#[derive(Default)]
struct Pending {
    all: bool,
    namespaces: BTreeSet<String>,
}

/// Coalescing work queue between the change notifier and the reconcile worker.
///
/// Pushing an item that is already pending is a no-op, and a pending `All` absorbs every
/// namespace-scoped item, so bursts of events collapse into a single pass.
#[derive(Default)]
pub struct WorkQueue {
    pending: Mutex<Pending>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: WorkItem) {
        {
            let mut pending = self.lock();
            match item {
                WorkItem::All => pending.all = true,
                WorkItem::Namespace(ns) => {
                    pending.namespaces.insert(ns);
                }
            }
        }
        self.ready.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.lock();
        !pending.all && pending.namespaces.is_empty()
    }

    /// Resolves once at least one item is pending.
    pub async fn ready(&self) {
        while self.is_empty() {
            self.ready.notified().await;
        }
    }

    /// Takes everything pending, with `All` absorbing namespace items.
    pub fn take(&self) -> Vec<WorkItem> {
        let mut pending = self.lock();
        let Pending { all, namespaces } = std::mem::take(&mut *pending);
        if all {
            vec![WorkItem::All]
        } else {
            namespaces.into_iter().map(WorkItem::Namespace).collect()
        }
    }
}
