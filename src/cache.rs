//! Local mirror of every Secret and Namespace in the cluster.
//!
//! A single actor task owns the maps. It applies events from the two watch streams and
//! answers list/get requests arriving over a channel, so readers never share mutable state
//! with the watch side. Pending watch events are always applied before the next request is
//! served, which keeps reads as fresh as the events received so far.

use std::{collections::BTreeMap, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{Resource, ResourceExt, runtime::watcher};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{api::WatchStream, error::CacheError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Secret,
    Namespace,
}

/// What the cache reports to the change notifier after applying a watch event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Secret {
        kind: ChangeKind,
        namespace: String,
        name: String,
    },
    Namespace {
        kind: ChangeKind,
        name: String,
    },
    /// A watch restarted and the whole shelf was replaced by a fresh listing.
    Relisted(ResourceKind),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    namespace: String,
    name: String,
}

enum ShelfChange {
    Object(ChangeKind, ObjectKey),
    InitialSync,
    Relisted,
}

/// Objects of one kind plus the buffer used while a (re)listing is in progress.
struct Shelf<K> {
    objects: BTreeMap<ObjectKey, K>,
    relisting: Option<BTreeMap<ObjectKey, K>>,
    synced: bool,
}

impl<K: Resource<DynamicType = ()> + Clone> Shelf<K> {
    fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            relisting: None,
            synced: false,
        }
    }

    fn key(obj: &K) -> Option<ObjectKey> {
        Some(ObjectKey {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.meta().name.clone()?,
        })
    }

    fn apply(&mut self, event: watcher::Event<K>) -> Option<ShelfChange> {
        match event {
            watcher::Event::Apply(obj) => {
                let key = identify(&obj)?;
                let kind = match self.objects.insert(key.clone(), obj) {
                    Some(_) => ChangeKind::Update,
                    None => ChangeKind::Add,
                };
                Some(ShelfChange::Object(kind, key))
            }
            watcher::Event::Delete(obj) => {
                let key = identify(&obj)?;
                self.objects.remove(&key);
                Some(ShelfChange::Object(ChangeKind::Delete, key))
            }
            watcher::Event::Init => {
                self.relisting = Some(BTreeMap::new());
                None
            }
            watcher::Event::InitApply(obj) => {
                let key = identify(&obj)?;
                self.relisting.get_or_insert_with(BTreeMap::new).insert(key, obj);
                None
            }
            watcher::Event::InitDone => {
                self.objects = self.relisting.take().unwrap_or_default();
                if self.synced {
                    Some(ShelfChange::Relisted)
                } else {
                    self.synced = true;
                    Some(ShelfChange::InitialSync)
                }
            }
        }
    }

    fn in_namespace(&self, namespace: &str) -> impl Iterator<Item = &K> {
        let start = ObjectKey {
            namespace: namespace.to_owned(),
            name: String::new(),
        };
        self.objects
            .range(start..)
            .take_while(move |(key, _)| key.namespace == namespace)
            .map(|(_, obj)| obj)
    }

    fn get(&self, namespace: &str, name: &str) -> Option<&K> {
        self.objects.get(&ObjectKey {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }
}

fn identify<K: Resource<DynamicType = ()> + Clone>(obj: &K) -> Option<ObjectKey> {
    let key = Shelf::<K>::key(obj);
    if key.is_none() {
        warn!("Dropping {} watch event for object without a name", K::kind(&()));
    }
    key
}

enum Request {
    ListSecrets {
        namespace: String,
        reply: oneshot::Sender<Vec<Secret>>,
    },
    GetSecret {
        namespace: String,
        name: String,
        reply: oneshot::Sender<Option<Secret>>,
    },
    ListNamespaces {
        reply: oneshot::Sender<Vec<Namespace>>,
    },
}

/// Cheap, cloneable handle to the cache actor.
#[derive(Clone)]
pub struct WatchCache {
    requests: mpsc::Sender<Request>,
    synced: watch::Receiver<bool>,
}

impl WatchCache {
    /// Starts the actor. It runs until `shutdown` fires or every handle is dropped.
    pub fn spawn(
        secrets: WatchStream<Secret>,
        namespaces: WatchStream<Namespace>,
        notifications: mpsc::UnboundedSender<Notification>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (synced_tx, synced_rx) = watch::channel(false);

        let actor = CacheActor {
            secrets: Shelf::new(),
            namespaces: Shelf::new(),
            notifications,
            synced: synced_tx,
        };
        let handle = tokio::spawn(actor.run(secrets, namespaces, request_rx, shutdown));

        (
            Self {
                requests: request_tx,
                synced: synced_rx,
            },
            handle,
        )
    }

    /// Blocks until both secrets and namespaces finished their first listing.
    pub async fn wait_for_initial_sync(&self, timeout: Duration) -> bool {
        let mut synced = self.synced.clone();
        matches!(
            tokio::time::timeout(timeout, synced.wait_for(|s| *s)).await,
            Ok(Ok(_))
        )
    }

    pub async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, CacheError> {
        self.ask(|reply| Request::ListSecrets {
            namespace: namespace.to_owned(),
            reply,
        })
        .await
    }

    /// Point lookup. Reconciliation works on whole namespaces and uses the list forms.
    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, CacheError> {
        self.ask(|reply| Request::GetSecret {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            reply,
        })
        .await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>, CacheError> {
        self.ask(|reply| Request::ListNamespaces { reply }).await
    }

    async fn ask<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, CacheError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| CacheError::Closed)?;
        response.await.map_err(|_| CacheError::Closed)
    }
}

struct CacheActor {
    secrets: Shelf<Secret>,
    namespaces: Shelf<Namespace>,
    notifications: mpsc::UnboundedSender<Notification>,
    synced: watch::Sender<bool>,
}

impl CacheActor {
    async fn run(
        mut self,
        secrets: WatchStream<Secret>,
        namespaces: WatchStream<Namespace>,
        mut requests: mpsc::Receiver<Request>,
        shutdown: CancellationToken,
    ) {
        let mut secrets = secrets.fuse();
        let mut namespaces = namespaces.fuse();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(event) = secrets.next() => match event {
                    Ok(event) => {
                        let change = self.secrets.apply(event);
                        self.publish(ResourceKind::Secret, change);
                    }
                    Err(e) => error!("Secret watcher error: {}", e),
                },

                Some(event) = namespaces.next() => match event {
                    Ok(event) => {
                        let change = self.namespaces.apply(event);
                        self.publish(ResourceKind::Namespace, change);
                    }
                    Err(e) => error!("Namespace watcher error: {}", e),
                },

                request = requests.recv() => match request {
                    Some(request) => self.serve(request),
                    None => break,
                },
            }
        }

        debug!("Watch cache stopped");
    }

    fn publish(&self, resource: ResourceKind, change: Option<ShelfChange>) {
        let notification = match change {
            None => return,
            Some(ShelfChange::InitialSync) => {
                if self.secrets.synced && self.namespaces.synced {
                    info!(
                        secrets = self.secrets.objects.len(),
                        namespaces = self.namespaces.objects.len(),
                        "Watch cache synced"
                    );
                    self.synced.send_replace(true);
                }
                return;
            }
            Some(ShelfChange::Relisted) => Notification::Relisted(resource),
            Some(ShelfChange::Object(kind, key)) => match resource {
                ResourceKind::Secret => Notification::Secret {
                    kind,
                    namespace: key.namespace,
                    name: key.name,
                },
                ResourceKind::Namespace => Notification::Namespace {
                    kind,
                    name: key.name,
                },
            },
        };

        // The notifier may already be gone during shutdown.
        let _ = self.notifications.send(notification);
    }

    fn serve(&self, request: Request) {
        // A dropped reply receiver only means the caller stopped waiting.
        match request {
            Request::ListSecrets { namespace, reply } => {
                let _ = reply.send(self.secrets.in_namespace(&namespace).cloned().collect());
            }
            Request::GetSecret {
                namespace,
                name,
                reply,
            } => {
                let _ = reply.send(self.secrets.get(&namespace, &name).cloned());
            }
            Request::ListNamespaces { reply } => {
                let _ = reply.send(self.namespaces.objects.values().cloned().collect());
            }
        }
    }
}
