#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    stream,
};
use k8s_openapi::{
    ByteString,
    api::core::v1::{Namespace, Secret},
};
use kube::{ResourceExt, api::ObjectMeta, core::ErrorResponse, runtime::watcher};
use secretsync::{
    api::{ClusterApi, CreateOutcome, DeleteOutcome, WatchStream},
    cache::WatchCache,
    config::SyncConfig,
    error::ApiError,
};
use tokio::sync::mpsc;
use tokio_retry2::{Retry, RetryError, strategy::FixedInterval};
use tokio_util::sync::CancellationToken;

pub const MARKER: &str = "casek14/secretsync";
pub const SOURCE: &str = "secretsync";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create { namespace: String, name: String },
    Update { namespace: String, name: String },
    Delete { namespace: String, name: String },
}

impl Call {
    pub fn namespace(&self) -> &str {
        match self {
            Call::Create { namespace, .. }
            | Call::Update { namespace, .. }
            | Call::Delete { namespace, .. } => namespace,
        }
    }
}

pub fn create(namespace: &str, name: &str) -> Call {
    Call::Create {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

pub fn update(namespace: &str, name: &str) -> Call {
    Call::Update {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

pub fn delete(namespace: &str, name: &str) -> Call {
    Call::Delete {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

type Feed<K> = UnboundedSender<Result<watcher::Event<K>, watcher::Error>>;
type Tap<K> = UnboundedReceiver<Result<watcher::Event<K>, watcher::Error>>;

#[derive(Default)]
struct State {
    secrets: BTreeMap<(String, String), Secret>,
    namespaces: BTreeMap<String, Namespace>,
    calls: Vec<Call>,
    /// namespace -> remaining failing calls, `None` meaning every call fails
    failing: BTreeMap<String, Option<usize>>,
    secrets_watched: bool,
    namespaces_watched: bool,
    version: u64,
}

impl State {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.version += 1;
        meta.resource_version = Some(self.version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.version));
        }
    }

    fn should_fail(&mut self, namespace: &str) -> bool {
        let Some(remaining) = self.failing.get(namespace).copied() else {
            return false;
        };
        match remaining {
            None => true,
            Some(0) => {
                self.failing.remove(namespace);
                false
            }
            Some(n) => {
                self.failing.insert(namespace.to_owned(), Some(n - 1));
                true
            }
        }
    }
}

/// In-memory cluster. Every mutation is reflected back through the watch streams.
pub struct FakeCluster {
    state: Mutex<State>,
    secret_feed: Feed<Secret>,
    namespace_feed: Feed<Namespace>,
    secret_tap: Mutex<Option<Tap<Secret>>>,
    namespace_tap: Mutex<Option<Tap<Namespace>>>,
    complete_listing: bool,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// A cluster whose initial listing never finishes.
    pub fn never_syncing() -> Arc<Self> {
        Self::build(false)
    }

    fn build(complete_listing: bool) -> Arc<Self> {
        let (secret_feed, secret_tap) = unbounded();
        let (namespace_feed, namespace_tap) = unbounded();
        Arc::new(Self {
            state: Mutex::new(State::default()),
            secret_feed,
            namespace_feed,
            secret_tap: Mutex::new(Some(secret_tap)),
            namespace_tap: Mutex::new(Some(namespace_tap)),
            complete_listing,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put_namespace(&self, namespace: Namespace) {
        let mut state = self.state();
        let mut namespace = namespace;
        state.stamp(&mut namespace.metadata);
        state.namespaces.insert(namespace.name_any(), namespace.clone());
        if state.namespaces_watched {
            self.namespace_feed
                .unbounded_send(Ok(watcher::Event::Apply(namespace)))
                .unwrap();
        }
    }

    pub fn put_secret(&self, secret: Secret) {
        let mut state = self.state();
        self.store(&mut state, secret, true);
    }

    /// Stores a secret without the watch seeing it, as if the event were still in flight.
    pub fn put_secret_unobserved(&self, secret: Secret) {
        let mut state = self.state();
        self.store(&mut state, secret, false);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        self.evict(&mut state, namespace, name);
    }

    /// Removes a secret without the watch seeing it.
    pub fn remove_secret_unobserved(&self, namespace: &str, name: &str) {
        self.state()
            .secrets
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    fn store(&self, state: &mut State, mut secret: Secret, observed: bool) {
        state.stamp(&mut secret.metadata);
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        state.secrets.insert(key, secret.clone());
        if observed && state.secrets_watched {
            self.secret_feed
                .unbounded_send(Ok(watcher::Event::Apply(secret)))
                .unwrap();
        }
    }

    fn evict(&self, state: &mut State, namespace: &str, name: &str) -> bool {
        let removed = state
            .secrets
            .remove(&(namespace.to_owned(), name.to_owned()));
        if let Some(secret) = &removed {
            if state.secrets_watched {
                self.secret_feed
                    .unbounded_send(Ok(watcher::Event::Delete(secret.clone())))
                    .unwrap();
            }
        }
        removed.is_some()
    }

    /// Makes every mutating call in `namespace` fail until [`FakeCluster::heal`].
    pub fn break_namespace(&self, namespace: &str) {
        self.state().failing.insert(namespace.to_owned(), None);
    }

    /// Makes the next `count` mutating calls in `namespace` fail.
    pub fn fail_next(&self, namespace: &str, count: usize) {
        self.state().failing.insert(namespace.to_owned(), Some(count));
    }

    pub fn heal(&self, namespace: &str) {
        self.state().failing.remove(namespace);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state().calls)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn check(&self, state: &mut State, operation: &'static str, namespace: &str) -> Result<(), ApiError> {
        if state.should_fail(namespace) {
            return Err(ApiError::Timeout {
                operation,
                after: Duration::from_secs(10),
            });
        }
        Ok(())
    }
}

fn not_found(name: &str) -> ApiError {
    ApiError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: format!("secrets \"{name}\" not found"),
        reason: "NotFound".to_owned(),
        code: 404,
    }))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ApiError> {
        Ok(self
            .state()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        Ok(self.state().namespaces.values().cloned().collect())
    }

    fn watch_secrets(&self) -> WatchStream<Secret> {
        let tap = self
            .secret_tap
            .lock()
            .unwrap()
            .take()
            .expect("secrets already watched");
        let mut state = self.state();
        state.secrets_watched = true;
        let listing = state.secrets.values().cloned().collect();
        initial_listing(listing, tap, self.complete_listing)
    }

    fn watch_namespaces(&self) -> WatchStream<Namespace> {
        let tap = self
            .namespace_tap
            .lock()
            .unwrap()
            .take()
            .expect("namespaces already watched");
        let mut state = self.state();
        state.namespaces_watched = true;
        let listing = state.namespaces.values().cloned().collect();
        initial_listing(listing, tap, self.complete_listing)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, ApiError> {
        let (namespace, name) = (secret.namespace().unwrap_or_default(), secret.name_any());
        let mut state = self.state();
        state.calls.push(create(&namespace, &name));
        self.check(&mut state, "create secret", &namespace)?;

        if state.secrets.contains_key(&(namespace, name)) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        self.store(&mut state, secret.clone(), true);
        Ok(CreateOutcome::Created)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), ApiError> {
        let (namespace, name) = (secret.namespace().unwrap_or_default(), secret.name_any());
        let mut state = self.state();
        state.calls.push(update(&namespace, &name));
        self.check(&mut state, "update secret", &namespace)?;

        let Some(existing) = state.secrets.get(&(namespace, name.clone())) else {
            return Err(not_found(&name));
        };
        let mut replacement = secret.clone();
        replacement.metadata.uid = existing.metadata.uid.clone();
        self.store(&mut state, replacement, true);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ApiError> {
        let mut state = self.state();
        state.calls.push(delete(namespace, name));
        self.check(&mut state, "delete secret", namespace)?;

        if self.evict(&mut state, namespace, name) {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }
}

fn initial_listing<K: Send + 'static>(
    objects: Vec<K>,
    live: Tap<K>,
    complete: bool,
) -> WatchStream<K> {
    let mut events = vec![watcher::Event::Init];
    events.extend(objects.into_iter().map(watcher::Event::InitApply));
    if !complete {
        return stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed();
    }
    events.push(watcher::Event::InitDone);
    stream::iter(events.into_iter().map(Ok)).chain(live).boxed()
}

fn annotations(annotated: bool) -> Option<BTreeMap<String, String>> {
    annotated.then(|| BTreeMap::from([(MARKER.to_owned(), "true".to_owned())]))
}

pub fn namespace(name: &str, annotated: bool) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            annotations: annotations(annotated),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

pub fn secret(namespace: &str, name: &str, annotated: bool, value: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            annotations: annotations(annotated),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "value".to_owned(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_owned()),
        ..Secret::default()
    }
}

pub fn value_of(secret: &Secret) -> Option<String> {
    let bytes = secret.data.as_ref()?.get("value")?;
    String::from_utf8(bytes.0.clone()).ok()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        debounce_millis: 10,
        resync_interval_secs: 0,
        initial_sync_timeout_secs: 5,
        retry: secretsync::config::RetryConfig {
            max_attempts: 4,
            base_delay_millis: 10,
            max_delay_millis: 50,
            persistent_failure_threshold: 2,
        },
        ..SyncConfig::default()
    }
}

/// Starts a cache over the fake cluster and waits for its first listing.
pub async fn synced_cache(cluster: &Arc<FakeCluster>) -> (WatchCache, CancellationToken) {
    let shutdown = CancellationToken::new();
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let (cache, _task) = WatchCache::spawn(
        cluster.watch_secrets(),
        cluster.watch_namespaces(),
        notify_tx,
        shutdown.clone(),
    );
    assert!(cache.wait_for_initial_sync(Duration::from_secs(5)).await);
    (cache, shutdown)
}

/// Polls `check` until it holds, the same way the live-cluster tests wait on the API server.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    Retry::spawn(FixedInterval::from_millis(20).take(250), || {
        let done = check();
        async move {
            if done {
                Ok(())
            } else {
                Err(RetryError::transient(()))
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
