use std::{future::Future, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
    runtime::{WatchStreamExt, watcher},
};

use crate::error::ApiError;

pub type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// The subset of the Kubernetes API the controller drives.
///
/// "Already exists" on create and "not found" on delete are outcomes, not errors.
///
/// The controller itself reads only through the watches; the one-shot lists are part of the
/// surface for callers that need a point-in-time read without a cache.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ApiError>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, ApiError>;

    /// Full listing followed by live changes for secrets in every namespace.
    fn watch_secrets(&self) -> WatchStream<Secret>;

    fn watch_namespaces(&self) -> WatchStream<Namespace>;

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, ApiError>;

    /// Overwrites the secret with the same namespace and name.
    async fn update_secret(&self, secret: &Secret) -> Result<(), ApiError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ApiError>;
}

/// [`ClusterApi`] backed by a kube client. Every request carries its own timeout.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    timeout: Duration,
}

impl KubeClusterApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn secrets_in(&self, secret: &Secret) -> Api<Secret> {
        match secret.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

/// Bounds a single request by `after`.
async fn timed<T>(
    operation: &'static str,
    after: Duration,
    request: impl Future<Output = kube::Result<T>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(after, request)
        .await
        .map_err(|_| ApiError::Timeout { operation, after })?
        .map_err(ApiError::from)
}

fn is_api_error(err: &ApiError, code: u16) -> bool {
    matches!(err, ApiError::Kube(kube::Error::Api(e)) if e.code == code)
}

fn create_outcome<T>(result: Result<T, ApiError>) -> Result<CreateOutcome, ApiError> {
    match result {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(e) if is_api_error(&e, 409) => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e),
    }
}

fn delete_outcome<T>(result: Result<T, ApiError>) -> Result<DeleteOutcome, ApiError> {
    match result {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if is_api_error(&e, 404) => Ok(DeleteOutcome::NotFound),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ApiError> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let list = timed("list secrets", self.timeout, api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        let api = Api::<Namespace>::all(self.client.clone());
        let list = timed("list namespaces", self.timeout, api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    fn watch_secrets(&self) -> WatchStream<Secret> {
        let api = Api::<Secret>::all(self.client.clone());
        watcher(api, watcher::Config::default()).default_backoff().boxed()
    }

    fn watch_namespaces(&self) -> WatchStream<Namespace> {
        let api = Api::<Namespace>::all(self.client.clone());
        watcher(api, watcher::Config::default()).default_backoff().boxed()
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, ApiError> {
        let api = self.secrets_in(secret);
        create_outcome(
            timed(
                "create secret",
                self.timeout,
                api.create(&PostParams::default(), secret),
            )
            .await,
        )
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), ApiError> {
        let api = self.secrets_in(secret);
        timed(
            "update secret",
            self.timeout,
            api.replace(&secret.name_any(), &PostParams::default(), secret),
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ApiError> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        delete_outcome(
            timed(
                "delete secret",
                self.timeout,
                api.delete(name, &DeleteParams::default()),
            )
            .await,
        )
    }
}
