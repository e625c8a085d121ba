use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::{
    api::{ClusterApi, CreateOutcome, DeleteOutcome},
    cache::WatchCache,
    config::SyncConfig,
    error::{ApiError, CacheError},
    mirror::{is_up_to_date, mirror_secret, mirrored_from},
    queue::WorkItem,
    selector::{NamespaceSelector, SecretSelector},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Create reported "already exists" and the update fallback went through.
    Updated,
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretFailure {
    pub secret: String,
    pub reason: String,
}

/// What one pass did to one namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceReport {
    pub namespace: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    /// Secrets that were gone by the time we tried to delete them.
    pub already_deleted: Vec<String>,
    /// Source secrets not copied because an unmanaged secret holds the name.
    pub conflicts: Vec<String>,
    pub failures: Vec<SecretFailure>,
}

impl NamespaceReport {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, secret: &str, err: ApiError) {
        self.failures.push(SecretFailure {
            secret: secret.to_owned(),
            reason: err.to_string(),
        });
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub namespaces: Vec<NamespaceReport>,
}

impl PassReport {
    pub fn failed_namespaces(&self) -> BTreeSet<String> {
        self.namespaces
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.namespace.clone())
            .collect()
    }

    pub fn visited_namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(|r| r.namespace.as_str())
    }
}

/// Brings managed secrets in target namespaces in line with the source namespace.
///
/// Reads come from the watch cache; only mutations go to the cluster.
pub struct Reconciler<A> {
    api: Arc<A>,
    cache: WatchCache,
    secrets: SecretSelector,
    namespaces: NamespaceSelector,
    source_namespace: String,
    prune_on_opt_out: bool,
}

impl<A: ClusterApi> Reconciler<A> {
    pub fn new(api: Arc<A>, cache: WatchCache, config: &SyncConfig) -> Self {
        Self {
            api,
            cache,
            secrets: SecretSelector::new(&config.sync_marker),
            namespaces: NamespaceSelector::new(&config.sync_marker, config.excluded_namespaces()),
            source_namespace: config.source_namespace.clone(),
            prune_on_opt_out: config.prune_on_opt_out,
        }
    }

    pub async fn reconcile(&self, item: &WorkItem) -> Result<PassReport, CacheError> {
        match item {
            WorkItem::All => self.reconcile_all().await,
            WorkItem::Namespace(ns) => self.reconcile_one(ns).await,
        }
    }

    async fn source_secrets(&self) -> Result<Vec<Secret>, CacheError> {
        Ok(self
            .secrets
            .select(self.cache.list_secrets(&self.source_namespace).await?))
    }

    /// Full pass over every target namespace.
    pub async fn reconcile_all(&self) -> Result<PassReport, CacheError> {
        let source = self.source_secrets().await?;
        let namespaces = self.cache.list_namespaces().await?;

        info!(
            secrets = source.len(),
            "Reconciling secrets from namespace '{}'", self.source_namespace
        );

        let mut report = PassReport::default();
        for ns in &namespaces {
            let name = ns.name_any();
            if self.namespaces.is_target(ns) {
                report
                    .namespaces
                    .push(self.reconcile_namespace(&source, &name).await?);
            } else if self.should_prune(&name) {
                if let Some(pruned) = self.prune_opted_out(&name).await? {
                    report.namespaces.push(pruned);
                }
            }
        }

        Ok(report)
    }

    /// Namespace-scoped pass. A namespace that is not (or no longer) a target is left alone
    /// unless opt-out pruning is enabled.
    async fn reconcile_one(&self, name: &str) -> Result<PassReport, CacheError> {
        let namespace = self
            .cache
            .list_namespaces()
            .await?
            .into_iter()
            .find(|ns| ns.name_any() == name);

        let mut report = PassReport::default();
        match namespace {
            Some(ns) if self.namespaces.is_target(&ns) => {
                let source = self.source_secrets().await?;
                report
                    .namespaces
                    .push(self.reconcile_namespace(&source, name).await?);
            }
            Some(_) if self.should_prune(name) => {
                if let Some(pruned) = self.prune_opted_out(name).await? {
                    report.namespaces.push(pruned);
                }
            }
            Some(_) => debug!("Namespace '{}' is not a sync target", name),
            None => debug!("Namespace '{}' no longer exists", name),
        }

        Ok(report)
    }

    /// Upserts every source secret into `target`, then deletes managed secrets the source
    /// no longer has.
    pub async fn reconcile_namespace(
        &self,
        source: &[Secret],
        target: &str,
    ) -> Result<NamespaceReport, CacheError> {
        let mut report = NamespaceReport::new(target);

        let existing: BTreeMap<String, Secret> = self
            .cache
            .list_secrets(target)
            .await?
            .into_iter()
            .map(|s| (s.name_any(), s))
            .collect();

        for secret in source {
            let name = secret.name_any();
            let observed = existing.get(&name);

            if observed.is_some_and(|s| !self.secrets.is_candidate(s)) {
                warn!(
                    "Not replicating secret '{}' into namespace '{}': an unmanaged secret has that name",
                    name, target
                );
                report.conflicts.push(name);
                continue;
            }

            let desired = mirror_secret(secret, target);
            match self.upsert(&desired, observed).await {
                Ok(UpsertOutcome::Created) => report.created.push(name),
                Ok(UpsertOutcome::Updated) => report.updated.push(name),
                Ok(UpsertOutcome::Unchanged) => report.unchanged.push(name),
                Err(e) => {
                    warn!(
                        "Error replicating secret '{}' into namespace '{}': {}",
                        name, target, e
                    );
                    report.fail(&name, e);
                }
            }
        }

        let desired: BTreeSet<String> = source.iter().map(ResourceExt::name_any).collect();
        let observed: BTreeSet<String> = self
            .secrets
            .select(self.cache.list_secrets(target).await?)
            .iter()
            .map(ResourceExt::name_any)
            .collect();

        for name in observed.difference(&desired) {
            self.delete(target, name, &mut report).await;
        }

        Ok(report)
    }

    async fn upsert(
        &self,
        desired: &Secret,
        observed: Option<&Secret>,
    ) -> Result<UpsertOutcome, ApiError> {
        if observed.is_some_and(|s| is_up_to_date(desired, s)) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let name = desired.name_any();
        let namespace = desired.namespace().unwrap_or_default();

        match self.api.create_secret(desired).await? {
            CreateOutcome::Created => {
                info!(
                    "Successfully created secret '{}' in namespace '{}'",
                    name, namespace
                );
                Ok(UpsertOutcome::Created)
            }
            CreateOutcome::AlreadyExists => {
                self.api.update_secret(desired).await?;
                info!(
                    "Successfully updated secret '{}' in namespace '{}'",
                    name, namespace
                );
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str, report: &mut NamespaceReport) {
        match self.api.delete_secret(namespace, name).await {
            Ok(DeleteOutcome::Deleted) => {
                info!(
                    "Deleted secret '{}' from namespace '{}': no longer in source",
                    name, namespace
                );
                report.deleted.push(name.to_owned());
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!("Secret '{}' in namespace '{}' already deleted", name, namespace);
                report.already_deleted.push(name.to_owned());
            }
            Err(e) => {
                warn!(
                    "Error deleting secret '{}' from namespace '{}': {}",
                    name, namespace, e
                );
                report.fail(name, e);
            }
        }
    }

    fn should_prune(&self, namespace: &str) -> bool {
        self.prune_on_opt_out && !self.namespaces.is_excluded(namespace)
    }

    /// Removes copies made from our source namespace out of a namespace that is no longer a
    /// target. Returns `None` when there was nothing to remove.
    async fn prune_opted_out(&self, namespace: &str) -> Result<Option<NamespaceReport>, CacheError> {
        let orphans: Vec<String> = self
            .secrets
            .select(self.cache.list_secrets(namespace).await?)
            .iter()
            .filter(|s| mirrored_from(s) == Some(self.source_namespace.as_str()))
            .map(ResourceExt::name_any)
            .collect();

        if orphans.is_empty() {
            return Ok(None);
        }

        info!(
            count = orphans.len(),
            "Pruning mirrored secrets from opted-out namespace '{}'", namespace
        );
        let mut report = NamespaceReport::new(namespace);
        for name in &orphans {
            self.delete(namespace, name, &mut report).await;
        }
        Ok(Some(report))
    }
}
