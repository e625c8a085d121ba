//! Annotation-driven filters deciding which secrets and namespaces take part in mirroring.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;

/// Namespaces that are never mirroring targets, whatever their annotations say.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExcludedNamespaces(BTreeSet<String>);

impl ExcludedNamespaces {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self(names.into_iter().collect())
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }
}

/// Keeps the secrets carrying the sync marker annotation, whatever its value.
#[derive(Clone, Debug)]
pub struct SecretSelector {
    marker: String,
}

impl SecretSelector {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn is_candidate(&self, secret: &Secret) -> bool {
        secret.annotations().contains_key(&self.marker)
    }

    pub fn select(&self, secrets: impl IntoIterator<Item = Secret>) -> Vec<Secret> {
        secrets
            .into_iter()
            .filter(|s| self.is_candidate(s))
            .collect()
    }
}

/// Keeps annotated namespaces outside the exclusion set.
#[derive(Clone, Debug)]
pub struct NamespaceSelector {
    marker: String,
    excluded: ExcludedNamespaces,
}

impl NamespaceSelector {
    pub fn new(marker: impl Into<String>, excluded: ExcludedNamespaces) -> Self {
        Self {
            marker: marker.into(),
            excluded,
        }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name)
    }

    pub fn is_target(&self, namespace: &Namespace) -> bool {
        namespace.annotations().contains_key(&self.marker) && !self.is_excluded(&namespace.name_any())
    }

    pub fn select(&self, namespaces: impl IntoIterator<Item = Namespace>) -> Vec<Namespace> {
        namespaces
            .into_iter()
            .filter(|ns| self.is_target(ns))
            .collect()
    }
}
