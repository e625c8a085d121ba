use std::{collections::BTreeSet, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::selector::ExcludedNamespaces;

pub const DEFAULT_SOURCE_NAMESPACE: &str = "secretsync";
pub const DEFAULT_SYNC_MARKER: &str = "casek14/secretsync";
pub const SOURCE_LABEL: &str = "casek14/secretsync-source";

/// Runtime settings for the mirroring controller.
///
/// Every field has a default, so a config file only needs the keys it overrides.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub source_namespace: String,
    pub sync_marker: String,
    /// Namespaces that are never targets. The source namespace is always added on top.
    pub reserved_namespaces: BTreeSet<String>,
    pub initial_sync_timeout_secs: u64,
    pub api_timeout_secs: u64,
    pub debounce_millis: u64,
    /// Full pass interval independent of watch events. Zero disables it.
    pub resync_interval_secs: u64,
    /// Delete mirrored copies from namespaces that dropped their opt-in annotation.
    pub prune_on_opt_out: bool,
    pub retry: RetryConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts per work item, including the first one.
    pub max_attempts: usize,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    /// Consecutive exhausted work items before a namespace is reported as persistently failing.
    pub persistent_failure_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_namespace: DEFAULT_SOURCE_NAMESPACE.to_owned(),
            sync_marker: DEFAULT_SYNC_MARKER.to_owned(),
            reserved_namespaces: BTreeSet::from(["kube-public".to_owned(), "kube-system".to_owned()]),
            initial_sync_timeout_secs: 60,
            api_timeout_secs: 10,
            debounce_millis: 250,
            resync_interval_secs: 600,
            prune_on_opt_out: false,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_millis: 100,
            max_delay_millis: 5_000,
            persistent_failure_threshold: 3,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        anyhow::ensure!(!config.source_namespace.is_empty(), "sourceNamespace must not be empty");
        anyhow::ensure!(!config.sync_marker.is_empty(), "syncMarker must not be empty");
        anyhow::ensure!(config.retry.max_attempts > 0, "retry.maxAttempts must be at least 1");
        Ok(config)
    }

    /// The reserved set plus the source namespace.
    pub fn excluded_namespaces(&self) -> ExcludedNamespaces {
        ExcludedNamespaces::new(
            self.reserved_namespaces
                .iter()
                .cloned()
                .chain(std::iter::once(self.source_namespace.clone())),
        )
    }

    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_sync_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}
