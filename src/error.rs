use std::time::Duration;

use thiserror::Error;

/// Failure of a single Cluster Resource API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Watch cache has shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Watch cache did not sync within {0:?}")]
    InitialSyncTimeout(Duration),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{task} task failed: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}
