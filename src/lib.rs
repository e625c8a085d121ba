use std::{ffi::OsStr, sync::Arc};

use anyhow::Context;

use kube::{
    Client,
    config::{KubeConfigOptions, Kubeconfig},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod mirror;
pub mod notifier;
pub mod queue;
pub mod reconciler;
pub mod selector;
pub mod worker;

use api::KubeClusterApi;
use config::SyncConfig;
use controller::Controller;

pub async fn run(kubeconfig: Option<&OsStr>, config: SyncConfig) -> anyhow::Result<()> {
    let client = connect(kubeconfig).await?;
    let api = Arc::new(KubeClusterApi::new(client, config.api_timeout()));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Received stop signal");
            shutdown.cancel();
        }
    });

    info!(
        "Mirroring secrets annotated '{}' from namespace '{}'",
        config.sync_marker, config.source_namespace
    );
    Controller::new(api, config).run(shutdown).await?;

    Ok(())
}

async fn connect(kubeconfig: Option<&OsStr>) -> anyhow::Result<Client> {
    let options = KubeConfigOptions::default();

    let config = match kubeconfig {
        Some(paths) => {
            let kubeconfig = read_kubeconfigs(paths)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        // Load kubeconfig if it's present otherwise fall back to cluster config
        None => kube::Config::from_kubeconfig(&options)
            .await
            .or_else(|_| kube::Config::incluster())?,
    };

    Ok(Client::try_from(config)?)
}

/// Reads a `KUBECONFIG`-style path list, merging the files in order. Earlier files win.
fn read_kubeconfigs(paths: &OsStr) -> anyhow::Result<Kubeconfig> {
    let mut merged: Option<Kubeconfig> = None;
    for path in std::env::split_paths(paths).filter(|p| !p.as_os_str().is_empty()) {
        let next = Kubeconfig::read_from(&path)
            .with_context(|| format!("Unable to read kubeconfig {}", path.display()))?;
        merged = Some(match merged {
            Some(config) => config.merge(next)?,
            None => next,
        });
    }
    merged.context("No kubeconfig path given")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
