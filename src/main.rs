use std::{ffi::OsString, path::PathBuf};

use clap::Parser;
use secretsync::config::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Mirror annotated secrets into opted-in namespaces until stopped
    Run {
        /// Kubeconfig path, or a list of paths merged like kubectl does; without one,
        /// in-cluster credentials are used
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<OsString>,

        /// YAML file overriding the default settings
        #[arg(long, env = "SECRETSYNC_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as YAML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::DefaultConfig => {
            print!("{}", serde_yaml::to_string(&SyncConfig::default())?);
        }
        Args::Run { kubeconfig, config } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            let config = match config {
                Some(path) => SyncConfig::from_file(&path)?,
                None => SyncConfig::default(),
            };
            secretsync::run(kubeconfig.as_deref(), config).await?;
        }
    };

    Ok(())
}
