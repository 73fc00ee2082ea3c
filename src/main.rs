//! patchssh daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use patchssh::config::Config;
use patchssh::keystore::KeyStore;
use patchssh::server::Server;

/// Grace period for open sessions after a shutdown signal.
const END_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchssh=info".parse()?),
        )
        .init();

    let config_path = std::env::var("PATCHSSH_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_else(|| "patchssh.toml".to_string());
    let mut config = Config::load(&config_path)?;
    config.apply_env()?;

    prepare_workdir(&config.workdir)?;

    let store = Arc::new(
        KeyStore::open(&config.db.path)
            .with_context(|| format!("failed to open key store at {}", config.db.path))?,
    );
    info!(path = %config.db.path, "key store initialized");

    let server = Server::new(config.server.clone(), Some(store))?;
    let cancel = CancellationToken::new();
    server.serve(cancel.clone()).await?;

    wait_for_shutdown().await?;
    cancel.cancel();
    // let open sessions wind down before the process exits
    tokio::time::sleep(END_TIMEOUT).await;
    info!("server stopped");
    Ok(())
}

fn prepare_workdir(workdir: &str) -> Result<()> {
    let path = std::path::Path::new(workdir);
    if path.exists() && !path.is_dir() {
        anyhow::bail!("workdir {} is not a directory", workdir);
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create workdir {workdir}"))?;
    std::env::set_current_dir(path)
        .with_context(|| format!("failed to change into workdir {workdir}"))?;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received terminate"),
    }
    Ok(())
}
