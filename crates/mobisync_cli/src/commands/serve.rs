//! Serve command implementation.
//!
//! Runs the HTTP router on a tokio runtime alongside a sweeper that fails
//! stale jobs and, when a data path is set, snapshots the server state on
//! the blocking pool. A final snapshot is written after a graceful shutdown.

use clap::Args;
use mobisync_server::{http, ServerConfig, SyncServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Options for `mobisync serve`.
#[derive(Debug, Args)]
pub struct ServeOptions {
    /// Address to listen on
    #[arg(long, env = "MOBISYNC_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Secret for signing sync tokens (random per run if unset)
    #[arg(long, env = "MOBISYNC_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Snapshot file to restore from and persist to
    #[arg(long, env = "MOBISYNC_DATA")]
    pub data: Option<PathBuf>,

    /// Maximum entities per data type in one pull
    #[arg(long, env = "MOBISYNC_PAGE_SIZE", default_value = "500")]
    pub page_size: usize,

    /// Maximum items in one push
    #[arg(long, env = "MOBISYNC_MAX_PUSH_BATCH", default_value = "500")]
    pub max_push_batch: usize,

    /// Seconds after which unfinished jobs are failed as stale
    #[arg(long, env = "MOBISYNC_JOB_STALE_SECS", default_value = "86400")]
    pub job_stale_secs: u64,

    /// Seconds between stale-job sweeps and snapshots
    #[arg(long, env = "MOBISYNC_SWEEP_SECS", default_value = "60")]
    pub sweep_secs: u64,
}

impl ServeOptions {
    /// Builds the server configuration.
    pub fn to_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.bind)
            .with_pull_page_size(self.page_size)
            .with_max_push_batch(self.max_push_batch)
            .with_job_stale_after(Duration::from_secs(self.job_stale_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_secs.max(1)));
        if let Some(secret) = &self.token_secret {
            config = config.with_token_secret(secret.as_bytes().to_vec());
        }
        if let Some(path) = &self.data {
            config = config.with_snapshot_path(path.clone());
        }
        config
    }
}

/// Runs the serve command.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.to_config();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.snapshot_path.is_none() {
        warn!("no data path set, state is lost on exit");
    }
    let server = Arc::new(match &config.snapshot_path {
        Some(path) => SyncServer::load_snapshot(config.clone(), path)?,
        None => SyncServer::new(config.clone())?,
    });

    let (stop, stopped) = watch::channel(false);
    let sweeper = tokio::spawn(sweep(Arc::clone(&server), stopped));

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "mobisync listening");

    axum::serve(listener, http::router(Arc::clone(&server)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let a sweep already writing finish before the final snapshot.
    let _ = stop.send(true);
    if let Err(err) = sweeper.await {
        error!(error = %err, "sweeper task failed");
    }
    persist(Arc::clone(&server)).await;
    info!("server shutdown complete");
    Ok(())
}

async fn sweep(server: Arc<SyncServer>, mut stopped: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(server.config().sweep_interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped.changed() => return,
        }
        if let Err(err) = server.expire_stale_jobs() {
            error!(error = %err, "stale job sweep failed");
        }
        persist(Arc::clone(&server)).await;
    }
}

/// Saves a snapshot on the blocking pool, if a data path is set.
async fn persist(server: Arc<SyncServer>) {
    if server.config().snapshot_path.is_none() {
        return;
    }
    let saved = tokio::task::spawn_blocking(move || {
        let Some(path) = &server.config().snapshot_path else {
            return;
        };
        if let Err(err) = server.save_snapshot(path) {
            error!(path = %path.display(), error = %err, "failed to save snapshot");
        }
    })
    .await;
    if let Err(err) = saved {
        error!(error = %err, "snapshot task failed");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        options: ServeOptions,
    }

    #[test]
    fn flags_map_onto_config() {
        let harness = Harness::parse_from([
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--token-secret",
            "0123456789abcdef",
            "--data",
            "/tmp/mobisync.msyn",
            "--page-size",
            "50",
        ]);
        let config = harness.options.to_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.token_secret.as_deref(), Some(&b"0123456789abcdef"[..]));
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/mobisync.msyn")));
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn persist_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.msyn");
        let config = ServerConfig::default()
            .with_token_secret(b"0123456789abcdef".to_vec())
            .with_snapshot_path(path.clone());
        let server = Arc::new(SyncServer::new(config.clone()).unwrap());

        persist(Arc::clone(&server)).await;
        assert!(path.exists());
        assert!(SyncServer::load_snapshot(config, &path).is_ok());
    }
}
