//! Server configuration.

use crate::error::{SyncError, SyncResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum entities per data type in one pull response.
    pub pull_page_size: usize,
    /// Maximum items in one push request.
    pub max_push_batch: usize,
    /// Secret for signing sync tokens. Generated at startup if absent.
    pub token_secret: Option<Vec<u8>>,
    /// Age after which unfinished jobs are failed as stale.
    pub job_stale_after: Duration,
    /// How often the stale-job sweep runs.
    pub sweep_interval: Duration,
    /// Where to persist the server snapshot, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    /// CAS attempts a conflict resolution makes before giving up.
    pub resolve_attempts: u32,
    /// Maximum length of a device id.
    pub max_device_id_len: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            pull_page_size: 500,
            max_push_batch: 500,
            token_secret: None,
            job_stale_after: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            snapshot_path: None,
            resolve_attempts: 8,
            max_device_id_len: 128,
        }
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the token signing secret.
    pub fn with_token_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.token_secret = Some(secret.into());
        self
    }

    /// Sets the job staleness threshold.
    pub fn with_job_stale_after(mut self, age: Duration) -> Self {
        self.job_stale_after = age;
        self
    }

    /// Sets the stale-job sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the snapshot path.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Sets the number of CAS attempts for conflict resolution.
    pub fn with_resolve_attempts(mut self, attempts: u32) -> Self {
        self.resolve_attempts = attempts;
        self
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.pull_page_size == 0 {
            return Err(SyncError::Config("pull_page_size must be at least 1".into()));
        }
        if self.max_push_batch == 0 {
            return Err(SyncError::Config("max_push_batch must be at least 1".into()));
        }
        if self.resolve_attempts == 0 {
            return Err(SyncError::Config("resolve_attempts must be at least 1".into()));
        }
        if matches!(&self.token_secret, Some(secret) if secret.len() < 16) {
            return Err(SyncError::Config(
                "token secret must be at least 16 bytes".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
