//! # mobisync server
//!
//! Store-and-forward sync server for offline-first mobile clients.
//!
//! This crate provides:
//! - Versioned entity stores behind the [`EntityStore`] capability
//! - Sync tokens (HMAC-SHA256 signed pull cursors)
//! - Pull and push handlers with per-item idempotency
//! - Conflict detection, a conflict store and a resolver
//! - A sync job log with per-device health
//! - Snapshot persistence and an axum HTTP router
//!
//! # Architecture
//!
//! ```text
//! device -> pull handler --------------------------------> entity store
//!        -> push handler -> conflict detector -> entity store (CAS)
//!                                             -> conflict store
//! operator -> resolver -> conflict store (claim) -> entity store (CAS)
//! every pull, push item and force sync -> job queue
//! ```
//!
//! Entity versions start at 1 and grow by exactly one per accepted change.
//! A push only applies against the version the client saw; anything else is
//! recorded as a conflict and never applied silently.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mobisync_server::{http, ServerConfig, SyncServer};
//! use std::sync::Arc;
//!
//! let config = ServerConfig::default().with_token_secret(secret);
//! let server = Arc::new(SyncServer::new(config)?);
//! let app = http::router(server);
//! axum::serve(listener, app).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod conflicts;
mod detector;
mod error;
mod handler;
pub mod http;
mod jobs;
mod ledger;
mod pull;
mod push;
mod resolver;
mod server;
mod snapshot;
mod store;
mod token;

pub use config::ServerConfig;
pub use conflicts::{ConflictStore, NewConflict};
pub use detector::{check_version, VersionCheck};
pub use error::{SyncError, SyncResult};
pub use handler::{HandlerContext, RequestHandler};
pub use jobs::{JobCounts, JobQueue, SyncJob, STALE_REASON};
pub use ledger::{fingerprint, Admission, IdempotencyLedger, LedgerRecord, StoredOutcome};
pub use resolver::{default_merge, ConflictResolver};
pub use server::SyncServer;
pub use snapshot::Snapshot;
pub use store::{
    CasOutcome, Change, ChangePage, EntityRegistry, EntityStore, MemoryEntityStore, StoreError,
    StoreResult, Watermark,
};
pub use token::{TokenCodec, TokenInfo};
