//! # mobisync testkit
//!
//! Test utilities for mobisync.
//!
//! This crate provides:
//! - Seeded test servers with a fixed token secret
//! - Helpers that drive pulls and pushes the way a device would
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mobisync_testkit::prelude::*;
//!
//! #[test]
//! fn pull_sees_seeded_entities() {
//!     let server = TestServer::new();
//!     server.seed(EntityType::Payment, 3);
//!     assert_eq!(server.pull_all("device-1", EntityType::Payment).len(), 3);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use mobisync_protocol::*;
    pub use mobisync_server::{ServerConfig, SyncError, SyncServer};
}

pub use fixtures::*;
pub use generators::*;
