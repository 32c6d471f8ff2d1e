//! Version conflict detection.
//!
//! The check is a pure comparison. Callers make it atomic with the write by
//! running it inside the entity store's compare-and-swap.

/// Result of comparing a client's version with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// The client edited the current version; the write may proceed.
    Match,
    /// The client edited some other version.
    Conflict {
        /// Version the client submitted against.
        client_version: u64,
        /// Server's current version.
        server_version: u64,
    },
}

impl VersionCheck {
    /// Returns true for `Match`.
    pub fn is_match(&self) -> bool {
        matches!(self, VersionCheck::Match)
    }
}

/// Compares a client version against the server version.
///
/// A conflict is raised if and only if the two differ, whichever is larger.
pub fn check_version(client_version: u64, server_version: u64) -> VersionCheck {
    if client_version == server_version {
        VersionCheck::Match
    } else {
        VersionCheck::Conflict {
            client_version,
            server_version,
        }
    }
}
