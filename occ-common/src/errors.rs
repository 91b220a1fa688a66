//! Error types for the dispatch engine.
//!
//! One enum covers every failure class the dispatcher can surface. Staging
//! problems during the profile-data side-channel are deliberately *not* here:
//! those degrade to a `GCDA 0` announcement and the dispatch continues.

use std::io;
use thiserror::Error;

/// Failure classes for a remote dispatch attempt.
///
/// Any variant returned from the dispatcher means the caller must not assume
/// the remote compile ran. A clean `Ok` still carries the remote compiler's
/// wait status, which callers inspect separately.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connect, tunnel-spawn, or read/write failure on the transport.
    #[error("transport: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Malformed or unexpected wire traffic, including version mismatches.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The authentication handshake was refused or could not complete.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local filesystem trouble outside the wire: unusable tmpdir, output
    /// file creation, cleanup registration.
    #[error("i/o: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Reaping a helper child failed. Distinct from the child merely
    /// exiting non-zero, which is reported through its wait status.
    #[error("child: {0}")]
    Child(String),

    /// A programmer error: impossible mode, missing pipe end.
    #[error("logic: {0}")]
    Logic(String),
}

impl DispatchError {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this failure happened on the wire rather than locally.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
