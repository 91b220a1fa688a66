//! occ - Remote Compilation Dispatch Client
//!
//! Shared types, wire protocol framing, and utilities used by the `occ`
//! client. Everything here is transport-agnostic: the framing helpers work
//! over any async byte stream, whether a TCP socket or a tunnel pipe.

#![deny(unsafe_code)]

pub mod cleanup;
pub mod config;
pub mod errors;
pub mod hosts;
pub mod logging;
pub mod mock_server;
pub mod types;
pub mod wire;

pub use cleanup::CleanupRegistry;
pub use config::Config;
pub use errors::DispatchError;
pub use hosts::{CppWhere, HostMode, HostSpec};
pub use logging::init_logging;
pub use mock_server::{MockServer, RecordedToken, ServerScript};
pub use types::{CompileJob, DispatchOutcome, WaitStatus};
pub use wire::Tag;
