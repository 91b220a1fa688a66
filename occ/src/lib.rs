//! occ client: the remote dispatch engine.
//!
//! Given a compiler invocation and a chosen host, [`dispatch::dispatch`]
//! ships the job to the server, overlapping local preprocessing with
//! connection setup, and delivers the object file, diagnostics, and
//! dependency info back into the local build. Everything else in this crate
//! exists in service of that one state machine.

#![deny(unsafe_code)]

pub mod auth;
pub mod cpp;
pub mod dispatch;
pub mod gcda;
pub mod lock;
pub mod request;
pub mod results;
pub mod state;
pub mod transport;

pub use auth::Authenticator;
pub use cpp::CppChild;
pub use dispatch::{DispatchContext, dispatch};
pub use lock::PreprocessSlot;
pub use state::{JsonMonitor, Locality, Monitor, Phase, RecordingMonitor, TracingMonitor};
pub use transport::Transport;
