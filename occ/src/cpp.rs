//! Synchronizing with the background preprocessor.
//!
//! The preprocessor is forked before dispatch begins so it overlaps with
//! connection setup. The dispatcher only meets it here: wait for the child,
//! classify its exit, and hand the status up. A failed preprocessor is not
//! a dispatch error; there is no point retrying the same command locally,
//! so the failure is critiqued and reported through the status word.

use crate::state::{Locality, Monitor, Phase};
use occ_common::errors::DispatchError;
use occ_common::types::WaitStatus;
use tokio::process::Child;
use tracing::warn;

/// A running preprocessor child.
pub struct CppChild {
    child: Child,
}

impl CppChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// Pid, until the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Wait for the preprocessor, if one is running.
///
/// Returns its wait status; `Err` only when the reap itself fails. A
/// non-zero status means the dispatcher must stop before streaming, and
/// the caller reports the cpp status as the job's outcome.
pub async fn wait_for_cpp(
    cpp: Option<CppChild>,
    monitor: &dyn Monitor,
    input: &str,
) -> Result<WaitStatus, DispatchError> {
    let Some(mut cpp) = cpp else {
        return Ok(WaitStatus::ok());
    };

    monitor.note_phase(Phase::Cpp, Some(input), None, Locality::Local);

    let status = cpp
        .child
        .wait()
        .await
        .map_err(|e| DispatchError::Child(format!("reaping cpp for {input}: {e}")))?;
    let status = WaitStatus::from(status);

    if !status.success() {
        warn!("{}", status.critique("cpp", input));
    }
    Ok(status)
}
