//! Common types shared between the dispatcher and its collaborators.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Raw Unix wait status, as produced by `wait(2)` and as carried by the
/// `STAT` response token.
///
/// Kept raw so a remote compiler's disposition (exit code or terminating
/// signal) travels the wire as a single integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStatus(i32);

impl WaitStatus {
    /// A clean zero status.
    pub fn ok() -> Self {
        Self(0)
    }

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn success(self) -> bool {
        self.0 == 0
    }

    /// Exit code, when the process exited normally.
    pub fn exit_code(self) -> Option<i32> {
        if self.0 & 0x7f == 0 {
            Some((self.0 >> 8) & 0xff)
        } else {
            None
        }
    }

    /// Terminating signal, when the process was killed.
    pub fn signal(self) -> Option<i32> {
        let sig = self.0 & 0x7f;
        if sig != 0 && sig != 0x7f { Some(sig) } else { None }
    }

    /// One-line account of a failed status, naming the tool and its input.
    pub fn critique(self, tool: &str, input: &str) -> String {
        if let Some(sig) = self.signal() {
            format!("{tool} {input} terminated by signal {sig}")
        } else {
            format!(
                "{tool} {input} failed with exit code {}",
                self.exit_code().unwrap_or(-1)
            )
        }
    }
}

impl From<std::process::ExitStatus> for WaitStatus {
    #[cfg(unix)]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self(status.into_raw())
    }

    #[cfg(not(unix))]
    fn from(status: std::process::ExitStatus) -> Self {
        Self(status.code().unwrap_or(1) << 8)
    }
}

/// One compilation to dispatch. Immutable for the duration of the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileJob {
    /// Compiler command to run on the server.
    pub argv: Vec<String>,
    /// Input source name, for logging and state notifications.
    pub input: String,
    /// Preprocessed source path. Meaningful only when the client
    /// preprocesses; may still be in flight until the cpp child exits.
    pub cpp_output: PathBuf,
    /// Source and header paths to ship when the server preprocesses.
    #[serde(default)]
    pub files: Vec<String>,
    /// Where the object code should be delivered.
    pub object_output: PathBuf,
    /// Dependency (.d) output path, when the build asked for one.
    #[serde(default)]
    pub deps_output: Option<PathBuf>,
    /// Where the server's compiler stderr is stored for replay.
    pub server_stderr: PathBuf,
    /// Distributed-LTO mode: suppresses the profile-data side-channel.
    #[serde(default)]
    pub dist_lto: bool,
}

/// What a finished dispatch reports back.
///
/// Reaching this value at all means there was no communication failure. The
/// remote compiler may still have failed; check `compiler_status`.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Wait status of the remote compiler, or of the local preprocessor
    /// when preprocessing failed and the dispatch stopped early.
    pub compiler_status: WaitStatus,
    /// Bytes of preprocessed source handed to the transport.
    pub doti_bytes: u64,
    /// Host the job ran on.
    pub host: String,
    /// Wall-clock time from connection setup through result retrieval.
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_status_clean_exit() {
        let st = WaitStatus::ok();
        assert!(st.success());
        assert_eq!(st.exit_code(), Some(0));
        assert_eq!(st.signal(), None);
    }

    #[test]
    fn test_wait_status_nonzero_exit() {
        let st = WaitStatus::from_raw(1 << 8);
        assert!(!st.success());
        assert_eq!(st.exit_code(), Some(1));
        assert_eq!(st.signal(), None);
    }

    #[test]
    fn test_wait_status_signal() {
        // SIGSEGV
        let st = WaitStatus::from_raw(11);
        assert!(!st.success());
        assert_eq!(st.exit_code(), None);
        assert_eq!(st.signal(), Some(11));
    }

    #[test]
    fn test_critique_names_tool_and_input() {
        let st = WaitStatus::from_raw(2 << 8);
        let msg = st.critique("cpp", "widget.c");
        assert!(msg.contains("cpp"));
        assert!(msg.contains("widget.c"));
        assert!(msg.contains("exit code 2"));

        let sig = WaitStatus::from_raw(9).critique("cc", "widget.c");
        assert!(sig.contains("signal 9"));
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_status_from_exit_status() {
        let status = std::process::Command::new("false")
            .status()
            .expect("spawn false");
        let ws = WaitStatus::from(status);
        assert!(!ws.success());
        assert_eq!(ws.exit_code(), Some(1));
    }
}
