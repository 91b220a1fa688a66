//! Environment-driven configuration.
//!
//! All knobs live under the `OCC_` prefix:
//!
//! | Variable          | Meaning                                      |
//! |-------------------|----------------------------------------------|
//! | `OCC_HOSTS`       | Whitespace-separated host specs              |
//! | `OCC_LOG`         | Log filter (tracing `EnvFilter` syntax)      |
//! | `OCC_DIR`         | State dir: staging tmpdir and slot locks     |
//! | `OCC_TUNNEL`      | Tunnel command for `@host` specs             |
//! | `OCC_AUTH_SECRET` | Preshared secret for `,auth` hosts           |
//! | `OCC_SLOTS`       | Local preprocessing slot count               |

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Raw host list, still unparsed; empty when unset.
    pub hosts: Option<String>,
    /// Fallback log level when `OCC_LOG` is unset.
    pub log_level: String,
    /// Directory for staging files and slot locks.
    pub state_dir: PathBuf,
    /// Tunnel command line, first word is the program.
    pub tunnel_command: String,
    /// Preshared secret for authenticating hosts.
    pub auth_secret: Option<String>,
    /// Concurrent local preprocessor ceiling.
    pub slots: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let slots = match env::var("OCC_SLOTS") {
            Ok(raw) => raw.parse::<u32>().ok().filter(|n| *n > 0).ok_or(
                ConfigError::InvalidValue {
                    var: "OCC_SLOTS",
                    expected: "a positive integer",
                    value: raw,
                },
            )?,
            Err(_) => default_slots(),
        };

        Ok(Self {
            hosts: env::var("OCC_HOSTS").ok().filter(|s| !s.trim().is_empty()),
            log_level: env::var("OCC_LOG").unwrap_or_else(|_| "info".to_string()),
            state_dir: env::var("OCC_DIR").map(PathBuf::from).unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".occ"))
                    .unwrap_or_else(|| env::temp_dir().join("occ"))
            }),
            tunnel_command: env::var("OCC_TUNNEL").unwrap_or_else(|_| "ssh".to_string()),
            auth_secret: env::var("OCC_AUTH_SECRET").ok(),
            slots,
        })
    }
}

fn default_slots() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2)
}

/// The staging tmpdir: `OCC_DIR`, else `TMPDIR`, else `/tmp`.
///
/// Staged profile data and preprocessed sources are colocated here.
pub fn tmp_top() -> PathBuf {
    env::var("OCC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir())
}
