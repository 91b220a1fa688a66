//! Host definitions and the compact host-spec syntax.
//!
//! A host spec names one candidate build server:
//!
//! ```text
//! HOST                 plain TCP, default port
//! HOST:4200            plain TCP, explicit port
//! HOST,z               compressed payloads (protocol 2)
//! HOST,cpp,z           server-side preprocessing (protocol 3)
//! @HOST                tunnel through the configured tunnel command
//! user@HOST,auth       tunnel as `user`, authenticate first
//! ```
//!
//! `OCC_HOSTS` holds a whitespace-separated list of specs; selection policy
//! lives with the caller, not here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default server port when the spec does not name one.
pub const DEFAULT_PORT: u16 = 3632;

/// Wire protocol version for plain requests.
pub const PROTO_PLAIN: u32 = 1;
/// Wire protocol version when payloads are compressed.
pub const PROTO_COMPRESSED: u32 = 2;
/// Wire protocol version when the server runs the preprocessor.
pub const PROTO_SERVER_CPP: u32 = 3;

/// How the client reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    /// One bidirectional TCP socket.
    Tcp,
    /// Two half-duplex pipes bound to a spawned tunnel child.
    Tunnel,
}

/// Which side runs the C preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CppWhere {
    /// The client produces the `.i` file and ships it.
    Client,
    /// The client ships sources and headers; the server preprocesses.
    Server,
}

/// One candidate build server. Immutable per dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub mode: HostMode,
    pub hostname: String,
    pub port: u16,
    /// Tunnel login user, when the spec gave one.
    pub user: Option<String>,
    /// Command used to spawn the tunnel child (program plus leading args).
    pub tunnel_command: String,
    pub cpp_where: CppWhere,
    pub protover: u32,
    pub compression: bool,
    pub authenticate: bool,
}

impl HostSpec {
    /// A plain TCP host with defaults; the starting point for parsing.
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            mode: HostMode::Tcp,
            hostname: hostname.into(),
            port,
            user: None,
            tunnel_command: "ssh".to_string(),
            cpp_where: CppWhere::Client,
            protover: PROTO_PLAIN,
            compression: false,
            authenticate: false,
        }
    }

    /// Parse one spec from the compact syntax.
    pub fn parse(spec: &str) -> Result<Self, HostParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostParseError::Empty);
        }

        let mut parts = spec.split(',');
        let addr = parts.next().unwrap_or_default();

        let mut host = if let Some((user, name)) = addr.split_once('@') {
            let mut h = HostSpec::tcp(name, DEFAULT_PORT);
            h.mode = HostMode::Tunnel;
            if !user.is_empty() {
                h.user = Some(user.to_string());
            }
            h
        } else if let Some((name, port)) = addr.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| HostParseError::BadPort(port.to_string()))?;
            HostSpec::tcp(name, port)
        } else {
            HostSpec::tcp(addr, DEFAULT_PORT)
        };

        if host.hostname.is_empty() {
            return Err(HostParseError::Empty);
        }

        for opt in parts {
            match opt {
                "z" => host.compression = true,
                "cpp" => host.cpp_where = CppWhere::Server,
                "auth" => host.authenticate = true,
                other => return Err(HostParseError::UnknownOption(other.to_string())),
            }
        }

        host.protover = match (host.cpp_where, host.compression) {
            (CppWhere::Server, _) => PROTO_SERVER_CPP,
            (CppWhere::Client, true) => PROTO_COMPRESSED,
            (CppWhere::Client, false) => PROTO_PLAIN,
        };

        Ok(host)
    }

    /// Parse a whitespace-separated host list, preserving order.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, HostParseError> {
        let specs: Vec<_> = list
            .split_whitespace()
            .map(Self::parse)
            .collect::<Result<_, _>>()?;
        if specs.is_empty() {
            return Err(HostParseError::Empty);
        }
        Ok(specs)
    }

    /// `host:port` form for diagnostics.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("empty host spec")]
    Empty,
    #[error("bad port '{0}'")]
    BadPort(String),
    #[error("unknown host option '{0}'")]
    UnknownOption(String),
}
