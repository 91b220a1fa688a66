//! In-process build server for tests.
//!
//! Speaks the server half of the token protocol over a real TCP listener,
//! records every request token it sees, and answers from a canned
//! [`ServerScript`]. No compiler runs; the "object file" is whatever bytes
//! the script carries.

use crate::hosts::{CppWhere, HostSpec};
use crate::wire::{self, Tag};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Canned behavior for one mock server.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Wait status the "remote compiler" reports.
    pub status: i32,
    /// Object file bytes returned under `DOTO`.
    pub object: Vec<u8>,
    /// Compiler stderr bytes returned under `SERR`.
    pub stderr: Vec<u8>,
    /// Compiler stdout bytes returned under `SOUT`.
    pub stdout: Vec<u8>,
    /// Dependency file bytes, when the build asked for them.
    pub deps: Option<Vec<u8>>,
    /// Require an `AUTH` handshake with this secret before the request.
    pub secret: Option<String>,
    /// Expect the server-side-preprocessing request shape (`CWD` + bundle).
    pub server_site: bool,
    /// Expect a `GCDA` presence token after the preprocessed source.
    pub expect_gcda: bool,
    /// File payloads travel zlib-compressed.
    pub compression: bool,
    /// Override the protocol version echoed in `DONE`.
    pub reply_protover: Option<u32>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            status: 0,
            object: b"\x7fELF mock object".to_vec(),
            stderr: Vec::new(),
            stdout: Vec::new(),
            deps: None,
            secret: None,
            server_site: false,
            expect_gcda: true,
            compression: false,
            reply_protover: None,
        }
    }
}

/// One request token the server observed.
#[derive(Debug, Clone)]
pub struct RecordedToken {
    pub tag: String,
    pub value: u32,
    /// Payload bytes, already inflated when the script compresses.
    pub payload: Option<Vec<u8>>,
}

/// A running mock server. The listener task stops when this is dropped.
pub struct MockServer {
    addr: SocketAddr,
    script: ServerScript,
    trace: Arc<Mutex<Vec<RecordedToken>>>,
    finished: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(script: ServerScript) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let trace = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));

        let loop_script = script.clone();
        let loop_trace = Arc::clone(&trace);
        let loop_finished = Arc::clone(&finished);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let script = loop_script.clone();
                let trace = Arc::clone(&loop_trace);
                let finished = Arc::clone(&loop_finished);
                tokio::spawn(async move {
                    handle_conn(stream, script, trace).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Ok(Self {
            addr,
            script,
            trace,
            finished,
            handle,
        })
    }

    /// A host spec pointing at this server, flags matching the script.
    pub fn host_spec(&self) -> HostSpec {
        let mut host = HostSpec::tcp(self.addr.ip().to_string(), self.addr.port());
        host.compression = self.script.compression;
        host.authenticate = self.script.secret.is_some();
        if self.script.server_site {
            host.cpp_where = CppWhere::Server;
            host.protover = crate::hosts::PROTO_SERVER_CPP;
        } else if self.script.compression {
            host.protover = crate::hosts::PROTO_COMPRESSED;
        }
        host
    }

    /// Everything recorded so far, request order preserved.
    pub fn trace(&self) -> Vec<RecordedToken> {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Just the tag names, for shape assertions.
    pub fn tags(&self) -> Vec<String> {
        self.trace().into_iter().map(|t| t.tag).collect()
    }

    /// Wait until at least `n` connections have fully drained.
    ///
    /// Needed by tests that abandon the connection without reading a
    /// response; the server may still be consuming the request.
    pub async fn wait_for_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.finished.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock server never saw {n} connection(s) complete");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn record(trace: &Mutex<Vec<RecordedToken>>, tag: Tag, value: u32, payload: Option<Vec<u8>>) {
    if let Ok(mut t) = trace.lock() {
        t.push(RecordedToken {
            tag: tag.to_string(),
            value,
            payload,
        });
    }
}

async fn read_recorded_payload<R>(
    r: &mut R,
    trace: &Mutex<Vec<RecordedToken>>,
    tag: Tag,
    len: u32,
    compressed: bool,
) -> Result<(), crate::DispatchError>
where
    R: AsyncRead + Unpin,
{
    let raw = wire::read_payload(r, len).await?;
    let bytes = if compressed { wire::inflate(&raw)? } else { raw };
    record(trace, tag, len, Some(bytes));
    Ok(())
}

async fn handle_conn(stream: TcpStream, script: ServerScript, trace: Arc<Mutex<Vec<RecordedToken>>>) {
    let (rx, tx) = stream.into_split();
    let mut rx = BufReader::new(rx);
    let mut tx = tx;
    // Any framing error or early EOF just ends the recording; tests assert
    // on what made it across.
    let _ = serve(&mut rx, &mut tx, &script, &trace).await;
}

async fn serve<R, W>(
    rx: &mut R,
    tx: &mut W,
    script: &ServerScript,
    trace: &Mutex<Vec<RecordedToken>>,
) -> Result<(), crate::DispatchError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(secret) = &script.secret {
        let given = wire::read_expected_str(rx, Tag::AUTH).await?;
        record(trace, Tag::AUTH, given.len() as u32, Some(given.clone().into_bytes()));
        let verdict = if given == *secret { "ok" } else { "no" };
        wire::write_token_str(tx, Tag::AUTH, verdict).await?;
        if verdict == "no" {
            return Ok(());
        }
    }

    let request_ver = wire::read_expected(rx, Tag::DIST).await?;
    record(trace, Tag::DIST, request_ver, None);

    if script.server_site {
        let cwd = wire::read_expected_str(rx, Tag::CWD).await?;
        record(trace, Tag::CWD, cwd.len() as u32, Some(cwd.into_bytes()));
    }

    let argc = wire::read_expected(rx, Tag::ARGC).await?;
    record(trace, Tag::ARGC, argc, None);
    for _ in 0..argc {
        let arg = wire::read_expected_str(rx, Tag::ARGV).await?;
        record(trace, Tag::ARGV, arg.len() as u32, Some(arg.into_bytes()));
    }

    if script.server_site {
        let count = wire::read_expected(rx, Tag::NFIL).await?;
        record(trace, Tag::NFIL, count, None);
        for _ in 0..count {
            let name = wire::read_expected_str(rx, Tag::NAME).await?;
            record(trace, Tag::NAME, name.len() as u32, Some(name.into_bytes()));
            let len = wire::read_expected(rx, Tag::FILE).await?;
            read_recorded_payload(rx, trace, Tag::FILE, len, script.compression).await?;
        }
    } else {
        let len = wire::read_expected(rx, Tag::DOTI).await?;
        read_recorded_payload(rx, trace, Tag::DOTI, len, script.compression).await?;

        if script.expect_gcda {
            let presence = wire::read_expected(rx, Tag::GCDA).await?;
            record(trace, Tag::GCDA, presence, None);
            if presence == 1 {
                let len = wire::read_expected(rx, Tag::DOTI).await?;
                read_recorded_payload(rx, trace, Tag::DOTI, len, script.compression).await?;
            }
        }
    }

    // Request fully read; answer from the script.
    let reply_ver = script.reply_protover.unwrap_or(request_ver);
    wire::write_token(tx, Tag::DONE, reply_ver).await?;
    wire::write_token(tx, Tag::STAT, script.status as u32).await?;
    wire::write_token_bytes(tx, Tag::SERR, &script.stderr).await?;
    wire::write_token_bytes(tx, Tag::SOUT, &script.stdout).await?;

    let object = if script.compression {
        wire::deflate(&script.object)?
    } else {
        script.object.clone()
    };
    wire::write_token_bytes(tx, Tag::DOTO, &object).await?;

    if let Some(deps) = &script.deps {
        let deps = if script.compression {
            wire::deflate(deps)?
        } else {
            deps.clone()
        };
        wire::write_token_bytes(tx, Tag::DOTD, &deps).await?;
    }

    Ok(())
}
