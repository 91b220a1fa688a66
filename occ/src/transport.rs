//! Transport setup and teardown.
//!
//! A transport is a send channel and a receive channel to the chosen host.
//! Over TCP both are halves of one socket; over a tunnel they are the pipe
//! ends of a spawned child (typically ssh), which must be reaped at
//! teardown.
//!
//! The send channel is buffered: small token writes coalesce until the
//! dispatcher uncorks it, once the whole request is framed.

use occ_common::errors::DispatchError;
use occ_common::hosts::{HostMode, HostSpec};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// Arguments appended after the destination when spawning a tunnel; the
/// remote side must exec the server in inetd mode on its stdio.
const TUNNEL_SERVER_ARGS: [&str; 2] = ["occd", "--inetd"];

type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Buffered send half of a transport.
pub struct SendChannel {
    inner: BufWriter<BoxedWrite>,
}

impl std::fmt::Debug for SendChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendChannel").finish_non_exhaustive()
    }
}

impl SendChannel {
    fn new(w: BoxedWrite) -> Self {
        Self {
            inner: BufWriter::new(w),
        }
    }

    /// Push everything buffered onto the wire. The inverse of the
    /// coalescing mode the channel starts in.
    pub async fn uncork(&mut self) -> Result<(), DispatchError> {
        self.inner
            .flush()
            .await
            .map_err(|e| DispatchError::transport("flush send channel", e))
    }
}

impl AsyncWrite for SendChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Buffered receive half of a transport.
pub struct RecvChannel {
    inner: BufReader<BoxedRead>,
}

impl std::fmt::Debug for RecvChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvChannel").finish_non_exhaustive()
    }
}

impl RecvChannel {
    fn new(r: BoxedRead) -> Self {
        Self {
            inner: BufReader::new(r),
        }
    }
}

impl AsyncRead for RecvChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// An open connection to a build server.
#[derive(Debug)]
pub struct Transport {
    pub tx: SendChannel,
    pub rx: RecvChannel,
    tunnel: Option<Child>,
}

impl Transport {
    /// Open a transport for `host`.
    ///
    /// No descriptor outlives a failure here: every handle is owned, so an
    /// error return drops whatever was opened.
    pub async fn open(host: &HostSpec) -> Result<Self, DispatchError> {
        match host.mode {
            HostMode::Tcp => Self::open_tcp(host).await,
            HostMode::Tunnel => Self::open_tunnel(host),
        }
    }

    async fn open_tcp(host: &HostSpec) -> Result<Self, DispatchError> {
        let stream = TcpStream::connect((host.hostname.as_str(), host.port))
            .await
            .map_err(|e| DispatchError::transport(format!("connect {}", host.address()), e))?;
        trace!("connected to {}", host.address());
        let (rx, tx) = stream.into_split();
        Ok(Self {
            tx: SendChannel::new(Box::new(tx)),
            rx: RecvChannel::new(Box::new(rx)),
            tunnel: None,
        })
    }

    fn open_tunnel(host: &HostSpec) -> Result<Self, DispatchError> {
        let mut words = host.tunnel_command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| DispatchError::Logic("empty tunnel command".into()))?;

        let destination = match &host.user {
            Some(user) => format!("{user}@{}", host.hostname),
            None => host.hostname.clone(),
        };

        let mut cmd = Command::new(program);
        cmd.args(words)
            .arg(&destination)
            .args(TUNNEL_SERVER_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            DispatchError::transport(format!("spawn tunnel '{}' to {destination}", program), e)
        })?;
        debug!("tunnel to {destination} spawned, pid {:?}", child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Logic("tunnel child has no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Logic("tunnel child has no stdout pipe".into()))?;

        Ok(Self {
            tx: SendChannel::new(Box::new(stdin)),
            rx: RecvChannel::new(Box::new(stdout)),
            tunnel: Some(child),
        })
    }

    /// Tear the transport down: close the send side (so the server can
    /// finish), close the receive side, then reap the tunnel child if one
    /// exists. Never errors; teardown runs on every exit path and has
    /// nothing useful to do with a failure beyond logging it.
    pub async fn shutdown(self) {
        let Transport {
            mut tx,
            rx,
            mut tunnel,
        } = self;

        if let Err(e) = tx.shutdown().await {
            debug!("send channel shutdown: {e}");
        }
        drop(tx);
        drop(rx);

        // The tunnel's stdin is gone now, so a healthy child exits on its
        // own; reap it rather than leaving a zombie.
        if let Some(child) = tunnel.as_mut() {
            match child.wait().await {
                Ok(status) => debug!("tunnel child exited: {status}"),
                Err(e) => warn!("failed to reap tunnel child: {e}"),
            }
        }
    }

    /// Pid of the tunnel child, when one was spawned.
    pub fn tunnel_pid(&self) -> Option<u32> {
        self.tunnel.as_ref().and_then(Child::id)
    }
}
