//! Receiving the server's reply.
//!
//! Reply order: `DONE` (protocol version echo), `STAT` (the remote
//! compiler's wait status), `SERR` and `SOUT` (captured compiler output),
//! `DOTO` (the object), and `DOTD` when the job asked for a dependency
//! file. File payloads are compressed whenever the host's compression flag
//! is on, same as the request direction.

use occ_common::errors::DispatchError;
use occ_common::hosts::HostSpec;
use occ_common::types::{CompileJob, WaitStatus};
use occ_common::wire::{self, Tag};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, trace};

/// Read the full result stream, storing outputs at the job's paths.
///
/// Returns the remote compiler's wait status. The object file is only
/// written when the remote compile produced one; a failed compile with an
/// empty `DOTO` leaves no stale object behind.
pub async fn receive_results<R>(
    rx: &mut R,
    job: &CompileJob,
    host: &HostSpec,
) -> Result<WaitStatus, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let reply_ver = wire::read_expected(rx, Tag::DONE).await?;
    if reply_ver != host.protover {
        return Err(DispatchError::Protocol(format!(
            "server spoke protocol {reply_ver}, expected {}",
            host.protover
        )));
    }

    let status = WaitStatus::from_raw(wire::read_expected(rx, Tag::STAT).await? as i32);
    trace!("remote compiler status: {:?}", status);

    let serr_len = wire::read_expected(rx, Tag::SERR).await?;
    wire::recv_file(rx, &job.server_stderr, serr_len, host.compression).await?;

    let sout_len = wire::read_expected(rx, Tag::SOUT).await?;
    let sout = wire::read_payload(rx, sout_len).await?;
    let sout = if host.compression {
        wire::inflate(&sout)?
    } else {
        sout
    };
    if !sout.is_empty() {
        // The remote compiler's stdout belongs on ours.
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(&sout)
            .await
            .map_err(|e| DispatchError::io("forward remote stdout", e))?;
        let _ = stdout.flush().await;
    }

    let doto_len = wire::read_expected(rx, Tag::DOTO).await?;
    if doto_len == 0 && !status.success() {
        debug!("remote compile failed, no object delivered");
    } else {
        let written =
            wire::recv_file(rx, &job.object_output, doto_len, host.compression).await?;
        debug!(
            "object: {} byte(s) -> {}",
            written,
            job.object_output.display()
        );
    }

    if let Some(deps) = &job.deps_output {
        let dotd_len = wire::read_expected(rx, Tag::DOTD).await?;
        wire::recv_file(rx, deps, dotd_len, host.compression).await?;
    }

    Ok(status)
}
