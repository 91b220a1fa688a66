//! Request framing: preamble, working directory, argument vector.

use occ_common::errors::DispatchError;
use occ_common::hosts::{CppWhere, HostSpec};
use occ_common::wire::{self, Tag};
use tokio::io::AsyncWrite;
use tracing::trace;

/// Frame the request head onto the send channel.
///
/// Order on the wire: `DIST` with the negotiated protocol version, the
/// client working directory when the server preprocesses, then `ARGC` and
/// one `ARGV` per argument. The channel is still corked; nothing is
/// guaranteed to hit the network until the dispatcher uncorks it.
pub async fn send_request<W>(
    tx: &mut W,
    host: &HostSpec,
    argv: &[String],
) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    wire::write_token(tx, Tag::DIST, host.protover).await?;

    if host.cpp_where == CppWhere::Server {
        let cwd = std::env::current_dir().map_err(|e| DispatchError::io("current_dir", e))?;
        wire::write_token_str(tx, Tag::CWD, &cwd.to_string_lossy()).await?;
    }

    wire::write_token(tx, Tag::ARGC, argv.len() as u32).await?;
    for arg in argv {
        wire::write_token_str(tx, Tag::ARGV, arg).await?;
    }
    trace!("framed request: {} argument(s)", argv.len());
    Ok(())
}
