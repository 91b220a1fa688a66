//! Authentication handshake for hosts that demand it.
//!
//! A preshared secret travels under the `AUTH` token and the server answers
//! with `ok` or `no`. The handshake yields a [`SecurityContext`], which the
//! dispatcher discards immediately: the channel's confidentiality and
//! integrity services are not used, only admission.

use occ_common::errors::DispatchError;
use occ_common::hosts::HostSpec;
use occ_common::wire::{self, Tag};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Evidence of a completed handshake. Holds nothing the dispatcher needs;
/// exists so callers consciously drop it.
#[derive(Debug)]
pub struct SecurityContext {
    pub peer: String,
}

/// How to authenticate against a host that requires it.
#[derive(Debug, Clone, Default)]
pub enum Authenticator {
    /// Refuse to talk to authenticating hosts.
    #[default]
    None,
    /// Present a preshared secret.
    SharedSecret(String),
}

impl Authenticator {
    /// Run the handshake on an open channel.
    pub async fn authenticate<W, R>(
        &self,
        tx: &mut W,
        rx: &mut R,
        host: &HostSpec,
    ) -> Result<SecurityContext, DispatchError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let secret = match self {
            Authenticator::None => {
                return Err(DispatchError::Auth(format!(
                    "host {} requires authentication but no secret is configured",
                    host.hostname
                )));
            }
            Authenticator::SharedSecret(secret) => secret,
        };

        wire::write_token_str(tx, Tag::AUTH, secret).await?;
        // The server cannot answer until it sees the token.
        tokio::io::AsyncWriteExt::flush(tx)
            .await
            .map_err(|e| DispatchError::transport("flush auth token", e))?;

        let verdict = wire::read_expected_str(rx, Tag::AUTH).await?;
        if verdict != "ok" {
            return Err(DispatchError::Auth(format!(
                "host {} rejected our credentials",
                host.hostname
            )));
        }

        debug!("authenticated to {}", host.hostname);
        Ok(SecurityContext {
            peer: host.hostname.clone(),
        })
    }
}
