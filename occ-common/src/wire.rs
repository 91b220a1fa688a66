//! Token framing for the compile request protocol.
//!
//! Every message on the wire is a token: a four-ASCII tag followed by eight
//! lowercase hex digits. The hex field is either the token's integer value
//! (`DIST`, `ARGC`, `GCDA`, `STAT`) or the byte length of a binary payload
//! that follows (`ARGV`, `DOTI`, `DOTO`, ...). File payloads are optionally
//! zlib-compressed; the length prefix always counts wire bytes.

use crate::errors::DispatchError;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on any single payload. Preprocessed sources run to a few
/// megabytes; anything near this is a framing error, not a real file.
pub const MAX_PAYLOAD: u32 = 512 * 1024 * 1024;

/// Block size for streamed file copies.
pub const COPY_BLOCK: usize = 64 * 1024;

/// A four-ASCII token tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    /// Request preamble; value is the protocol version.
    pub const DIST: Tag = Tag(*b"DIST");
    /// Argument count.
    pub const ARGC: Tag = Tag(*b"ARGC");
    /// One argument; length-prefixed bytes.
    pub const ARGV: Tag = Tag(*b"ARGV");
    /// Client working directory (server-side preprocessing only).
    pub const CWD: Tag = Tag(*b"CWD\0");
    /// Preprocessed source or equivalent binary payload.
    pub const DOTI: Tag = Tag(*b"DOTI");
    /// Profile-data presence flag, 0 or 1.
    pub const GCDA: Tag = Tag(*b"GCDA");
    /// File count for a multi-file bundle.
    pub const NFIL: Tag = Tag(*b"NFIL");
    /// Bundle entry name.
    pub const NAME: Tag = Tag(*b"NAME");
    /// Bundle entry contents.
    pub const FILE: Tag = Tag(*b"FILE");
    /// Authentication handshake payload.
    pub const AUTH: Tag = Tag(*b"AUTH");
    /// Response preamble; value is the protocol version.
    pub const DONE: Tag = Tag(*b"DONE");
    /// Remote compiler wait status.
    pub const STAT: Tag = Tag(*b"STAT");
    /// Remote compiler stderr.
    pub const SERR: Tag = Tag(*b"SERR");
    /// Remote compiler stdout.
    pub const SOUT: Tag = Tag(*b"SOUT");
    /// Object file payload.
    pub const DOTO: Tag = Tag(*b"DOTO");
    /// Dependency file payload.
    pub const DOTD: Tag = Tag(*b"DOTD");

    pub fn as_str(&self) -> &str {
        // Tags are constructed from ASCII literals or validated on read.
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().trim_end_matches('\0'))
    }
}

fn bad_wire(context: impl Into<String>, source: std::io::Error) -> DispatchError {
    DispatchError::transport(context, source)
}

/// Write one token header: tag plus eight hex digits.
pub async fn write_token<W>(w: &mut W, tag: Tag, value: u32) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    let frame = format!("{}{:08x}", tag.as_str(), value);
    debug_assert_eq!(frame.len(), 12);
    w.write_all(frame.as_bytes())
        .await
        .map_err(|e| bad_wire(format!("write token {tag}"), e))
}

/// Write a token header followed by its binary payload.
pub async fn write_token_bytes<W>(w: &mut W, tag: Tag, payload: &[u8]) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > MAX_PAYLOAD as u64 {
        return Err(DispatchError::Protocol(format!(
            "{tag} payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    write_token(w, tag, payload.len() as u32).await?;
    w.write_all(payload)
        .await
        .map_err(|e| bad_wire(format!("write {tag} payload"), e))
}

/// Write a length-prefixed string token.
pub async fn write_token_str<W>(w: &mut W, tag: Tag, s: &str) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    write_token_bytes(w, tag, s.as_bytes()).await
}

/// Read one token header. Returns the tag and its hex field.
pub async fn read_token<R>(r: &mut R) -> Result<(Tag, u32), DispatchError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; 12];
    r.read_exact(&mut frame)
        .await
        .map_err(|e| bad_wire("read token", e))?;

    let tag = Tag([frame[0], frame[1], frame[2], frame[3]]);
    if !frame[..4]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == 0)
    {
        return Err(DispatchError::Protocol(format!(
            "garbled token tag {:?}",
            &frame[..4]
        )));
    }

    let hex = std::str::from_utf8(&frame[4..])
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| DispatchError::Protocol(format!("garbled length field on {tag}")))?;

    Ok((tag, hex))
}

/// Read a token and require a specific tag.
pub async fn read_expected<R>(r: &mut R, want: Tag) -> Result<u32, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let (tag, value) = read_token(r).await?;
    if tag != want {
        return Err(DispatchError::Protocol(format!(
            "expected token {want}, got {tag}"
        )));
    }
    Ok(value)
}

/// Read a payload of known length.
pub async fn read_payload<R>(r: &mut R, len: u32) -> Result<Vec<u8>, DispatchError>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_PAYLOAD {
        return Err(DispatchError::Protocol(format!(
            "payload of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| bad_wire("read payload", e))?;
    Ok(buf)
}

/// Read a token with the given tag and its string payload.
pub async fn read_expected_str<R>(r: &mut R, want: Tag) -> Result<String, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let len = read_expected(r, want).await?;
    let bytes = read_payload(r, len).await?;
    String::from_utf8(bytes)
        .map_err(|_| DispatchError::Protocol(format!("{want} payload is not UTF-8")))
}

/// Deflate a payload for the wire.
pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)
        .and_then(|_| enc.finish())
        .map_err(|e| DispatchError::io("compress payload", e))
}

/// Inflate a compressed payload.
pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| DispatchError::Protocol(format!("corrupt compressed payload: {e}")))?;
    Ok(out)
}

/// Send a file under `tag`, compressing when asked.
///
/// Returns the file's on-disk byte count (not the wire count), which is what
/// throughput reporting wants.
pub async fn send_file<W>(
    w: &mut W,
    tag: Tag,
    path: &Path,
    compress: bool,
) -> Result<u64, DispatchError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DispatchError::io(format!("read {}", path.display()), e))?;
    let disk_len = bytes.len() as u64;

    if compress {
        let packed = deflate(&bytes)?;
        write_token_bytes(w, tag, &packed).await?;
    } else {
        write_token_bytes(w, tag, &bytes).await?;
    }
    Ok(disk_len)
}

/// Receive a file payload of `wire_len` bytes into `path`, inflating when
/// the stream is compressed.
pub async fn recv_file<R>(
    r: &mut R,
    path: &Path,
    wire_len: u32,
    compressed: bool,
) -> Result<u64, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(r, wire_len).await?;
    let bytes = if compressed {
        inflate(&payload)?
    } else {
        payload
    };
    tokio::fs::write(path, &bytes)
        .await
        .map_err(|e| DispatchError::io(format!("write {}", path.display()), e))?;
    Ok(bytes.len() as u64)
}

/// Send a multi-file bundle: `NFIL` count, then a `NAME`/`FILE` pair per
/// entry. Used when the server runs the preprocessor.
pub async fn send_file_bundle<W>(
    w: &mut W,
    files: &[String],
    compress: bool,
) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    write_token(w, Tag::NFIL, files.len() as u32).await?;
    for name in files {
        write_token_str(w, Tag::NAME, name).await?;
        send_file(w, Tag::FILE, Path::new(name), compress).await?;
    }
    Ok(())
}
