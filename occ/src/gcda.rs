//! Profile-data staging: the `.gcda` side-channel.
//!
//! A build compiled with `-fprofile-use` wants the profile counters file
//! that matches the object being produced. The server cannot read the
//! client's filesystem, so the client locates the `.gcda`, copies it to a
//! staging file next to the preprocessed source, and ships it right after
//! the `DOTI` payload, announced by a `GCDA 1` token. When anything about
//! staging goes wrong short of a wire failure, the side-channel degrades to
//! `GCDA 0` and the compile proceeds without profile data.
//!
//! Staged copies are registered with the cleanup registry the moment they
//! exist, so an exiting process removes them even if dispatch aborts.

use occ_common::cleanup::CleanupRegistry;
use occ_common::config;
use occ_common::errors::DispatchError;
use occ_common::hosts::HostSpec;
use occ_common::types::CompileJob;
use occ_common::wire::{self, COPY_BLOCK, Tag};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// A `-fprofile-use` request found in the argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUse {
    /// Explicit profile directory from `-fprofile-use=DIR`, when given.
    pub dir: Option<PathBuf>,
}

/// Scan the argument vector for a profile-use request.
///
/// Matches the exact flag or the `=DIR` form; later occurrences override
/// earlier ones, as the compiler's own last-wins rule does.
pub fn parse_profile_use(argv: &[String]) -> Option<ProfileUse> {
    let mut request = None;
    for arg in argv {
        if arg == "-fprofile-use" {
            request = Some(ProfileUse { dir: None });
        } else if let Some(rest) = arg.strip_prefix("-fprofile-use=") {
            request = Some(ProfileUse {
                dir: (!rest.is_empty()).then(|| PathBuf::from(rest)),
            });
        }
    }
    request
}

/// Flatten a path into a single filename component: `..` becomes `^`,
/// bare `.` segments drop out, and the rest join with `#`.
pub fn mangle_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| *segment != ".")
        .map(|segment| if segment == ".." { "^" } else { segment })
        .collect();
    segments.join("#")
}

/// The name minus its extension, if the final component has one.
fn strip_extension(name: &str) -> &str {
    let base_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[base_start..].rfind('.') {
        Some(i) if i > 0 => &name[..base_start + i],
        _ => name,
    }
}

/// Where the compiler will look for this object's profile counters.
///
/// With an explicit profile directory the compiler flattens the object
/// path into a mangled filename; without one it reads next to the object.
pub fn resolve_gcda_source(output: &str, cwd: &Path, profile_dir: Option<&Path>) -> PathBuf {
    let stem = strip_extension(output);
    let relative = !output.starts_with('/');

    match profile_dir {
        Some(dir) if relative => dir.join(format!(
            "{}#{}.gcda",
            mangle_path(&cwd.to_string_lossy()),
            mangle_path(stem)
        )),
        Some(dir) => dir.join(format!("{}.gcda", mangle_path(stem))),
        None if relative => cwd.join(format!("{stem}.gcda")),
        None => PathBuf::from(format!("{stem}.gcda")),
    }
}

/// Staging filename: the preprocessed source's sibling with the extension
/// swapped to `.gcda`. The retry attempt folds in the pid so a second name
/// cannot collide with the first.
fn staging_path(cpp_output: &Path, attempt: u32) -> PathBuf {
    let name = cpp_output.to_string_lossy();
    let stem = strip_extension(&name);
    if attempt == 0 {
        PathBuf::from(format!("{stem}.gcda"))
    } else {
        PathBuf::from(format!("{stem}.{}.gcda", std::process::id()))
    }
}

async fn open_new(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path).await
}

/// Create the staging file: one attempt at the natural name, one at a
/// regenerated name, then give up.
async fn create_staging_file(cpp_output: &Path) -> io::Result<(PathBuf, File)> {
    let first = staging_path(cpp_output, 0);
    match open_new(&first).await {
        Ok(f) => Ok((first, f)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            trace!("staging name {} taken, regenerating", first.display());
            let retry = staging_path(cpp_output, 1);
            let f = open_new(&retry).await?;
            Ok((retry, f))
        }
        Err(e) => Err(e),
    }
}

/// The staging tmpdir must be writable and searchable before any copy
/// starts; a broken tmpdir fails the dispatch rather than degrading.
async fn ensure_tmpdir_usable() -> Result<(), DispatchError> {
    let tmp = config::tmp_top();
    let probe = tmp.join(format!(".occ-probe-{}", std::process::id()));
    let _ = tokio::fs::remove_file(&probe).await;
    let created = open_new(&probe)
        .await
        .map_err(|e| DispatchError::io(format!("unusable tmpdir {}", tmp.display()), e))?;
    drop(created);
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

/// Stream `src` into `dst` in fixed-size blocks, surfacing short writes.
async fn copy_blocks(src: &mut File, dst: &mut File) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BLOCK];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

/// Locate, stage, and register the profile data for this job.
///
/// `Ok(None)` means "no staged file, announce absence": either no request,
/// no counters on disk, or a degradable staging failure. `Err` is reserved
/// for conditions that must abort the dispatch (unusable tmpdir).
async fn prepare_staging(
    job: &CompileJob,
    cleanup: &CleanupRegistry,
) -> Result<Option<PathBuf>, DispatchError> {
    let Some(profile) = parse_profile_use(&job.argv) else {
        return Ok(None);
    };

    let output = job.object_output.to_string_lossy();
    if output.is_empty() {
        return Ok(None);
    }

    ensure_tmpdir_usable().await?;

    let cwd = std::env::current_dir().map_err(|e| DispatchError::io("current_dir", e))?;
    let source = resolve_gcda_source(&output, &cwd, profile.dir.as_deref());
    trace!("profile data expected at {}", source.display());

    let mut src = match File::open(&source).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!("no profile data at {}", source.display());
            return Ok(None);
        }
        Err(e) => {
            warn!("cannot read profile data {}: {}", source.display(), e);
            return Ok(None);
        }
    };

    let (staged, mut dst) = match create_staging_file(&job.cpp_output).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("cannot create profile staging file: {e}");
            return Ok(None);
        }
    };

    if let Err(e) = copy_blocks(&mut src, &mut dst).await {
        warn!("staging copy of {} failed: {}", source.display(), e);
        drop(dst);
        let _ = tokio::fs::remove_file(&staged).await;
        return Ok(None);
    }
    drop(dst);

    if cleanup.register(&staged).is_err() {
        let _ = tokio::fs::remove_file(&staged).await;
        return Ok(None);
    }

    trace!(
        "staged profile data {} -> {}",
        source.display(),
        staged.display()
    );
    Ok(Some(staged))
}

/// Announce and ship profile data after the preprocessed source.
///
/// Emits exactly one `GCDA` presence token per request; a staged file
/// follows a `1` immediately, under `DOTI`. Distributed LTO suppresses the
/// side-channel entirely: no token at all.
pub async fn stage_and_send<W>(
    job: &CompileJob,
    host: &HostSpec,
    cleanup: &CleanupRegistry,
    tx: &mut W,
) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    if job.dist_lto {
        return Ok(());
    }

    match prepare_staging(job, cleanup).await? {
        Some(staged) => {
            wire::write_token(tx, Tag::GCDA, 1).await?;
            wire::send_file(tx, Tag::DOTI, &staged, host.compression).await?;
        }
        None => {
            wire::write_token(tx, Tag::GCDA, 0).await?;
        }
    }
    Ok(())
}
