//! The dispatch orchestrator.
//!
//! `dispatch` drives one compile across the network: connect, authenticate
//! when asked, frame the request, synchronize with the preprocessor, stream
//! the source and the profile side-channel, then collect results. The body
//! runs in an inner function; teardown lives in the epilogue so every exit
//! path, error or not, releases the preprocessing slot, closes the
//! transport, and reaps the tunnel child. Guard `Drop` impls cover
//! unwinding.
//!
//! Returning `Ok` promises only that communication worked; the remote
//! compiler's own disposition is in the outcome's status word.

use crate::auth::Authenticator;
use crate::cpp::{self, CppChild};
use crate::gcda;
use crate::lock::PreprocessSlot;
use crate::request;
use crate::results;
use crate::state::{Locality, Monitor, Phase};
use crate::transport::Transport;
use occ_common::cleanup::CleanupRegistry;
use occ_common::errors::DispatchError;
use occ_common::hosts::{CppWhere, HostSpec};
use occ_common::types::{CompileJob, DispatchOutcome};
use occ_common::wire::{self, Tag};
use std::time::Instant;
use tracing::{debug, info};

/// Collaborators injected into a dispatch, so tests can observe phases and
/// cleanup registrations without touching process-wide state.
pub struct DispatchContext<'a> {
    pub monitor: &'a dyn Monitor,
    pub cleanup: &'a CleanupRegistry,
    pub auth: &'a Authenticator,
}

/// Pass one compilation across the network.
///
/// The preprocessor child, when given, was forked before this call so its
/// work overlaps connection setup. A held preprocessing slot is released at
/// the first point where a peer can safely start preprocessing, and in
/// every case before return.
pub async fn dispatch(
    job: &CompileJob,
    host: &HostSpec,
    cpp: Option<CppChild>,
    slot: Option<PreprocessSlot>,
    ctx: &DispatchContext<'_>,
) -> Result<DispatchOutcome, DispatchError> {
    debug!(
        "dispatching {} to {}: {:?}",
        job.input, host.hostname, job.argv
    );

    let started = Instant::now();
    let mut slot = slot;
    let mut transport = None;

    let result = run(job, host, cpp, &mut slot, &mut transport, ctx, started).await;

    // Teardown, on every path: the slot if the run never got to it, then
    // the transport channels and the tunnel child behind them.
    if let Some(slot) = slot.take() {
        slot.release();
    }
    if let Some(transport) = transport.take() {
        transport.shutdown().await;
    }

    result
}

async fn run(
    job: &CompileJob,
    host: &HostSpec,
    cpp: Option<CppChild>,
    slot: &mut Option<PreprocessSlot>,
    transport: &mut Option<Transport>,
    ctx: &DispatchContext<'_>,
    started: Instant,
) -> Result<DispatchOutcome, DispatchError> {
    ctx.monitor.note_phase(
        Phase::Connect,
        Some(&job.input),
        Some(&host.hostname),
        Locality::Remote,
    );
    let t = transport.insert(Transport::open(host).await?);

    if host.authenticate {
        let security = ctx.auth.authenticate(&mut t.tx, &mut t.rx, host).await?;
        // Admission was the point; confidentiality and integrity services
        // stay unused.
        drop(security);
    }

    ctx.monitor
        .note_phase(Phase::Send, None, Some(&host.hostname), Locality::Remote);
    request::send_request(&mut t.tx, host, &job.argv).await?;

    let mut doti_bytes = 0u64;
    match host.cpp_where {
        CppWhere::Server => {
            wire::send_file_bundle(&mut t.tx, &job.files, host.compression).await?;
        }
        CppWhere::Client => {
            let cpp_status = cpp::wait_for_cpp(cpp, ctx.monitor, &job.input).await?;

            // Local preprocessing is over either way; free the slot before
            // streaming so a peer can start its own preprocessor.
            if let Some(slot) = slot.take() {
                slot.release();
            }

            if !cpp_status.success() {
                // The preprocessor's status is the job's outcome; nothing
                // to stream, no result to wait for.
                return Ok(DispatchOutcome {
                    compiler_status: cpp_status,
                    doti_bytes: 0,
                    host: host.hostname.clone(),
                    elapsed: started.elapsed(),
                });
            }

            doti_bytes =
                wire::send_file(&mut t.tx, Tag::DOTI, &job.cpp_output, host.compression).await?;
            gcda::stage_and_send(job, host, ctx.cleanup, &mut t.tx).await?;
        }
    }

    // The whole request is framed; push it out and wait on the compiler.
    // Kernel buffers being what they are, the server may lag well behind
    // the uncork.
    t.tx.uncork().await?;
    ctx.monitor
        .note_phase(Phase::Compile, None, Some(&host.hostname), Locality::Remote);

    let compiler_status = results::receive_results(&mut t.rx, job, host).await?;
    let elapsed = started.elapsed();

    if host.cpp_where == CppWhere::Client {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (doti_bytes as f64 / 1024.0) / secs
        } else {
            0.0
        };
        info!(
            "{} bytes from {} compiled on {} in {:.4}s, rate {:.0}kB/s",
            doti_bytes, job.input, host.hostname, secs, rate
        );
    }

    Ok(DispatchOutcome {
        compiler_status,
        doti_bytes,
        host: host.hostname.clone(),
        elapsed,
    })
}
