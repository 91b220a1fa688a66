//! End-to-end dispatch scenarios against the in-process mock server.

use occ::auth::Authenticator;
use occ::cpp::CppChild;
use occ::dispatch::{DispatchContext, dispatch};
use occ::gcda;
use occ::lock::PreprocessSlot;
use occ::state::{Phase, RecordingMonitor};
use occ_common::cleanup::CleanupRegistry;
use occ_common::hosts::{HostMode, HostSpec};
use occ_common::mock_server::{MockServer, ServerScript};
use occ_common::types::CompileJob;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;

const PREPROCESSED: &[u8] = b"int widget(void) { return 42; }\n";

struct Fixture {
    dir: TempDir,
    job: CompileJob,
    monitor: RecordingMonitor,
    cleanup: CleanupRegistry,
    auth: Authenticator,
}

impl Fixture {
    fn new(argv: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cpp_output = dir.path().join("widget.i");
        std::fs::write(&cpp_output, PREPROCESSED).unwrap();

        let job = CompileJob {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            input: "widget.c".to_string(),
            cpp_output,
            files: Vec::new(),
            object_output: dir.path().join("widget.o"),
            deps_output: None,
            server_stderr: dir.path().join("server-stderr.txt"),
            dist_lto: false,
        };

        Self {
            dir,
            job,
            monitor: RecordingMonitor::new(),
            cleanup: CleanupRegistry::new(),
            auth: Authenticator::None,
        }
    }

    fn context(&self) -> DispatchContext<'_> {
        DispatchContext {
            monitor: &self.monitor,
            cleanup: &self.cleanup,
            auth: &self.auth,
        }
    }

    fn slot_dir(&self) -> PathBuf {
        self.dir.path().join("locks")
    }

    fn slot(&self) -> PreprocessSlot {
        PreprocessSlot::acquire(&self.slot_dir(), 1).unwrap()
    }

    fn assert_slot_free(&self) {
        assert!(
            PreprocessSlot::try_acquire(&self.slot_dir(), 1)
                .unwrap()
                .is_some(),
            "preprocess slot still held after dispatch"
        );
    }
}

fn finished_cpp() -> CppChild {
    // A child that exits 0 immediately: the preprocessor has already run
    // by the time the dispatcher waits on it.
    CppChild::new(Command::new("true").spawn().unwrap())
}

fn failing_cpp(code: u32) -> CppChild {
    CppChild::new(
        Command::new("sh")
            .arg("-c")
            .arg(format!("exit {code}"))
            .spawn()
            .unwrap(),
    )
}

// ---------------------------------------------------------------------------
// Plain client-side preprocessing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_plain_dispatch_token_sequence_ends_doti_gcda_zero() {
    let server = MockServer::start(ServerScript::default()).await.unwrap();
    let fx = Fixture::new(&["cc", "-c", "a.i", "-o", "a.o"]);

    let outcome = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    assert!(outcome.compiler_status.success());
    assert_eq!(outcome.doti_bytes, PREPROCESSED.len() as u64);
    fx.assert_slot_free();

    let tags = server.tags();
    assert_eq!(
        tags,
        [
            "DIST", "ARGC", "ARGV", "ARGV", "ARGV", "ARGV", "ARGV", "DOTI", "GCDA"
        ]
    );

    let trace = server.trace();
    let argc = &trace[1];
    assert_eq!(argc.value, 5);
    let doti = trace.iter().find(|t| t.tag == "DOTI").unwrap();
    assert_eq!(doti.payload.as_deref(), Some(PREPROCESSED));
    let gcda = trace.iter().find(|t| t.tag == "GCDA").unwrap();
    assert_eq!(gcda.value, 0);
}

#[tokio::test]
async fn test_object_bytes_round_trip_exactly() {
    let object = (0u32..4096).flat_map(|n| n.to_le_bytes()).collect::<Vec<u8>>();
    let server = MockServer::start(ServerScript {
        object: object.clone(),
        stderr: b"widget.c: note: remote\n".to_vec(),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c", "-o", "widget.o"]);

    dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(&fx.job.object_output).unwrap(), object);
    assert_eq!(
        std::fs::read(&fx.job.server_stderr).unwrap(),
        b"widget.c: note: remote\n"
    );
}

#[tokio::test]
async fn test_compressed_dispatch_round_trips() {
    let object = vec![0x42u8; 50_000];
    let server = MockServer::start(ServerScript {
        compression: true,
        object: object.clone(),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c", "-o", "widget.o"]);

    let outcome = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    // Reported bytes are the on-disk size, not the wire size.
    assert_eq!(outcome.doti_bytes, PREPROCESSED.len() as u64);
    assert_eq!(std::fs::read(&fx.job.object_output).unwrap(), object);

    // The mock inflates payloads before recording; the preprocessed source
    // must have crossed intact.
    let trace = server.trace();
    let doti = trace.iter().find(|t| t.tag == "DOTI").unwrap();
    assert_eq!(doti.payload.as_deref(), Some(PREPROCESSED));
}

#[tokio::test]
async fn test_phases_run_connect_send_cpp_compile() {
    let server = MockServer::start(ServerScript::default()).await.unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c"]);

    dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    assert_eq!(
        fx.monitor.phases(),
        [Phase::Connect, Phase::Send, Phase::Cpp, Phase::Compile]
    );
}

#[tokio::test]
async fn test_remote_compile_failure_still_tears_down_cleanly() {
    let server = MockServer::start(ServerScript {
        status: 1 << 8,
        stderr: b"widget.c:3: error: oops\n".to_vec(),
        object: Vec::new(),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c"]);

    let outcome = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    // Transport worked; the compile itself failed.
    assert!(!outcome.compiler_status.success());
    assert_eq!(outcome.compiler_status.exit_code(), Some(1));
    assert!(!fx.job.object_output.exists());
    fx.assert_slot_free();
}

// ---------------------------------------------------------------------------
// Profile-data side-channel
// ---------------------------------------------------------------------------

fn plant_counters(fx: &Fixture, profile_dir: &Path, bytes: &[u8]) -> String {
    let stem = fx.job.object_output.to_string_lossy();
    let stem = stem.trim_end_matches(".o");
    let name = format!("{}.gcda", gcda::mangle_path(stem));
    std::fs::write(profile_dir.join(&name), bytes).unwrap();
    name
}

#[tokio::test]
async fn test_profile_use_ships_staged_counters() {
    let server = MockServer::start(ServerScript::default()).await.unwrap();
    let fx = {
        let mut fx = Fixture::new(&["cc", "-c", "widget.c", "-o", "widget.o"]);
        let profile_dir = fx.dir.path().join("profile");
        std::fs::create_dir(&profile_dir).unwrap();
        fx.job
            .argv
            .insert(1, format!("-fprofile-use={}", profile_dir.display()));
        fx
    };
    let profile_dir = fx.dir.path().join("profile");
    let counters = b"profile counter payload".to_vec();
    plant_counters(&fx, &profile_dir, &counters);

    dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    let tags = server.tags();
    // GCDA 1 and the counters payload follow the preprocessed source.
    assert_eq!(&tags[tags.len() - 3..], ["DOTI", "GCDA", "DOTI"]);
    let trace = server.trace();
    let gcda_token = trace.iter().find(|t| t.tag == "GCDA").unwrap();
    assert_eq!(gcda_token.value, 1);
    assert_eq!(
        trace.last().unwrap().payload.as_deref(),
        Some(counters.as_slice())
    );

    // The staged copy is registered for unlink-on-exit, and draining
    // removes it.
    let staged = fx.dir.path().join("widget.gcda");
    assert!(fx.cleanup.contains(&staged));
    assert!(staged.exists());
    fx.cleanup.drain();
    assert!(!staged.exists());
}

#[tokio::test]
async fn test_profile_use_without_counters_announces_absence() {
    let server = MockServer::start(ServerScript::default()).await.unwrap();
    let fx = {
        let mut fx = Fixture::new(&["cc", "-c", "widget.c", "-o", "widget.o"]);
        let profile_dir = fx.dir.path().join("profile");
        std::fs::create_dir(&profile_dir).unwrap();
        fx.job
            .argv
            .insert(1, format!("-fprofile-use={}", profile_dir.display()));
        fx
    };

    dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    let trace = server.trace();
    let gcda_token = trace.iter().find(|t| t.tag == "GCDA").unwrap();
    assert_eq!(gcda_token.value, 0);
    assert_eq!(server.tags().last().map(String::as_str), Some("GCDA"));
    assert!(!fx.dir.path().join("widget.gcda").exists());
    assert!(fx.cleanup.registered().is_empty());
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tunnel_spawn_failure_returns_transport_error() {
    let fx = Fixture::new(&["cc", "-c", "widget.c"]);
    let mut host = HostSpec::tcp("farm01", 3632);
    host.mode = HostMode::Tunnel;
    host.tunnel_command = "/nonexistent/occ-tunnel".to_string();

    let err = dispatch(
        &fx.job,
        &host,
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap_err();

    assert!(err.is_transport());
    fx.assert_slot_free();
}

#[tokio::test]
async fn test_connect_failure_releases_slot() {
    // Grab a port then free it so nothing is listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fx = Fixture::new(&["cc", "-c", "widget.c"]);
    let host = HostSpec::tcp(addr.ip().to_string(), addr.port());

    let err = dispatch(
        &fx.job,
        &host,
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap_err();

    assert!(err.is_transport());
    fx.assert_slot_free();
}

#[tokio::test]
async fn test_cpp_failure_sends_no_source_and_reports_cpp_status() {
    let server = MockServer::start(ServerScript::default()).await.unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c"]);

    let outcome = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(failing_cpp(44)),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    // Dispatch itself succeeded; the status word carries the cpp failure.
    assert!(!outcome.compiler_status.success());
    assert_eq!(outcome.compiler_status.exit_code(), Some(44));
    assert_eq!(outcome.doti_bytes, 0);
    fx.assert_slot_free();

    // The server saw the request head and then EOF: no DOTI, no GCDA, and
    // no result was waited for.
    server.wait_for_connections(1).await;
    let tags = server.tags();
    assert!(tags.iter().all(|t| t != "DOTI" && t != "GCDA"), "{tags:?}");
    assert!(!fx.job.object_output.exists());
}

#[tokio::test]
async fn test_protocol_version_mismatch_is_protocol_error() {
    let server = MockServer::start(ServerScript {
        reply_protover: Some(9),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let fx = Fixture::new(&["cc", "-c", "widget.c"]);

    let err = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, occ_common::DispatchError::Protocol(_)));
    fx.assert_slot_free();
}

// ---------------------------------------------------------------------------
// Server-side preprocessing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_server_site_sends_cwd_and_file_bundle() {
    let server = MockServer::start(ServerScript {
        server_site: true,
        ..ServerScript::default()
    })
    .await
    .unwrap();

    let mut fx = Fixture::new(&["cc", "-c", "x.c", "-o", "x.o"]);
    let x_c = fx.dir.path().join("x.c");
    let y_h = fx.dir.path().join("y.h");
    std::fs::write(&x_c, b"#include \"y.h\"\nint x;\n").unwrap();
    std::fs::write(&y_h, b"extern int x;\n").unwrap();
    fx.job.files = vec![
        x_c.to_string_lossy().into_owned(),
        y_h.to_string_lossy().into_owned(),
    ];

    // No preprocessor child and no slot on this path.
    let outcome = dispatch(&fx.job, &server.host_spec(), None, None, &fx.context())
        .await
        .unwrap();
    assert!(outcome.compiler_status.success());

    let tags = server.tags();
    assert_eq!(
        tags,
        [
            "DIST", "CWD", "ARGC", "ARGV", "ARGV", "ARGV", "ARGV", "ARGV", "NFIL", "NAME",
            "FILE", "NAME", "FILE"
        ]
    );
    let trace = server.trace();
    assert_eq!(trace[0].value, occ_common::hosts::PROTO_SERVER_CPP);
    let nfil = trace.iter().find(|t| t.tag == "NFIL").unwrap();
    assert_eq!(nfil.value, 2);
    // No cpp phase was announced and no GCDA token crossed the wire.
    assert!(fx.monitor.phases().iter().all(|p| *p != Phase::Cpp));
    assert!(tags.iter().all(|t| t != "GCDA"));
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_authenticated_dispatch_succeeds_with_matching_secret() {
    let server = MockServer::start(ServerScript {
        secret: Some("sesame".to_string()),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let mut fx = Fixture::new(&["cc", "-c", "widget.c"]);
    fx.auth = Authenticator::SharedSecret("sesame".to_string());

    let outcome = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    assert!(outcome.compiler_status.success());
    assert_eq!(server.tags().first().map(String::as_str), Some("AUTH"));
}

#[tokio::test]
async fn test_wrong_secret_is_auth_error_and_releases_slot() {
    let server = MockServer::start(ServerScript {
        secret: Some("sesame".to_string()),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let mut fx = Fixture::new(&["cc", "-c", "widget.c"]);
    fx.auth = Authenticator::SharedSecret("mellon".to_string());

    let err = dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, occ_common::DispatchError::Auth(_)));
    fx.assert_slot_free();
}

// ---------------------------------------------------------------------------
// Dependency output
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dependency_file_is_delivered_when_requested() {
    let deps = b"widget.o: widget.c widget.h\n".to_vec();
    let server = MockServer::start(ServerScript {
        deps: Some(deps.clone()),
        ..ServerScript::default()
    })
    .await
    .unwrap();
    let mut fx = Fixture::new(&["cc", "-c", "widget.c", "-MF", "widget.d"]);
    fx.job.deps_output = Some(fx.dir.path().join("widget.d"));

    dispatch(
        &fx.job,
        &server.host_spec(),
        Some(finished_cpp()),
        Some(fx.slot()),
        &fx.context(),
    )
    .await
    .unwrap();

    assert_eq!(
        std::fs::read(fx.dir.path().join("widget.d")).unwrap(),
        deps
    );
}
