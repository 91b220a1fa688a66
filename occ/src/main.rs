//! occ - offload a compiler invocation to a remote build server.
//!
//! The binary stays thin: pick a host, fork the preprocessor, take a local
//! slot, and hand everything to the dispatch engine. Whether a command is
//! worth offloading at all is the caller's call, not ours.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use occ::auth::Authenticator;
use occ::cpp::CppChild;
use occ::dispatch::{DispatchContext, dispatch};
use occ::lock::PreprocessSlot;
use occ::state::TracingMonitor;
use occ_common::cleanup::CleanupRegistry;
use occ_common::config::{self, Config};
use occ_common::hosts::{CppWhere, HostSpec};
use occ_common::types::CompileJob;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Parser)]
#[command(name = "occ")]
#[command(author, version, about = "Offload a compiler invocation to a remote build server")]
struct Cli {
    /// Host spec to use (default: first entry of OCC_HOSTS)
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit machine-readable phase events on stderr (JSON lines)
    #[arg(long)]
    events: bool,

    /// Compiler command, e.g. `occ -- cc -c foo.c -o foo.o`
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required = true
    )]
    command: Vec<String>,
}

/// Extensions that mark the compile input in an argument vector.
const SOURCE_EXTS: [&str; 9] = ["c", "cc", "cpp", "cxx", "C", "i", "ii", "m", "mm"];

fn find_input(argv: &[String]) -> Option<String> {
    argv.iter()
        .skip(1)
        .find(|a| {
            !a.starts_with('-')
                && Path::new(a.as_str())
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SOURCE_EXTS.contains(&e))
        })
        .cloned()
}

/// The value following `flag`, if present.
fn find_flag_value(argv: &[String], flag: &str) -> Option<String> {
    argv.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

/// Rewrite the compile command into its preprocess-only form: `-c` becomes
/// `-E` and the output lands at the staging path.
fn build_cpp_argv(argv: &[String], cpp_output: &Path) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len() + 2);
    let mut had_output = false;
    let mut args = argv.iter();
    while let Some(arg) = args.next() {
        if arg == "-c" {
            out.push("-E".to_string());
        } else if arg == "-o" {
            args.next();
            out.push("-o".to_string());
            out.push(cpp_output.display().to_string());
            had_output = true;
        } else {
            out.push(arg.clone());
        }
    }
    if !had_output {
        out.push("-o".to_string());
        out.push(cpp_output.display().to_string());
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("reading OCC_* environment")?;
    occ_common::init_logging(if cli.verbose { "debug" } else { &config.log_level });

    let list = match (&cli.host, &config.hosts) {
        (Some(spec), _) => spec.clone(),
        (None, Some(spec)) => spec.clone(),
        (None, None) => bail!("no build servers: pass --host or set OCC_HOSTS"),
    };
    let mut hosts = HostSpec::parse_list(&list).context("parsing host list")?;
    let mut host = hosts.remove(0);
    host.tunnel_command = config.tunnel_command.clone();

    let argv = cli.command;
    let input = find_input(&argv)
        .with_context(|| format!("no source file found in command: {argv:?}"))?;
    let object_output = find_flag_value(&argv, "-o")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let stem = Path::new(&input)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "a".to_string());
            PathBuf::from(format!("{stem}.o"))
        });

    let tmp = config::tmp_top();
    let pid = std::process::id();
    let stem = Path::new(&input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let cpp_output = tmp.join(format!("occ_{pid}_{stem}.i"));
    let server_stderr = tmp.join(format!("occ_{pid}_{stem}.stderr"));

    let cleanup = CleanupRegistry::global();
    cleanup.register(&cpp_output).ok();
    cleanup.register(&server_stderr).ok();

    let job = CompileJob {
        argv: argv.clone(),
        input: input.clone(),
        cpp_output,
        files: vec![input.clone()],
        object_output,
        deps_output: find_flag_value(&argv, "-MF").map(PathBuf::from),
        server_stderr,
        dist_lto: argv.iter().any(|a| a == "-flto"),
    };

    // Client-side preprocessing: take a slot, then fork cpp so it overlaps
    // with connection setup.
    let (cpp_child, slot) = if host.cpp_where == CppWhere::Client {
        let slot = PreprocessSlot::acquire(&config.state_dir.join("locks"), config.slots)
            .context("acquiring preprocess slot")?;
        let cpp_argv = build_cpp_argv(&argv, &job.cpp_output);
        debug!("preprocessing: {cpp_argv:?}");
        let child = Command::new(&cpp_argv[0])
            .args(&cpp_argv[1..])
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning preprocessor {}", cpp_argv[0]))?;
        (Some(CppChild::new(child)), Some(slot))
    } else {
        (None, None)
    };

    let monitor: Box<dyn occ::Monitor> = if cli.events {
        Box::new(occ::JsonMonitor::stderr())
    } else {
        Box::new(TracingMonitor)
    };
    let auth = match &config.auth_secret {
        Some(secret) => Authenticator::SharedSecret(secret.clone()),
        None => Authenticator::None,
    };
    let ctx = DispatchContext {
        monitor: monitor.as_ref(),
        cleanup,
        auth: &auth,
    };

    let result = dispatch(&job, &host, cpp_child, slot, &ctx).await;

    // The server's compiler stderr belongs on ours, whatever happened.
    if let Ok(bytes) = std::fs::read(&job.server_stderr) {
        let _ = std::io::stderr().write_all(&bytes);
    }
    cleanup.drain();

    let outcome = result?;
    let status = outcome.compiler_status;
    if let Some(sig) = status.signal() {
        bail!("remote compiler terminated by signal {sig}");
    }
    let code = status.exit_code().unwrap_or(1);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_input_picks_source_file() {
        let cmd = argv(&["cc", "-O2", "-c", "widget.c", "-o", "widget.o"]);
        assert_eq!(find_input(&cmd).as_deref(), Some("widget.c"));
    }

    #[test]
    fn test_find_input_skips_objects_and_flags() {
        let cmd = argv(&["cc", "-c", "-Wall", "x.o"]);
        assert_eq!(find_input(&cmd), None);
    }

    #[test]
    fn test_find_flag_value() {
        let cmd = argv(&["cc", "-c", "a.c", "-o", "a.o", "-MF", "a.d"]);
        assert_eq!(find_flag_value(&cmd, "-o").as_deref(), Some("a.o"));
        assert_eq!(find_flag_value(&cmd, "-MF").as_deref(), Some("a.d"));
        assert_eq!(find_flag_value(&cmd, "-MT"), None);
    }

    #[test]
    fn test_build_cpp_argv_rewrites_mode_and_output() {
        let cmd = argv(&["cc", "-c", "a.c", "-o", "a.o"]);
        let cpp = build_cpp_argv(&cmd, Path::new("/tmp/occ_1_a.i"));
        assert_eq!(cpp, argv(&["cc", "-E", "a.c", "-o", "/tmp/occ_1_a.i"]));
    }

    #[test]
    fn test_build_cpp_argv_appends_output_when_missing() {
        let cmd = argv(&["cc", "-c", "a.c"]);
        let cpp = build_cpp_argv(&cmd, Path::new("/tmp/occ_1_a.i"));
        assert_eq!(cpp, argv(&["cc", "-E", "a.c", "-o", "/tmp/occ_1_a.i"]));
    }
}
