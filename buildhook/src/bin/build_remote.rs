//! The remote-build hook executable.
//!
//! Spawned by the local build daemon, one process per build request stream.
//! Requests arrive on stdin; the `# accept` / `# decline` / `# postpone`
//! replies and the optional `@ build-remote` trace lines go to stderr. On an
//! accepted build the process exits 0 on success or with the worker-reported
//! status on failure.

use std::io;
use std::process;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use buildhook::{
    HookSettings, LocalStore, MachineRegistry, ReplyChannel, SshConnector, StateLayout, layout,
    request, transport,
};

/// Remote-build dispatcher hook - offloads derivation builds to remote workers
#[derive(Parser, Debug)]
#[command(
    name = "build-remote",
    about = "Build hook dispatching derivation builds to remote workers"
)]
struct HookArgs {
    /// Platform identifier of the local machine
    local_system: String,

    /// Seconds of build silence after which the worker aborts the build
    max_silent_time: u64,

    /// Emit `@ build-remote` trace lines on stderr ("0" or empty disables)
    print_build_trace: String,

    /// Overall remote build timeout in seconds
    build_timeout: u64,
}

fn main() {
    // Suppress interactive SSH prompts for everything this process spawns.
    // Must happen before any threads exist.
    transport::neutralize_ssh_env();

    let args = HookArgs::parse();

    // NIX_DEBUG_HOOK raises the default level so per-candidate placement
    // decisions show up on stderr.
    let level = if std::env::var_os("NIX_DEBUG_HOOK").is_some() {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    let settings = HookSettings {
        local_system: args.local_system,
        max_silent_time: args.max_silent_time,
        build_timeout: args.build_timeout,
        print_build_trace: truthy(&args.print_build_trace),
    };

    let machines_path = layout::machines_file_path();
    let registry = match MachineRegistry::load(&machines_path) {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    };
    tracing::debug!(
        machines = registry.len(),
        path = %machines_path.display(),
        "registry loaded"
    );

    let state_layout = StateLayout::from_env();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut reply = ReplyChannel::new(io::stderr());

    let result = request::run_hook(
        &settings,
        &registry,
        &state_layout,
        &SshConnector::new(),
        &LocalStore,
        &mut input,
        &mut reply,
    );

    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(err.exit_code());
    }
}

/// The parent passes `printBuildTrace` as a truthy/falsy token: `0` and the
/// empty string disable tracing, anything else enables it.
fn truthy(value: &str) -> bool {
    !value.is_empty() && value != "0"
}
