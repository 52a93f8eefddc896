//! The remote build driver.
//!
//! Runs once per hook process, after placement has produced an owned slot
//! and the transport has produced a live channel. Uploads the closure under
//! the per-host upload lock, drives the build command, and imports whatever
//! outputs the local store is missing. The slot lock stays held the whole
//! time and is only released by process exit.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

use buildhook_shared::errors::{HookError, HookResult};

use crate::layout::StateLayout;
use crate::lock::LockFile;
use crate::placement::Accepted;
use crate::protocol;
use crate::request::{BuildRequest, HookSettings, ReplyChannel};
use crate::store::StoreOps;
use crate::transport::WorkerChannel;

/// How long to wait for a peer's upload to finish before breaking its lock.
const UPLOAD_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Drive an accepted build to completion.
///
/// The parent has already seen `# accept`; the next two lines on `input`
/// are the input and output path lists.
#[allow(clippy::too_many_arguments)]
pub fn run_build<R, W, S>(
    settings: &HookSettings,
    request: &BuildRequest,
    accepted: &Accepted,
    channel: WorkerChannel,
    store: &S,
    layout: &StateLayout,
    input: &mut R,
    reply: &mut ReplyChannel<W>,
) -> HookResult<()>
where
    R: BufRead,
    W: Write,
    S: StoreOps + ?Sized,
{
    let WorkerChannel { from, to, child } = channel;
    let mut from = BufReader::new(from);
    let mut to = to;
    let machine = &accepted.machine;

    let inputs = read_path_line(input, "inputs")?;
    let outputs = read_path_line(input, "outputs")?;

    if settings.print_build_trace {
        reply.build_trace(&request.drv_path, &machine.host_name)?;
    }

    tracing::info!(
        drv = %request.drv_path,
        host = %machine.host_name,
        slot = accepted.slot,
        "building remotely"
    );

    let sign = layout.signing_key().exists();

    let mut closure = Vec::with_capacity(inputs.len() + 1);
    closure.push(request.drv_path.clone());
    closure.extend(inputs.iter().cloned());
    upload_closure(
        layout,
        &machine.host_name,
        store,
        &mut *to,
        &mut from,
        &closure,
        sign,
        UPLOAD_LOCK_TIMEOUT,
    )?;

    protocol::write_int(&mut to, protocol::CMD_BUILD_PATHS)?;
    protocol::write_string_list(&mut to, std::slice::from_ref(&request.drv_path))?;
    protocol::write_int(&mut to, settings.max_silent_time)?;
    protocol::write_int(&mut to, settings.build_timeout)?;
    to.flush()
        .map_err(|e| HookError::Protocol(format!("flushing build command: {}", e)))?;

    let status = protocol::read_int(&mut from)?;
    if status != 0 {
        let msg = protocol::read_string(&mut from)?;
        return Err(HookError::RemoteBuild {
            host: machine.host_name.clone(),
            msg,
            status,
        });
    }

    let mut missing = Vec::new();
    for output in &outputs {
        if !store.is_valid_path(output)? {
            missing.push(output.clone());
        }
    }

    if !missing.is_empty() {
        protocol::write_int(&mut to, protocol::CMD_EXPORT_PATHS)?;
        protocol::write_int(&mut to, 0)?; // unsigned import
        protocol::write_string_list(&mut to, &missing)?;
        to.flush()
            .map_err(|e| HookError::Protocol(format!("flushing export command: {}", e)))?;
    }

    // Closing the write side is the worker's cue that no more commands are
    // coming; it finishes any export stream and hangs up.
    drop(to);

    if !missing.is_empty() {
        // Advises the parent that these paths are locked during the import.
        // SAFETY: the hook process is single-threaded.
        unsafe {
            std::env::set_var("NIX_HELD_LOCKS", missing.join(" "));
        }
        store.import_paths(&mut from)?;
    }

    if let Some(mut child) = child {
        let _ = child.wait();
    }

    tracing::info!(
        drv = %request.drv_path,
        host = %machine.host_name,
        "remote build finished"
    );
    Ok(())
}

fn read_path_line<R: BufRead>(input: &mut R, what: &str) -> HookResult<Vec<String>> {
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .map_err(|e| HookError::Protocol(format!("reading {} from parent: {}", what, e)))?;
    if read == 0 {
        return Err(HookError::Protocol(format!(
            "parent closed the stream before sending {}",
            what
        )));
    }
    Ok(line.split_whitespace().map(|s| s.to_string()).collect())
}

/// Copy the closure under the per-host upload lock.
///
/// Two hooks pushing the same missing paths to one host would double the
/// bandwidth for nothing, so uploads to a host are serialized. A holder
/// that exceeds the timeout is presumed wedged: the lock file is unlinked
/// so the next hook starts from a fresh one, and this upload proceeds
/// uncoordinated.
#[allow(clippy::too_many_arguments)]
fn upload_closure<S: StoreOps + ?Sized>(
    layout: &StateLayout,
    host: &str,
    store: &S,
    to: &mut dyn Write,
    from: &mut dyn Read,
    paths: &[String],
    sign: bool,
    timeout: Duration,
) -> HookResult<()> {
    let mut upload_lock = LockFile::open(&layout.upload_lock_path(host))?;
    if !upload_lock.lock_exclusive_timeout(timeout)? {
        tracing::warn!(
            host,
            timeout_secs = timeout.as_secs(),
            "upload lock held too long, breaking it"
        );
        let _ = std::fs::remove_file(upload_lock.path());
    }

    tracing::debug!(host, paths = paths.len(), sign, "copying closure");
    store.copy_closure_to(to, from, paths, sign)
}
