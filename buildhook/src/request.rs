//! The parent-facing request loop.
//!
//! One hook process serves one parent daemon. Requests arrive one per line
//! on stdin; the single-line reply goes out-of-band on stderr, prefixed with
//! `# `. Declined and postponed requests loop; an accepted request hands the
//! process over to the remote build driver and never returns to the loop.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use buildhook_shared::errors::{HookError, HookResult};

use crate::driver;
use crate::layout::StateLayout;
use crate::machines::MachineRegistry;
use crate::placement::{self, Decision};
use crate::store::StoreOps;
use crate::transport::Connector;

/// Invocation parameters handed to the hook by the parent daemon.
#[derive(Debug, Clone)]
pub struct HookSettings {
    pub local_system: String,
    pub max_silent_time: u64,
    pub build_timeout: u64,
    pub print_build_trace: bool,
}

/// One build request line from the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// The parent permits building this derivation locally.
    pub am_willing: bool,
    pub needed_system: String,
    pub drv_path: String,
    pub required_features: Vec<String>,
}

impl BuildRequest {
    /// Parse `amWilling neededSystem drvPath requiredFeatures` where the
    /// feature field is comma-joined and may be missing entirely.
    ///
    /// A line that does not fit this shape means the conversation with the
    /// parent is out of step, which is not recoverable.
    pub fn parse(line: &str) -> HookResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(HookError::Protocol(format!(
                "malformed request line from parent: {:?}",
                line
            )));
        }
        let am_willing = match fields[0] {
            "0" => false,
            "1" => true,
            other => {
                return Err(HookError::Protocol(format!(
                    "malformed amWilling field from parent: {:?}",
                    other
                )));
            }
        };
        let required_features = fields
            .get(3)
            .map(|f| {
                f.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(BuildRequest {
            am_willing,
            needed_system: fields[1].to_string(),
            drv_path: fields[2].to_string(),
            required_features,
        })
    }
}

/// Reply tokens of the parent protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Decline,
    Postpone,
}

impl Reply {
    fn token(self) -> &'static str {
        match self {
            Reply::Accept => "accept",
            Reply::Decline => "decline",
            Reply::Postpone => "postpone",
        }
    }
}

/// The out-of-band reply channel on stderr.
///
/// Reply lines and build-trace lines are written raw; diagnostic logging
/// goes through `tracing` and must not use the `# ` prefix.
pub struct ReplyChannel<W: Write> {
    out: W,
}

impl<W: Write> ReplyChannel<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn send(&mut self, reply: Reply) -> HookResult<()> {
        writeln!(self.out, "# {}", reply.token())
            .and_then(|_| self.out.flush())
            .map_err(|e| HookError::Protocol(format!("writing reply to parent: {}", e)))
    }

    /// `@ build-remote <drvPath> <hostName>`, emitted when tracing is on.
    pub fn build_trace(&mut self, drv_path: &str, host: &str) -> HookResult<()> {
        writeln!(self.out, "@ build-remote {} {}", drv_path, host)
            .and_then(|_| self.out.flush())
            .map_err(|e| HookError::Protocol(format!("writing build trace: {}", e)))
    }

    /// The underlying writer (used by tests to inspect replies).
    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

/// Run the hook until the parent closes stdin or a build is accepted.
///
/// `Ok(())` is a clean exit (end-of-stream, or an accepted build that
/// completed); a build failure surfaces as
/// [`HookError::RemoteBuild`] carrying the worker status.
pub fn run_hook<R, W, C, S>(
    settings: &HookSettings,
    registry: &MachineRegistry,
    layout: &StateLayout,
    connector: &C,
    store: &S,
    input: &mut R,
    reply: &mut ReplyChannel<W>,
) -> HookResult<()>
where
    R: BufRead,
    W: Write,
    C: Connector + ?Sized,
    S: StoreOps + ?Sized,
{
    let mut disabled: HashSet<String> = HashSet::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = input
            .read_line(&mut line)
            .map_err(|e| HookError::Protocol(format!("reading request from parent: {}", e)))?;
        if read == 0 {
            tracing::debug!("parent closed the request stream");
            return Ok(());
        }
        let request = BuildRequest::parse(line.trim_end())?;
        tracing::debug!(
            drv = %request.drv_path,
            system = %request.needed_system,
            "request received"
        );

        // Inner failover loop: a connect failure disables the machine for
        // the rest of this process, releases its slot, and re-runs placement
        // for the same request. The main lock is re-acquired each iteration
        // inside `place`.
        loop {
            let decision = placement::place(
                registry,
                &disabled,
                &request,
                &settings.local_system,
                layout,
            )?;
            match decision {
                Decision::Decline => {
                    reply.send(Reply::Decline)?;
                    break;
                }
                Decision::Postpone => {
                    reply.send(Reply::Postpone)?;
                    break;
                }
                Decision::Accept(accepted) => match connector.connect(&accepted.machine) {
                    Err(err) => {
                        tracing::warn!(
                            host = %accepted.machine.host_name,
                            error = %err,
                            "connect failed, disabling machine"
                        );
                        disabled.insert(accepted.machine.host_name.clone());
                        drop(accepted);
                        continue;
                    }
                    Ok(channel) => {
                        reply.send(Reply::Accept)?;
                        return driver::run_build(
                            settings, &request, &accepted, channel, store, layout, input, reply,
                        );
                    }
                },
            }
        }
    }
}
