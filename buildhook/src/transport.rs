//! SSH transport to remote workers.
//!
//! A connection is a pair of byte streams to a process on the worker that
//! speaks the worker protocol. The production connector spawns `ssh` running
//! `nix-store --serve --write` remotely; tests substitute in-memory streams
//! through the [`Connector`] trait.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};

use buildhook_shared::errors::{HookError, HookResult};

use crate::machines::Machine;

/// Greeting printed by the remote side once the channel is usable. Its
/// absence is how a refused or misconfigured connection is detected before
/// any protocol bytes are exchanged.
const GREETING: &str = "started";

/// Suppress interactive SSH prompts for the lifetime of this process.
///
/// Must run at startup, before any threads exist.
pub fn neutralize_ssh_env() {
    // SAFETY: called first thing in main, before spawning threads.
    unsafe {
        std::env::set_var("DISPLAY", "");
        std::env::set_var("SSH_ASKPASS", "");
    }
}

/// An open channel to a remote worker.
pub struct WorkerChannel {
    pub from: Box<dyn Read + Send>,
    pub to: Box<dyn Write + Send>,
    /// Transport subprocess kept alive for the duration of the session.
    pub child: Option<Child>,
}

impl WorkerChannel {
    pub fn new(from: Box<dyn Read + Send>, to: Box<dyn Write + Send>) -> Self {
        Self {
            from,
            to,
            child: None,
        }
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel").finish()
    }
}

/// Opens worker channels. The single seam between placement and the network.
pub trait Connector {
    fn connect(&self, machine: &Machine) -> HookResult<WorkerChannel>;
}

/// Production connector: `ssh -i <key> -x -a <host>` running the serve
/// command remotely.
pub struct SshConnector {
    remote_command: String,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            remote_command: "nix-store --serve --write".to_string(),
        }
    }

    /// Override the remote command (used by deployments where the store
    /// binary lives outside the default PATH).
    pub fn with_remote_command(remote_command: impl Into<String>) -> Self {
        Self {
            remote_command: remote_command.into(),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for SshConnector {
    fn connect(&self, machine: &Machine) -> HookResult<WorkerChannel> {
        let connect_err = |reason: String| HookError::Connect {
            host: machine.host_name.clone(),
            reason,
        };

        tracing::debug!(host = %machine.host_name, "connecting");

        let mut child = Command::new("ssh")
            .arg("-i")
            .arg(&machine.ssh_keys)
            .arg("-x")
            .arg("-a")
            .arg(&machine.host_name)
            .arg("--")
            .arg(format!("echo {}; exec {}", GREETING, self.remote_command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| connect_err(format!("cannot spawn ssh: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_err("ssh child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_err("ssh child has no stdout".to_string()))?;

        let mut reader = BufReader::new(stdout);
        if let Err(err) = expect_greeting(&mut reader, &machine.host_name) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        Ok(WorkerChannel {
            from: Box::new(reader),
            to: Box::new(stdin),
            child: Some(child),
        })
    }
}

/// The remote echoes the greeting only once the channel is fully up; EOF or
/// garbage here means the connection never came up.
fn expect_greeting<R: BufRead>(reader: &mut R, host: &str) -> HookResult<()> {
    let connect_err = |reason: String| HookError::Connect {
        host: host.to_string(),
        reason,
    };
    let mut greeting = String::new();
    let read = reader
        .read_line(&mut greeting)
        .map_err(|e| connect_err(format!("reading greeting: {}", e)))?;
    if read == 0 || greeting.trim() != GREETING {
        return Err(connect_err("remote side did not start".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn neutralized_env_is_empty() {
        neutralize_ssh_env();
        assert_eq!(std::env::var("DISPLAY").unwrap(), "");
        assert_eq!(std::env::var("SSH_ASKPASS").unwrap(), "");
    }

    #[test]
    fn greeting_accepted() {
        let mut reader = BufReader::new(Cursor::new(b"started\n".to_vec()));
        assert!(expect_greeting(&mut reader, "host1").is_ok());
    }

    #[test]
    fn eof_before_greeting_is_a_connect_failure() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        let err = expect_greeting(&mut reader, "host1").unwrap_err();
        assert!(matches!(err, HookError::Connect { .. }));
    }

    #[test]
    fn garbage_greeting_is_a_connect_failure() {
        let mut reader = BufReader::new(Cursor::new(b"Permission denied\n".to_vec()));
        let err = expect_greeting(&mut reader, "host1").unwrap_err();
        assert!(matches!(err, HookError::Connect { .. }));
    }

    #[test]
    fn greeting_is_consumed_before_protocol_bytes() {
        let mut payload = b"started\n".to_vec();
        payload.extend_from_slice(&7u64.to_le_bytes());
        let mut reader = BufReader::new(Cursor::new(payload));
        expect_greeting(&mut reader, "host1").unwrap();
        assert_eq!(crate::protocol::read_int(&mut reader).unwrap(), 7);
    }
}
