//! Local store operations.
//!
//! The hook never touches store internals itself; it asks the surrounding
//! system. [`LocalStore`] shells out to `nix-store`, tests use the trait
//! with in-memory doubles.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use buildhook_shared::errors::{HookError, HookResult};

use crate::protocol;

/// Store operations the driver needs: the validity oracle, the closure-copy
/// subroutine and the path importer.
pub trait StoreOps {
    /// Whether the path is already valid locally.
    fn is_valid_path(&self, path: &str) -> HookResult<bool>;

    /// Push the given paths (already a closure) to the worker over the open
    /// channel, signing the export when `sign` is set.
    fn copy_closure_to(
        &self,
        to: &mut dyn Write,
        from: &mut dyn Read,
        paths: &[String],
        sign: bool,
    ) -> HookResult<()>;

    /// Read an export stream of output paths off the channel into the local
    /// store. The stream is consumed up to end-of-stream.
    fn import_paths(&self, from: &mut dyn Read) -> HookResult<()>;
}

/// Production store backed by the `nix-store` binary.
pub struct LocalStore;

impl StoreOps for LocalStore {
    fn is_valid_path(&self, path: &str) -> HookResult<bool> {
        let status = Command::new("nix-store")
            .arg("--check-validity")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| HookError::Store(format!("cannot run nix-store: {}", e)))?;
        Ok(status.success())
    }

    fn copy_closure_to(
        &self,
        to: &mut dyn Write,
        from: &mut dyn Read,
        paths: &[String],
        sign: bool,
    ) -> HookResult<()> {
        protocol::write_int(to, protocol::CMD_IMPORT_PATHS)?;

        let mut cmd = Command::new("nix-store");
        cmd.arg("--export");
        if sign {
            cmd.arg("--sign");
        }
        cmd.args(paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| HookError::Store(format!("cannot run nix-store --export: {}", e)))?;
        let mut export = child
            .stdout
            .take()
            .ok_or_else(|| HookError::Store("export child has no stdout".to_string()))?;

        io::copy(&mut export, to)
            .map_err(|e| HookError::Store(format!("streaming export to worker: {}", e)))?;
        to.flush()
            .map_err(|e| HookError::Store(format!("flushing export: {}", e)))?;

        let status = child
            .wait()
            .map_err(|e| HookError::Store(format!("waiting for nix-store --export: {}", e)))?;
        if !status.success() {
            return Err(HookError::Store(format!(
                "nix-store --export failed with {}",
                status
            )));
        }

        // The worker acknowledges a complete import with a 1.
        let ack = protocol::read_int(from)?;
        if ack != 1 {
            return Err(HookError::Store(format!(
                "remote import of closure failed (ack {})",
                ack
            )));
        }
        Ok(())
    }

    fn import_paths(&self, from: &mut dyn Read) -> HookResult<()> {
        let mut cmd = Command::new("nix-store");
        cmd.arg("--import")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| HookError::Store(format!("cannot run nix-store --import: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HookError::Store("import child has no stdin".to_string()))?;

        io::copy(from, &mut stdin)
            .map_err(|e| HookError::Store(format!("streaming export stream to import: {}", e)))?;
        drop(stdin);

        let status = child
            .wait()
            .map_err(|e| HookError::Store(format!("waiting for nix-store --import: {}", e)))?;
        if !status.success() {
            return Err(HookError::Store(format!(
                "nix-store --import failed with {}",
                status
            )));
        }
        Ok(())
    }
}
