//! Filesystem layout for the hook's coordination state.
//!
//! All cross-process scheduler state lives in a single shared directory:
//! one slot-lock file per (machine, slot), the global `main-lock`, and one
//! upload lock per host. This module owns the naming scheme; the lock
//! semantics live in [`crate::lock`].

use std::env;
use std::path::{Path, PathBuf};

use crate::machines::Machine;

/// State directory used when `NIX_CURRENT_LOAD` is unset.
const DEFAULT_STATE_DIR: &str = "/run/nix/current-load";

/// Compile-time system configuration directory.
const SYSCONF_DIR: &str = match option_env!("NIX_SYSCONF_DIR") {
    Some(dir) => dir,
    None => "/etc",
};

/// Path of the machines configuration file.
///
/// `NIX_REMOTE_SYSTEMS` overrides the compiled-in default
/// `<sysconfdir>/nix/machines`.
pub fn machines_file_path() -> PathBuf {
    env::var_os("NIX_REMOTE_SYSTEMS")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(SYSCONF_DIR).join("nix").join("machines"))
}

/// Layout of the shared scheduler state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    state_dir: PathBuf,
    signing_key: PathBuf,
}

impl StateLayout {
    /// Build the layout from the environment.
    ///
    /// The state directory comes from `NIX_CURRENT_LOAD`; the signing key
    /// location is compiled in.
    pub fn from_env() -> Self {
        let state_dir = env::var_os("NIX_CURRENT_LOAD")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        Self {
            state_dir,
            signing_key: Path::new(SYSCONF_DIR).join("nix").join("signing-key.sec"),
        }
    }

    /// Build a layout rooted at an explicit directory (tests, embedding).
    pub fn new(state_dir: impl Into<PathBuf>, signing_key: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            signing_key: signing_key.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Uploads are signed iff this file exists.
    pub fn signing_key(&self) -> &Path {
        &self.signing_key
    }

    /// The global admission lock, held only for placement decisions.
    pub fn main_lock_path(&self) -> PathBuf {
        self.state_dir.join("main-lock")
    }

    /// Lock file for one slot: `<systemA+systemB>-<host>-<slot>`.
    pub fn slot_lock_path(&self, machine: &Machine, slot: u32) -> PathBuf {
        self.state_dir.join(format!(
            "{}-{}-{}",
            machine.system_types.join("+"),
            machine.host_name,
            slot
        ))
    }

    /// Per-host lock serializing closure uploads: `<host>.upload-lock`.
    pub fn upload_lock_path(&self, host: &str) -> PathBuf {
        self.state_dir.join(format!("{}.upload-lock", host))
    }
}
