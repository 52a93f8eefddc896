//! Remote-build dispatcher hook.
//!
//! This crate implements the hook process a build daemon spawns to offload
//! derivation builds to remote workers. Concurrent hook processes coordinate
//! through advisory file locks in a shared state directory: a global
//! admission lock linearizes placement decisions, per-(machine, slot) locks
//! track capacity, and per-host upload locks serialize closure pushes. Once
//! a slot is owned, the hook drives the remote worker protocol over an SSH
//! channel until the build finishes and its outputs are imported.

pub mod driver;
pub mod layout;
pub mod lock;
pub mod machines;
pub mod placement;
pub mod protocol;
pub mod request;
pub mod store;
pub mod transport;

pub use buildhook_shared::errors::{HookError, HookResult};
pub use layout::StateLayout;
pub use machines::{Machine, MachineRegistry};
pub use placement::{Accepted, Decision};
pub use request::{BuildRequest, HookSettings, Reply, ReplyChannel};
pub use store::{LocalStore, StoreOps};
pub use transport::{Connector, SshConnector, WorkerChannel};
