//! Types shared between the buildhook library and its consumers.

pub mod errors;

pub use errors::{HookError, HookResult};
