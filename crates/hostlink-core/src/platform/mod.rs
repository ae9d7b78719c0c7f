//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than being
//! scattered through the control plane.
//!
//! - `process` - liveness of supervised client processes

pub mod process;

pub use process::{is_process_alive, is_valid_pid, OsProcessHandle, ProcessHandle};
