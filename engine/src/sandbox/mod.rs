//! Sandbox module - Low-level container and capture plumbing
//!
//! This module handles:
//! - Capability detection (is a container runtime usable?)
//! - Container creation, signalling, inspection and removal
//! - Bounded output capture
//!
//! The sandbox module does NOT:
//! - Interpret exit statuses (that's the runner's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod container;
pub mod output;
pub mod probe;

pub use output::{capture_into, BoundedBuffer, CapturedOutput, SharedBuffer, TRUNCATION_MARKER};
pub use probe::SandboxMode;
