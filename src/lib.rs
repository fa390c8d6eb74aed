//! Sandbox Debug - run a command on a disposable copy-on-write view of the host.
//!
//! The calling process moves itself into a new mount namespace whose root is
//! an overlay of the host root, optionally into a fresh network namespace
//! joined to the host by a veth pair, and then runs a command there, either
//! directly or under a ptrace syscall tracer:
//! - `sys`: syscall wrappers and the [`sys::Kernel`] seam
//! - `sandbox`: mount sequencer, overlay layout and network namespace builder
//! - `trace`: syscall tracing loop and its ptrace backend

#[cfg(not(target_os = "linux"))]
compile_error!("sandbox-debug relies on Linux namespaces and only builds on Linux");

pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod sandbox;
pub mod sys;
pub mod trace;
pub mod utils;

pub use config::{FilesystemConfig, NetworkConfig, SandboxDebugConfig, TraceConfig};
pub use error::{ConfigError, Result, SandboxError, TraceError};
pub use manager::{SandboxCommand, SandboxManager};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::SandboxDebugConfig;
    pub use crate::error::{Result, SandboxError};
    pub use crate::manager::{SandboxCommand, SandboxManager};
    pub use crate::sandbox::{MountPlan, MountSequencer, NetNamespaceSpec, OverlaySpec};
    pub use crate::sys::{HostKernel, Kernel, OsError};
    pub use crate::trace::{Debugger, Ptrace, TraceSession};
}
