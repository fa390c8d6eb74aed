//! Error types for the debug sandbox.

use std::time::Duration;

use thiserror::Error;

use crate::sys::OsError;

/// Main error type for the debug sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// A kernel call failed; `step` names the operation in progress.
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: OsError,
    },

    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Network configuration failed during {step}: {reason}")]
    Network { step: &'static str, reason: String },

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Operation cancelled before {0}")]
    Cancelled(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid interface name '{name}': {reason}")]
    InvalidInterfaceName { name: String, reason: String },

    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Errors raised by the syscall tracing loop and its debugger backend.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The step/wait pairing was broken by the caller.
    #[error("debugger protocol desynchronized: {0}")]
    Protocol(String),

    #[error("ptrace {op} failed: {source}")]
    Ptrace {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("failed to spawn traced process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unexpected wait status for pid {pid}: {status}")]
    UnexpectedStatus { pid: i32, status: String },

    #[error("no debugger event within {0:?}")]
    Timeout(Duration),

    #[error("tracing cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SandboxError>;
