//! Sandbox manager - main orchestration module.
//!
//! Builds the sandbox in the calling process and then runs one command in
//! it. Everything up to the command launch happens on the calling thread
//! with no async runtime alive: unshare and setns only move the calling
//! thread, and ptrace ties the tracee to the thread that spawned it.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::config::SandboxDebugConfig;
use crate::error::{ConfigError, SandboxError, TraceError};
use crate::sandbox::iproute::IpRoute2;
use crate::sandbox::{
    self, build_network_namespace, MountSequencer, MountSummary, SandboxDependencyCheck,
};
use crate::sys::{HostKernel, ProcessPrivileges};
use crate::trace::{Ptrace, TraceSession};
use crate::utils::{join_args, split_args, CancellationToken};

/// Set in the command's environment to the host path of the work area.
pub const SANDBOX_ENV: &str = "SDBG_SANDBOX";

/// Set in the command's environment when a network namespace was built.
pub const NETNS_ENV: &str = "SDBG_NETNS";

/// Exit code reported when the command outlives its time limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Command to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCommand {
    /// Command line handed to `sh -c`.
    Shell(String),
    /// Program and arguments, run without a shell.
    Argv(Vec<String>),
}

impl SandboxCommand {
    /// Split a command line into an argv, without involving a shell.
    pub fn parse(line: &str) -> Result<Self, SandboxError> {
        let argv = split_args(line).map_err(|e| {
            ConfigError::ParseError(format!("invalid command line '{}': {}", line, e))
        })?;
        if argv.is_empty() {
            return Err(ConfigError::ValidationError("command line is empty".to_string()).into());
        }
        Ok(SandboxCommand::Argv(argv))
    }

    /// Program to execute and its arguments.
    pub fn program_and_args(&self) -> Result<(String, Vec<String>), SandboxError> {
        match self {
            SandboxCommand::Shell(line) => {
                Ok(("/bin/sh".to_string(), vec!["-c".to_string(), line.clone()]))
            }
            SandboxCommand::Argv(argv) => match argv.split_first() {
                Some((program, args)) => Ok((program.clone(), args.to_vec())),
                None => Err(ConfigError::ValidationError("command is empty".to_string()).into()),
            },
        }
    }
}

impl fmt::Display for SandboxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxCommand::Shell(line) => write!(f, "sh -c {}", crate::utils::quote(line)),
            SandboxCommand::Argv(argv) => write!(f, "{}", join_args(argv)),
        }
    }
}

/// What [`SandboxManager::prepare`] set up.
#[derive(Debug, Clone)]
pub struct PreparedSandbox {
    pub mount: MountSummary,
    /// Network namespace the process now lives in, if one was built.
    pub namespace: Option<String>,
}

/// The sandbox manager - main entry point for sandbox operations.
pub struct SandboxManager {
    config: SandboxDebugConfig,
    cancel: CancellationToken,
    prepared: Option<PreparedSandbox>,
}

impl SandboxManager {
    /// Create a new sandbox manager for a validated configuration.
    pub fn new(config: SandboxDebugConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            prepared: None,
        })
    }

    /// Abort setup and tracing when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the current configuration.
    pub fn config(&self) -> &SandboxDebugConfig {
        &self.config
    }

    /// What [`SandboxManager::prepare`] produced, if it has run.
    pub fn prepared(&self) -> Option<&PreparedSandbox> {
        self.prepared.as_ref()
    }

    /// Check if all required dependencies are available.
    pub fn check_dependencies(&self) -> Result<SandboxDependencyCheck, SandboxError> {
        let check = sandbox::check_dependencies(&self.config, &ProcessPrivileges);
        for warning in &check.warnings {
            tracing::warn!("{}", warning);
        }
        check.into_result()
    }

    /// Build the sandbox around the current process.
    ///
    /// The network namespace comes first: `/run/netns` and the `ip` binary
    /// are only reachable from the host root. The process is left inside
    /// both namespaces with the overlay as its root.
    pub fn prepare(&mut self) -> Result<&PreparedSandbox, SandboxError> {
        if self.prepared.is_some() {
            return Err(SandboxError::Precondition(
                "sandbox is already prepared".to_string(),
            ));
        }

        self.check_dependencies()?;

        let namespace = match self.config.network_spec() {
            Some(spec) => {
                let mut net = IpRoute2::default();
                build_network_namespace(&spec, &mut net, &ProcessPrivileges, &self.cancel)?;
                Some(spec.name)
            }
            None => None,
        };

        let mut kernel = HostKernel;
        let mount = MountSequencer::new(&mut kernel, self.config.mount_plan())
            .with_cancellation(self.cancel.clone())
            .run()?;

        Ok(self.prepared.insert(PreparedSandbox { mount, namespace }))
    }

    /// Environment added to the command.
    fn command_env(prepared: &PreparedSandbox) -> Vec<(String, String)> {
        let mut env = vec![(
            SANDBOX_ENV.to_string(),
            prepared.mount.work_area.display().to_string(),
        )];
        if let Some(ref ns) = prepared.namespace {
            env.push((NETNS_ENV.to_string(), ns.clone()));
        }
        env
    }

    /// Run `command` inside the prepared sandbox and return its exit code.
    pub fn run(&self, command: &SandboxCommand) -> Result<i32, SandboxError> {
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            SandboxError::Precondition("run called before the sandbox was prepared".to_string())
        })?;
        let env = Self::command_env(prepared);
        let (program, args) = command.program_and_args()?;

        tracing::debug!("running in sandbox: {}", command);

        if self.config.trace.enabled {
            self.run_traced(&program, &args, &env)
        } else {
            self.run_untraced(&program, &args, &env)
        }
    }

    fn run_untraced(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<i32, SandboxError> {
        // Started only now; namespace setup above needs a single thread.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.wait_for_command(program, args, env))
    }

    async fn wait_for_command(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<i32, SandboxError> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::CommandFailed(format!("failed to start {}: {}", program, e)))?;

        let limit = self.config.timeout();
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = deadline => Outcome::TimedOut,
            _ = tokio::signal::ctrl_c() => Outcome::Interrupted,
        };

        match outcome {
            Outcome::Exited(status) => Ok(exit_code(status)),
            Outcome::TimedOut => {
                tracing::warn!("{} timed out after {:?}, killing it", program, limit);
                child.kill().await?;
                Ok(TIMEOUT_EXIT_CODE)
            }
            Outcome::Interrupted => {
                tracing::debug!("interrupted, killing {}", program);
                child.kill().await?;
                Ok(128 + nix::libc::SIGINT)
            }
        }
    }

    fn run_traced(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<i32, SandboxError> {
        let mut options = self.config.trace.options();
        options.time_limit = self.config.timeout();

        let mut session = TraceSession::spawn(Ptrace::new(), program, args, env, options)?
            .with_cancellation(self.cancel.clone());
        let pid = session.process().pid;

        let result = session.run(|record| eprintln!("[{}] {}", pid, record));
        match result {
            Ok(summary) => {
                tracing::info!(
                    "{} exited with {} after {} syscalls and {} signals",
                    program,
                    summary.exit_code,
                    summary.syscalls,
                    summary.signals.len()
                );
                Ok(summary.exit_code)
            }
            Err(TraceError::Timeout(limit)) => {
                tracing::warn!("traced {} timed out after {:?}, killing it", program, limit);
                session.kill()?;
                Ok(TIMEOUT_EXIT_CODE)
            }
            Err(e) => {
                if let Err(kill_err) = session.kill() {
                    tracing::warn!("failed to kill traced {}: {}", program, kill_err);
                }
                Err(e.into())
            }
        }
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
}

/// Shell-style exit code: signal deaths become 128 + signo.
fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}
