//! CLI parsing and execution.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{NetworkConfig, SandboxDebugConfig};
use crate::error::SandboxError;
use crate::manager::SandboxCommand;
use crate::sandbox::{Ipv4Cidr, Propagation, PseudoFsMode};

/// Sandbox Debug - run a command on a throwaway copy-on-write root
#[derive(Parser, Debug)]
#[command(name = "sdbg")]
#[command(
    about = "Run a command in a private mount namespace on an overlay of the host root, optionally in its own network namespace and under a syscall tracer"
)]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Path to settings file (default: ~/.sdbg-settings.json)
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// Run command string directly (sh -c mode)
    #[arg(short = 'c')]
    pub command: Option<String>,

    /// Lower (read-only) layer of the overlay
    #[arg(long = "lower", value_name = "DIR")]
    pub lower: Option<String>,

    /// Directory that receives the tmpfs holding the overlay layers
    #[arg(long = "work-area", value_name = "DIR")]
    pub work_area: Option<String>,

    /// Mount propagation for the new namespace
    #[arg(long = "propagation", value_enum)]
    pub propagation: Option<Propagation>,

    /// How /proc and /sys are provided in the new root
    #[arg(long = "pseudo-fs", value_enum)]
    pub pseudo_fs: Option<PseudoFsMode>,

    /// Run in a private network namespace joined to the host by a veth pair
    #[arg(long = "net")]
    pub net: bool,

    /// Name of the network namespace (implies --net)
    #[arg(long = "netns", value_name = "NAME")]
    pub netns: Option<String>,

    /// Host-side veth address (implies --net)
    #[arg(long = "host-addr", value_name = "CIDR")]
    pub host_addr: Option<Ipv4Cidr>,

    /// Namespace-side veth address (implies --net)
    #[arg(long = "peer-addr", value_name = "CIDR")]
    pub peer_addr: Option<Ipv4Cidr>,

    /// Trace the command's syscalls and signals
    #[arg(long = "trace")]
    pub trace: bool,

    /// Print syscall names and arguments while tracing
    #[arg(long = "decode", requires = "trace")]
    pub decode: Option<bool>,

    /// Give up if the traced command produces no event for this many milliseconds
    #[arg(long = "trace-timeout", value_name = "MS")]
    pub trace_timeout: Option<u64>,

    /// Kill the command after this many seconds
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the command to execute.
    /// - `-c` runs the string through `sh -c`
    /// - positional args are executed directly
    /// - otherwise the configured default command line is split and run
    pub fn get_command(&self, config: &SandboxDebugConfig) -> Result<SandboxCommand, SandboxError> {
        if let Some(ref cmd) = self.command {
            Ok(SandboxCommand::Shell(cmd.clone()))
        } else if !self.args.is_empty() {
            Ok(SandboxCommand::Argv(self.args.clone()))
        } else {
            SandboxCommand::parse(config.default_command())
        }
    }

    /// Get the settings file path.
    pub fn get_settings_path(&self) -> Option<PathBuf> {
        self.settings
            .clone()
            .or_else(crate::config::default_settings_path)
    }

    /// Whether any network flag was given.
    fn wants_network(&self) -> bool {
        self.net || self.netns.is_some() || self.host_addr.is_some() || self.peer_addr.is_some()
    }

    /// Apply command-line flags on top of the loaded settings.
    pub fn apply_overrides(&self, mut config: SandboxDebugConfig) -> SandboxDebugConfig {
        let fs = &mut config.filesystem;
        if let Some(ref lower) = self.lower {
            fs.lower_dir = Some(lower.clone());
        }
        if let Some(ref work_area) = self.work_area {
            fs.work_area = Some(work_area.clone());
        }
        if self.propagation.is_some() {
            fs.propagation = self.propagation;
        }
        if self.pseudo_fs.is_some() {
            fs.pseudo_filesystems = self.pseudo_fs;
        }

        if self.wants_network() {
            let network = config.network.get_or_insert_with(NetworkConfig::default);
            if let Some(ref name) = self.netns {
                network.namespace = Some(name.clone());
            }
            if let Some(addr) = self.host_addr {
                network.host_address = addr;
            }
            if let Some(addr) = self.peer_addr {
                network.peer_address = addr;
            }
        }

        if self.trace {
            config.trace.enabled = true;
        }
        if self.decode.is_some() {
            config.trace.decode_syscalls = self.decode;
        }
        if self.trace_timeout.is_some() {
            config.trace.wait_timeout_ms = self.trace_timeout;
        }
        if self.timeout.is_some() {
            config.timeout_secs = self.timeout;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sdbg").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_command_is_mount() {
        let cli = parse(&[]);
        let cmd = cli.get_command(&SandboxDebugConfig::default()).unwrap();
        assert_eq!(cmd, SandboxCommand::Argv(vec!["mount".to_string()]));
    }

    #[test]
    fn test_shell_and_trailing_commands() {
        let cli = parse(&["-c", "echo hi > /probe"]);
        assert_eq!(
            cli.get_command(&SandboxDebugConfig::default()).unwrap(),
            SandboxCommand::Shell("echo hi > /probe".to_string())
        );

        let cli = parse(&["--trace", "--", "ls", "-la", "/"]);
        assert_eq!(
            cli.get_command(&SandboxDebugConfig::default()).unwrap(),
            SandboxCommand::Argv(vec!["ls".to_string(), "-la".to_string(), "/".to_string()])
        );
        assert!(cli.trace);
    }

    #[test]
    fn test_overrides() {
        let cli = parse(&[
            "--lower",
            "/srv/rootfs",
            "--work-area",
            "/run/dbg",
            "--propagation",
            "private",
            "--pseudo-fs",
            "fresh",
            "--timeout",
            "5",
        ]);
        let config = cli.apply_overrides(SandboxDebugConfig::default());
        let plan = config.mount_plan();
        assert_eq!(plan.lower, PathBuf::from("/srv/rootfs"));
        assert_eq!(plan.work_area, PathBuf::from("/run/dbg"));
        assert_eq!(plan.propagation, Propagation::Private);
        assert_eq!(plan.pseudo_filesystems, PseudoFsMode::Fresh);
        assert_eq!(config.timeout_secs, Some(5));
        assert!(config.network.is_none());
        assert!(!config.trace.enabled);
    }

    #[test]
    fn test_network_flags_enable_network() {
        let cli = parse(&["--netns", "dbg", "--peer-addr", "10.1.0.2/24"]);
        let config = cli.apply_overrides(SandboxDebugConfig::default());
        let network = config.network.unwrap();
        assert_eq!(network.namespace.as_deref(), Some("dbg"));
        assert_eq!(network.peer_address.to_string(), "10.1.0.2/24");
    }

    #[test]
    fn test_invalid_address_rejected() {
        let result = Cli::try_parse_from(["sdbg", "--host-addr", "10.0.0.1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_trace_overrides() {
        let cli = parse(&["--trace", "--decode", "false", "--trace-timeout", "200"]);
        let config = cli.apply_overrides(SandboxDebugConfig::default());
        assert!(config.trace.enabled);
        assert_eq!(config.trace.decode_syscalls, Some(false));
        assert_eq!(config.trace.wait_timeout_ms, Some(200));
    }
}
