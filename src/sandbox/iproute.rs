//! iproute2-backed network configuration.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::sched::CloneFlags;

use crate::error::SandboxError;
use crate::sandbox::network::{Ipv4Cidr, NetScope, NetworkConfigurator};
use crate::sys::OsError;

/// Directory where `ip netns` keeps namespace handles.
pub const NETNS_RUN_DIR: &str = "/run/netns";

/// [`NetworkConfigurator`] that shells out to the `ip` binary.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    program: String,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }
}

impl IpRoute2 {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for `ip`, prefixed with `-n <ns>` for namespace scope.
    fn scoped_args<'a>(scope: NetScope<'a>, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let NetScope::Namespace(ns) = scope {
            full.push("-n");
            full.push(ns);
        }
        full.extend_from_slice(args);
        full
    }

    fn run(&self, step: &'static str, args: &[&str]) -> Result<(), SandboxError> {
        tracing::debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::MissingDependency(format!(
                        "'{}' not found. Please install iproute2.",
                        self.program
                    ))
                } else {
                    SandboxError::Io(e)
                }
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Network {
                step,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl NetworkConfigurator for IpRoute2 {
    fn link_exists(&mut self, name: &str) -> Result<bool, SandboxError> {
        // /sys/class/net lists the host namespace's interfaces.
        Ok(PathBuf::from("/sys/class/net").join(name).exists())
    }

    fn create_veth_pair(&mut self, host: &str, peer: &str) -> Result<(), SandboxError> {
        self.run(
            "create veth pair",
            &["link", "add", host, "type", "veth", "peer", "name", peer],
        )
    }

    fn create_namespace(&mut self, namespace: &str) -> Result<(), SandboxError> {
        self.run("create namespace", &["netns", "add", namespace])
    }

    fn move_to_namespace(&mut self, link: &str, namespace: &str) -> Result<(), SandboxError> {
        self.run("move to namespace", &["link", "set", link, "netns", namespace])
    }

    fn assign_address(
        &mut self,
        scope: NetScope<'_>,
        link: &str,
        address: &Ipv4Cidr,
    ) -> Result<(), SandboxError> {
        let cidr = address.to_string();
        self.run(
            "assign address",
            &Self::scoped_args(scope, &["addr", "add", &cidr, "dev", link]),
        )
    }

    fn set_link_up(&mut self, scope: NetScope<'_>, link: &str) -> Result<(), SandboxError> {
        self.run(
            "bring link up",
            &Self::scoped_args(scope, &["link", "set", link, "up"]),
        )
    }

    fn enter_namespace(&mut self, namespace: &str) -> Result<(), SandboxError> {
        let handle = PathBuf::from(NETNS_RUN_DIR).join(namespace);
        let file = File::open(&handle).map_err(|e| SandboxError::Step {
            step: "open network namespace",
            source: OsError::from_io("open", &e),
        })?;
        nix::sched::setns(&file, CloneFlags::CLONE_NEWNET).map_err(|e| SandboxError::Step {
            step: "enter network namespace",
            source: OsError::new("setns", e),
        })
    }

    fn release_namespace(&mut self, namespace: &str) -> Result<(), SandboxError> {
        // Unmounts and removes /run/netns/<name>; our reference stays.
        self.run("release namespace", &["netns", "del", namespace])
    }
}

/// Check if the `ip` binary is available.
pub fn check_ip() -> bool {
    Command::new("ip")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
