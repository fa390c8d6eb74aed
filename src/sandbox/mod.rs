//! Namespace, overlay and network construction for the debug sandbox.

pub mod iproute;
pub mod mount;
pub mod network;
pub mod overlay;

use crate::config::SandboxDebugConfig;
use crate::error::SandboxError;
use crate::sys::{Capability, PrivilegeProbe};
use crate::utils::{filesystem_supported, get_arch, is_supported};

pub use mount::{MountPlan, MountSequencer, MountSummary, Propagation, PseudoFsMode};
pub use network::{build_network_namespace, Ipv4Cidr, NetNamespaceSpec, NetworkConfigurator};
pub use overlay::OverlaySpec;

/// Result of checking sandbox dependencies.
#[derive(Debug, Clone, Default)]
pub struct SandboxDependencyCheck {
    /// Errors that prevent the sandbox from running.
    pub errors: Vec<String>,
    /// Warnings about degraded functionality.
    pub warnings: Vec<String>,
}

impl SandboxDependencyCheck {
    /// Returns true if there are no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert to Result, returning error if there are any errors.
    pub fn into_result(self) -> Result<Self, SandboxError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(SandboxError::MissingDependency(self.errors.join(", ")))
        }
    }
}

/// Check what `config` needs from the host and return structured result.
pub fn check_dependencies<P: PrivilegeProbe + ?Sized>(
    config: &SandboxDebugConfig,
    probe: &P,
) -> SandboxDependencyCheck {
    let mut result = SandboxDependencyCheck::default();

    if !is_supported() {
        result
            .errors
            .push("WSL1 has no mount namespaces; use WSL2".to_string());
    }
    for fstype in ["overlay", "tmpfs"] {
        if !filesystem_supported(fstype) {
            result
                .errors
                .push(format!("kernel does not support {} filesystems", fstype));
        }
    }

    if config.network.is_some() && !iproute::check_ip() {
        result
            .errors
            .push("iproute2 (ip) not installed, required for --net".to_string());
    }

    if !probe.has_capability(Capability::SysAdmin) {
        result.warnings.push(format!(
            "{} not held; namespace setup will be refused",
            Capability::SysAdmin.name()
        ));
    }
    if config.trace.enabled && !cfg!(target_arch = "x86_64") {
        result.warnings.push(format!(
            "syscall decoding is only available on x64, not {}",
            get_arch()
        ));
    }

    result
}
