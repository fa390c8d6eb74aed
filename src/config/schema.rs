//! Configuration schema for `~/.sdbg-settings.json`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};
use crate::sandbox::mount::{MountPlan, Propagation, PseudoFsMode, DEFAULT_WORK_AREA};
use crate::sandbox::network::{Ipv4Cidr, NetNamespaceSpec};
use crate::sandbox::overlay::DEFAULT_LOWER_DIR;
use crate::trace::TraceOptions;
use crate::utils::{expand_home, normalize_path};

/// Command run inside the sandbox when none is given.
pub const DEFAULT_COMMAND: &str = "mount";

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemConfig {
    /// Directory that receives the tmpfs holding the overlay layers.
    #[serde(default)]
    pub work_area: Option<String>,

    /// Read-only lower layer of the overlay (default: the host root).
    #[serde(default)]
    pub lower_dir: Option<String>,

    /// Propagation applied to the new mount namespace.
    #[serde(default)]
    pub propagation: Option<Propagation>,

    /// How /dev, /proc and /sys are restored after the pivot.
    #[serde(default)]
    pub pseudo_filesystems: Option<PseudoFsMode>,
}

/// Private network namespace configuration. Absent means the host network
/// is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Namespace name under /run/netns (default: generated).
    #[serde(default)]
    pub namespace: Option<String>,

    /// Host-side veth name (default: generated).
    #[serde(default)]
    pub veth_host: Option<String>,

    /// Namespace-side veth name (default: generated).
    #[serde(default)]
    pub veth_peer: Option<String>,

    #[serde(default = "default_host_address")]
    pub host_address: Ipv4Cidr,

    #[serde(default = "default_peer_address")]
    pub peer_address: Ipv4Cidr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            veth_host: None,
            veth_peer: None,
            host_address: default_host_address(),
            peer_address: default_peer_address(),
        }
    }
}

fn default_host_address() -> Ipv4Cidr {
    Ipv4Cidr {
        address: Ipv4Addr::new(10, 200, 0, 1),
        prefix: 24,
    }
}

fn default_peer_address() -> Ipv4Cidr {
    Ipv4Cidr {
        address: Ipv4Addr::new(10, 200, 0, 2),
        prefix: 24,
    }
}

impl NetworkConfig {
    /// Namespace spec with generated names filled in where unset.
    pub fn namespace_spec(&self) -> NetNamespaceSpec {
        let mut spec = NetNamespaceSpec::generated(self.host_address, self.peer_address);
        if let Some(ref name) = self.namespace {
            spec.name = name.clone();
        }
        if let Some(ref name) = self.veth_host {
            spec.veth_host = name.clone();
        }
        if let Some(ref name) = self.veth_peer {
            spec.veth_peer = name.clone();
        }
        spec
    }
}

/// Syscall tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceConfig {
    /// Run the command under the syscall tracer.
    #[serde(default)]
    pub enabled: bool,

    /// Give up waiting for a single debugger event after this long.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,

    /// Read syscall numbers and arguments at each stop.
    #[serde(default)]
    pub decode_syscalls: Option<bool>,
}

impl TraceConfig {
    pub fn options(&self) -> TraceOptions {
        TraceOptions {
            decode_syscalls: self.decode_syscalls.unwrap_or(true),
            wait_timeout: self.wait_timeout_ms.map(Duration::from_millis),
            time_limit: None,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDebugConfig {
    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub network: Option<NetworkConfig>,

    #[serde(default)]
    pub trace: TraceConfig,

    /// Command line run when none is given on the command line.
    #[serde(default)]
    pub default_command: Option<String>,

    /// Wall-clock limit for the sandboxed command, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SandboxDebugConfig {
    /// Mount plan described by the filesystem section.
    pub fn mount_plan(&self) -> MountPlan {
        let fs = &self.filesystem;
        MountPlan {
            work_area: PathBuf::from(expand_home(
                fs.work_area.as_deref().unwrap_or(DEFAULT_WORK_AREA),
            )),
            // Symlinks in lowerdir are resolved so overlap checks see the real path.
            lower: normalize_path(Path::new(
                fs.lower_dir.as_deref().unwrap_or(DEFAULT_LOWER_DIR),
            )),
            propagation: fs.propagation.unwrap_or_default(),
            pseudo_filesystems: fs.pseudo_filesystems.unwrap_or_default(),
        }
    }

    /// Network namespace to build, if one is configured.
    pub fn network_spec(&self) -> Option<NetNamespaceSpec> {
        self.network.as_ref().map(NetworkConfig::namespace_spec)
    }

    /// Command line used when the caller gives none.
    pub fn default_command(&self) -> &str {
        self.default_command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SandboxError> {
        for (key, value) in [
            ("workArea", &self.filesystem.work_area),
            ("lowerDir", &self.filesystem.lower_dir),
        ] {
            if let Some(path) = value {
                if !expand_home(path).starts_with('/') {
                    return Err(ConfigError::InvalidPath {
                        path: path.clone(),
                        reason: format!("{} must be absolute", key),
                    }
                    .into());
                }
            }
        }

        self.mount_plan().validate()?;

        if let Some(spec) = self.network_spec() {
            spec.validate()?;
        }

        if self.trace.wait_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "trace.waitTimeoutMs must be greater than zero".to_string(),
            )
            .into());
        }

        if let Some(ref cmd) = self.default_command {
            if cmd.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "defaultCommand cannot be empty".to_string(),
                )
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxDebugConfig::default();
        let plan = config.mount_plan();
        assert_eq!(plan.work_area, PathBuf::from(DEFAULT_WORK_AREA));
        assert_eq!(plan.lower, PathBuf::from("/"));
        assert_eq!(plan.propagation, Propagation::Slave);
        assert_eq!(plan.pseudo_filesystems, PseudoFsMode::Move);
        assert!(config.network_spec().is_none());
        assert_eq!(config.default_command(), "mount");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_spec_overrides() {
        let network = NetworkConfig {
            namespace: Some("dbg".to_string()),
            veth_host: Some("dbg-host".to_string()),
            ..Default::default()
        };
        let spec = network.namespace_spec();
        assert_eq!(spec.name, "dbg");
        assert_eq!(spec.veth_host, "dbg-host");
        assert!(spec.veth_peer.starts_with("sdbg-p-"));
        assert_eq!(spec.peer_address.to_string(), "10.200.0.2/24");
    }

    #[test]
    fn test_generated_names_fit_interface_limit() {
        let spec = NetworkConfig::default().namespace_spec();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_relative_work_area_rejected() {
        let config = SandboxDebugConfig {
            filesystem: FilesystemConfig {
                work_area: Some("run/sdbg".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SandboxError::Config(ConfigError::InvalidPath { .. }))
        ));
    }

    #[test]
    fn test_trace_options() {
        let trace = TraceConfig {
            enabled: true,
            wait_timeout_ms: Some(250),
            decode_syscalls: Some(false),
        };
        let options = trace.options();
        assert!(!options.decode_syscalls);
        assert_eq!(options.wait_timeout, Some(Duration::from_millis(250)));
    }
}
