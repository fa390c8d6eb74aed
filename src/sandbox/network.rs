//! Network namespace construction.
//!
//! Builds a named network namespace joined to the host by a veth pair and
//! moves the calling process into it. Once inside, the namespace's name is
//! released so nothing outlives the process tree. The veth/address
//! plumbing itself is delegated to a [`NetworkConfigurator`]; this module
//! only sequences it.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};
use crate::sys::{Capability, PrivilegeProbe};
use crate::utils::CancellationToken;

/// Kernel limit for interface names (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

static INTERFACE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid interface regex"));

/// IPv4 address with prefix length, e.g. `10.200.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, ConfigError> {
        if prefix > 32 {
            return Err(ConfigError::InvalidAddress {
                value: format!("{}/{}", address, prefix),
                reason: "prefix length must be at most 32".to_string(),
            });
        }
        Ok(Self { address, prefix })
    }

    /// Network address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        Ipv4Addr::from(u32::from(self.address) & mask)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected ADDRESS/PREFIX"))?;
        let address = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("not an IPv4 address"))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| invalid("prefix length is not a number"))?;
        Self::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Which side of the veth pair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetScope<'a> {
    /// The namespace the process started in.
    Host,
    /// A named network namespace.
    Namespace(&'a str),
}

/// Capability interface for network configuration.
pub trait NetworkConfigurator {
    /// Whether an interface with this name exists on the host.
    fn link_exists(&mut self, name: &str) -> Result<bool, SandboxError>;
    fn create_veth_pair(&mut self, host: &str, peer: &str) -> Result<(), SandboxError>;
    fn create_namespace(&mut self, namespace: &str) -> Result<(), SandboxError>;
    fn move_to_namespace(&mut self, link: &str, namespace: &str) -> Result<(), SandboxError>;
    fn assign_address(
        &mut self,
        scope: NetScope<'_>,
        link: &str,
        address: &Ipv4Cidr,
    ) -> Result<(), SandboxError>;
    fn set_link_up(&mut self, scope: NetScope<'_>, link: &str) -> Result<(), SandboxError>;
    /// Switch the calling process into `namespace`.
    fn enter_namespace(&mut self, namespace: &str) -> Result<(), SandboxError>;
    /// Drop the named handle of `namespace`. Processes inside keep it
    /// alive; the kernel destroys it, and the veth pair with it, once the
    /// last of them exits.
    fn release_namespace(&mut self, namespace: &str) -> Result<(), SandboxError>;
}

/// Network namespace and veth pair to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNamespaceSpec {
    pub name: String,
    pub veth_host: String,
    pub veth_peer: String,
    pub host_address: Ipv4Cidr,
    pub peer_address: Ipv4Cidr,
}

impl NetNamespaceSpec {
    /// Spec with generated, collision-resistant names.
    pub fn generated(host_address: Ipv4Cidr, peer_address: Ipv4Cidr) -> Self {
        let suffix = random_suffix();
        Self {
            name: format!("sdbg-{}", suffix),
            veth_host: format!("sdbg-h-{}", suffix),
            veth_peer: format!("sdbg-p-{}", suffix),
            host_address,
            peer_address,
        }
    }

    /// Static checks; no interface lookups.
    pub fn validate(&self) -> Result<(), SandboxError> {
        validate_interface_name(&self.veth_host)?;
        validate_interface_name(&self.veth_peer)?;
        validate_namespace_name(&self.name)?;

        if self.veth_host == self.veth_peer {
            return Err(SandboxError::Precondition(format!(
                "veth endpoints must have distinct names (both '{}')",
                self.veth_host
            )));
        }
        if self.host_address.address == self.peer_address.address {
            return Err(SandboxError::Precondition(format!(
                "host and peer addresses must differ (both {})",
                self.host_address.address
            )));
        }
        if self.host_address.network() != self.peer_address.network()
            || self.host_address.prefix != self.peer_address.prefix
        {
            tracing::warn!(
                "veth addresses {} and {} are not on the same subnet",
                self.host_address,
                self.peer_address
            );
        }
        Ok(())
    }
}

/// Four random hex digits, enough to keep concurrent runs apart.
fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let value: u16 = rng.gen();
    format!("{:04x}", value)
}

/// Check an interface name against the kernel's rules.
pub fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidInterfaceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(invalid("name is longer than 15 bytes"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name is reserved"));
    }
    if !INTERFACE_NAME.is_match(name) {
        return Err(invalid("only letters, digits, '_', '.' and '-' are allowed"));
    }
    Ok(())
}

/// Namespace names become files under /run/netns.
pub fn validate_namespace_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ConfigError::ValidationError(format!(
            "invalid network namespace name '{}'",
            name
        )));
    }
    Ok(())
}

/// Build the namespace described by `spec`, move the process into it and
/// release its name.
///
/// Steps run in order and the first failure aborts. A veth pair or named
/// namespace created before the failure is left in place.
pub fn build_network_namespace<N, P>(
    spec: &NetNamespaceSpec,
    net: &mut N,
    probe: &P,
    cancel: &CancellationToken,
) -> Result<(), SandboxError>
where
    N: NetworkConfigurator + ?Sized,
    P: PrivilegeProbe + ?Sized,
{
    spec.validate()?;

    for cap in [Capability::NetAdmin, Capability::SysAdmin] {
        if !probe.has_capability(cap) {
            return Err(SandboxError::Privilege(format!(
                "{} is required to build a network namespace",
                cap.name()
            )));
        }
    }

    for name in [&spec.veth_host, &spec.veth_peer] {
        if net.link_exists(name)? {
            return Err(SandboxError::Precondition(format!(
                "interface '{}' already exists on the host",
                name
            )));
        }
    }

    let ns = spec.name.as_str();
    let checkpoint = |step: &'static str| -> Result<(), SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled(step));
        }
        tracing::debug!("network namespace {}: {}", ns, step);
        Ok(())
    };

    checkpoint("create veth pair")?;
    net.create_veth_pair(&spec.veth_host, &spec.veth_peer)?;

    checkpoint("move peer into namespace")?;
    net.create_namespace(ns)?;
    net.move_to_namespace(&spec.veth_peer, ns)?;

    checkpoint("configure peer")?;
    net.assign_address(NetScope::Namespace(ns), &spec.veth_peer, &spec.peer_address)?;
    net.set_link_up(NetScope::Namespace(ns), &spec.veth_peer)?;
    net.set_link_up(NetScope::Namespace(ns), "lo")?;

    checkpoint("configure host endpoint")?;
    net.assign_address(NetScope::Host, &spec.veth_host, &spec.host_address)?;
    net.set_link_up(NetScope::Host, &spec.veth_host)?;

    checkpoint("enter namespace")?;
    net.enter_namespace(ns)?;
    net.release_namespace(ns)?;

    tracing::info!(
        "network namespace {} ready: {} ({}) <-> {} ({})",
        ns,
        spec.veth_host,
        spec.host_address,
        spec.veth_peer,
        spec.peer_address
    );
    Ok(())
}
