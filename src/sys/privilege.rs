//! Effective-privilege detection.
//!
//! Checked before any stateful syscall so a missing capability is reported
//! up front instead of surfacing as EPERM halfway through a sequence.

/// Capabilities the sandbox needs. Values are the kernel's bit numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// CAP_NET_ADMIN: veth and address configuration.
    NetAdmin = 12,
    /// CAP_SYS_ADMIN: unshare, mount, pivot_root, setns.
    SysAdmin = 21,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::NetAdmin => "CAP_NET_ADMIN",
            Capability::SysAdmin => "CAP_SYS_ADMIN",
        }
    }

    fn mask(&self) -> u64 {
        1u64 << (*self as u32)
    }
}

/// Answers whether the current process holds a capability.
pub trait PrivilegeProbe {
    fn has_capability(&self, cap: Capability) -> bool;
}

/// Probe for the running process, based on `/proc/self/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPrivileges;

impl PrivilegeProbe for ProcessPrivileges {
    fn has_capability(&self, cap: Capability) -> bool {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(eff) = parse_effective_capabilities(&status) {
                return eff & cap.mask() != 0;
            }
        }
        // No capability line: fall back to the uid.
        nix::unistd::geteuid().is_root()
    }
}

/// Extract the `CapEff` bitmask from a `/proc/<pid>/status` document.
pub fn parse_effective_capabilities(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|value| u64::from_str_radix(value.trim(), 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_effective_capabilities() {
        let status = "Name:\tbash\nCapInh:\t0000000000000000\nCapPrm:\t000001ffffffffff\n\
                      CapEff:\t000001ffffffffff\nCapBnd:\t000001ffffffffff\n";
        assert_eq!(parse_effective_capabilities(status), Some(0x1ff_ffff_ffff));

        let unprivileged = "CapEff:\t0000000000000000\n";
        assert_eq!(parse_effective_capabilities(unprivileged), Some(0));

        assert_eq!(parse_effective_capabilities("Name:\tbash\n"), None);
        assert_eq!(parse_effective_capabilities("CapEff:\tnothex\n"), None);
    }

    #[test]
    fn test_capability_masks() {
        let only_sys_admin = 1u64 << 21;
        assert_ne!(only_sys_admin & Capability::SysAdmin.mask(), 0);
        assert_eq!(only_sys_admin & Capability::NetAdmin.mask(), 0);
        assert_eq!(Capability::NetAdmin.name(), "CAP_NET_ADMIN");
    }
}
