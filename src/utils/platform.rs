//! Platform detection utilities.

/// Get the CPU architecture.
pub fn get_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "x64"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        "unknown"
    }
}

/// Check if the current platform is supported.
/// Returns false on WSL1, which has no mount namespaces or overlayfs.
pub fn is_supported() -> bool {
    get_wsl_version().as_deref() != Some("1")
}

/// Get the WSL version (1 or 2+) if running in WSL.
/// Returns None if not running in WSL.
///
/// Detection logic:
/// 1. Read /proc/version which contains kernel info
/// 2. Look for explicit "WSL2", "WSL3" etc. markers (case-insensitive)
/// 3. If no explicit version but "microsoft" is present, assume WSL1
pub fn get_wsl_version() -> Option<String> {
    let proc_version = std::fs::read_to_string("/proc/version").ok()?;
    parse_wsl_version_from_string(&proc_version)
}

/// Parse WSL version from a /proc/version string.
fn parse_wsl_version_from_string(proc_version: &str) -> Option<String> {
    let proc_lower = proc_version.to_lowercase();

    if let Some(pos) = proc_lower.find("wsl") {
        let after_wsl = &proc_lower[pos + 3..];
        if let Some(ch) = after_wsl.chars().next() {
            if ch.is_ascii_digit() {
                return Some(ch.to_string());
            }
        }
    }

    // Original WSL1 format: "4.4.0-19041-Microsoft"
    if proc_lower.contains("microsoft") {
        return Some("1".to_string());
    }

    None
}

/// Whether the running kernel can mount `fstype`, per /proc/filesystems.
pub fn filesystem_supported(fstype: &str) -> bool {
    match std::fs::read_to_string("/proc/filesystems") {
        Ok(content) => parse_filesystems(&content).any(|name| name == fstype),
        Err(_) => false,
    }
}

/// Filesystem names from /proc/filesystems ("nodev\ttmpfs" or "\text4").
fn parse_filesystems(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_arch() {
        let arch = get_arch();
        assert!(arch == "x64" || arch == "arm64" || arch == "unknown");
    }

    #[test]
    fn test_wsl_version_parsing_wsl2() {
        let wsl2_version = "Linux version 5.15.90.1-microsoft-standard-WSL2 (oe-user@oe-host)";
        assert_eq!(parse_wsl_version_from_string(wsl2_version), Some("2".to_string()));

        let wsl2_upper = "Linux version 5.15.90.1-MICROSOFT-STANDARD-WSL2";
        assert_eq!(parse_wsl_version_from_string(wsl2_upper), Some("2".to_string()));
    }

    #[test]
    fn test_wsl_version_parsing_wsl1() {
        let wsl1_version = "Linux version 4.4.0-19041-Microsoft (Microsoft@Microsoft.com)";
        assert_eq!(parse_wsl_version_from_string(wsl1_version), Some("1".to_string()));
    }

    #[test]
    fn test_wsl_version_parsing_native_linux() {
        let native = "Linux version 6.2.0-26-generic (buildd@ubuntu)";
        assert_eq!(parse_wsl_version_from_string(native), None);
        assert_eq!(parse_wsl_version_from_string(""), None);
    }

    #[test]
    fn test_parse_filesystems() {
        let content = "nodev\tsysfs\nnodev\ttmpfs\n\text4\nnodev\toverlay\n";
        let names: Vec<_> = parse_filesystems(content).collect();
        assert_eq!(names, vec!["sysfs", "tmpfs", "ext4", "overlay"]);
    }

    #[test]
    fn test_tmpfs_is_supported() {
        // Every kernel this runs on has tmpfs.
        assert!(filesystem_supported("tmpfs"));
        assert!(!filesystem_supported("sdbg-no-such-fs"));
    }
}
