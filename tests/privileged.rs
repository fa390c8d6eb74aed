//! End-to-end runs of the `sdbg` binary. These need root and overlayfs and
//! return early otherwise.

use std::path::Path;
use std::process::{Command, Output};

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use sandbox_debug::sandbox::OverlaySpec;
use sandbox_debug::sys::{self, HostKernel, MountOperation};
use sandbox_debug::utils::filesystem_supported;

fn can_run() -> bool {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping: requires root");
        return false;
    }
    if !filesystem_supported("overlay") {
        eprintln!("skipping: kernel has no overlayfs");
        return false;
    }
    true
}

fn sdbg(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sdbg"))
        .args(args)
        .output()
        .expect("failed to run sdbg")
}

#[test]
fn test_old_root_gone_and_pseudo_filesystems_live() {
    if !can_run() {
        return;
    }
    let out = sdbg(&[
        "-c",
        "test ! -e /oldroot && test -e /proc/self/mountinfo && test -c /dev/null && test -d /sys/class",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn test_fresh_pseudo_filesystems() {
    if !can_run() {
        return;
    }
    let out = sdbg(&["--pseudo-fs", "fresh", "-c", "test -e /proc/self/status && test -d /sys/kernel"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn test_writes_stay_in_overlay() {
    if !can_run() {
        return;
    }
    let probe = format!("/tmp/sdbg-probe-{}", std::process::id());
    let script = format!("echo sandboxed > {0} && test -s {0}", probe);
    let out = sdbg(&["-c", &script]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(!Path::new(&probe).exists());
}

#[test]
fn test_writes_land_in_upper_layer() {
    if !can_run() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let lower = dir.path().join("lower");
    std::fs::create_dir(&lower).unwrap();
    std::fs::write(lower.join("existing"), b"lower").unwrap();
    let work_area = dir.path().join("area");
    std::fs::create_dir(&work_area).unwrap();
    let spec = OverlaySpec::in_work_area(&work_area, &lower);

    // After unsharing CLONE_NEWNS|CLONE_FS the mount table belongs to this
    // thread alone and goes away with it.
    let layers = spec.clone();
    let (written, existing) = std::thread::spawn(move || {
        sys::unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_FS).unwrap();
        MountOperation::propagation("/", MsFlags::MS_SLAVE, true)
            .issue()
            .unwrap();
        MountOperation::filesystem("tmpfs", &work_area).issue().unwrap();
        layers.materialize(&mut HostKernel).unwrap();
        layers.mount_operation().issue().unwrap();

        std::fs::write(layers.target.join("written"), b"sandboxed").unwrap();
        std::fs::write(layers.target.join("existing"), b"changed").unwrap();
        (
            std::fs::read(layers.upper.join("written")).unwrap(),
            std::fs::read(layers.upper.join("existing")).unwrap(),
        )
    })
    .join()
    .unwrap();

    assert_eq!(written, b"sandboxed");
    assert_eq!(existing, b"changed");
    assert_eq!(std::fs::read(lower.join("existing")).unwrap(), b"lower");
    assert!(!lower.join("written").exists());
    // The tmpfs holding the layers never reached the host's mount table.
    assert!(!spec.upper.exists());
}

#[test]
fn test_default_command_shows_overlay_root() {
    if !can_run() {
        return;
    }
    let out = sdbg(&[]);
    assert!(out.status.success());
    let table = String::from_utf8_lossy(&out.stdout);
    assert!(
        table.lines().any(|l| l.starts_with("overlay on / ")),
        "mount table:\n{}",
        table
    );
}

#[test]
fn test_exit_code_is_forwarded() {
    if !can_run() {
        return;
    }
    let out = sdbg(&["-c", "exit 7"]);
    assert_eq!(out.status.code(), Some(7));
}

#[test]
fn test_invalid_work_area_fails_before_setup() {
    if !can_run() {
        return;
    }
    let out = sdbg(&["--work-area", "/", "--", "true"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_traced_run() {
    if !can_run() {
        return;
    }
    let out = sdbg(&["--trace", "--", "/bin/true"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("+++ exited with 0 +++"), "{}", stderr);
}

/// Host interfaces whose name starts with `prefix`.
fn host_links(prefix: &str) -> Vec<String> {
    std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(prefix))
                .collect()
        })
        .unwrap_or_default()
}

fn netns_exists(name: &str) -> bool {
    let out = Command::new("ip")
        .args(["netns", "list"])
        .output()
        .expect("failed to run ip netns list");
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .any(|line| line.split_whitespace().next() == Some(name))
}

#[test]
fn test_private_network_namespace() {
    if !can_run() || !sandbox_debug::sandbox::iproute::check_ip() {
        return;
    }
    let id = std::process::id() % 0x10000;
    let netns = format!("sdbg-test-{:04x}", id);
    let veth_host = format!("sdbg-th-{:04x}", id);
    let settings = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        settings.path(),
        format!(
            r#"{{"network": {{"namespace": "{}", "vethHost": "{}", "vethPeer": "sdbg-tp-{:04x}"}}}}"#,
            netns, veth_host, id
        ),
    )
    .unwrap();

    // Only lo and the peer end are visible inside.
    let out = sdbg(&[
        "-s",
        settings.path().to_str().unwrap(),
        "--peer-addr",
        "10.231.0.2/24",
        "--host-addr",
        "10.231.0.1/24",
        "-c",
        "test \"$(ip -o link show | wc -l)\" -eq 2 && ip -4 -o addr show | grep -q 10.231.0.2/24",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    // The namespace dies with the sandboxed process tree and takes the
    // veth pair with it; the host end may linger briefly while the kernel
    // tears it down.
    assert!(!netns_exists(&netns));
    for _ in 0..50 {
        if host_links(&veth_host).is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert_eq!(host_links(&veth_host), Vec::<String>::new());
}
