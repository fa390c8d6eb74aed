//! Checked bindings for the namespace and mount syscalls.
//!
//! Every wrapper returns `Result<(), OsError>`. The errno is captured by nix
//! directly after the libc call returns, so nothing can clobber it before it
//! is turned into an [`OsError`].

pub mod privilege;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use thiserror::Error;

pub use privilege::{Capability, PrivilegeProbe, ProcessPrivileges};

/// A failed kernel call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    /// The syscall that failed.
    pub op: &'static str,
    /// The errno reported by the kernel.
    pub errno: Errno,
    /// `strerror` text for `errno`.
    pub message: String,
}

impl OsError {
    pub fn new(op: &'static str, errno: Errno) -> Self {
        Self {
            op,
            errno,
            message: errno.desc().to_string(),
        }
    }

    /// Build from an `io::Error`, keeping the raw errno when there is one.
    pub fn from_io(op: &'static str, err: &std::io::Error) -> Self {
        let errno = err
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        Self {
            op,
            errno,
            message: err.to_string(),
        }
    }

    /// The raw errno value.
    pub fn raw_os_error(&self) -> i32 {
        self.errno as i32
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (errno {})", self.op, self.message, self.errno as i32)
    }
}

/// Detach the given namespace facets from the calling process.
pub fn unshare(flags: CloneFlags) -> Result<(), OsError> {
    nix::sched::unshare(flags).map_err(|e| OsError::new("unshare", e))
}

/// Issue mount(2).
///
/// `None` is passed to the kernel as a null pointer. An empty string is a
/// real, zero-length argument and is not the same thing.
pub fn mount(
    source: Option<&OsStr>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&OsStr>,
) -> Result<(), OsError> {
    nix::mount::mount(source, target, fstype, flags, data).map_err(|e| OsError::new("mount", e))
}

/// Issue umount2(2). `recursive` detaches the whole subtree lazily.
pub fn unmount(target: &Path, recursive: bool) -> Result<(), OsError> {
    let flags = if recursive {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    nix::mount::umount2(target, flags).map_err(|e| OsError::new("umount2", e))
}

/// Swap the process root. `new_root` must be a mount point and `put_old`
/// a directory beneath it.
pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<(), OsError> {
    nix::unistd::pivot_root(new_root, put_old).map_err(|e| OsError::new("pivot_root", e))
}

/// One mount(2) call, kept as a value so it can be logged and recorded.
///
/// Source and data may carry paths and are passed through byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOperation {
    pub source: Option<OsString>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<OsString>,
}

impl MountOperation {
    /// Mount a fresh filesystem instance of `fstype` at `target`.
    pub fn filesystem(fstype: &str, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(fstype.into()),
            target: target.into(),
            fstype: Some(fstype.to_string()),
            flags: MsFlags::empty(),
            data: None,
        }
    }

    /// Change propagation of `target` (and everything below it when
    /// `recursive`). Source, type and data are all absent.
    pub fn propagation(target: impl Into<PathBuf>, mode: MsFlags, recursive: bool) -> Self {
        let mut flags = mode;
        if recursive {
            flags |= MsFlags::MS_REC;
        }
        Self {
            source: None,
            target: target.into(),
            fstype: None,
            flags,
            data: None,
        }
    }

    /// Move an existing mount from `source` to `target`.
    pub fn move_mount(source: impl AsRef<Path>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.as_ref().as_os_str().to_os_string()),
            target: target.into(),
            fstype: None,
            flags: MsFlags::MS_MOVE,
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<OsString>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Hand the operation to the kernel.
    pub fn issue(&self) -> Result<(), OsError> {
        mount(
            self.source.as_deref(),
            &self.target,
            self.fstype.as_deref(),
            self.flags,
            self.data.as_deref(),
        )
    }
}

impl fmt::Display for MountOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mount({}, {}, {}, {:?}, {})",
            display_arg(self.source.as_deref()),
            self.target.display(),
            self.fstype.as_deref().unwrap_or("NULL"),
            self.flags,
            display_arg(self.data.as_deref()),
        )
    }
}

fn display_arg(arg: Option<&OsStr>) -> std::borrow::Cow<'_, str> {
    arg.map_or("NULL".into(), OsStr::to_string_lossy)
}

/// The kernel operations the mount sequencer drives.
///
/// [`HostKernel`] forwards to the real syscalls; tests substitute a
/// recording implementation.
pub trait Kernel: PrivilegeProbe {
    fn unshare(&mut self, flags: CloneFlags) -> Result<(), OsError>;
    fn mount(&mut self, op: &MountOperation) -> Result<(), OsError>;
    fn unmount(&mut self, target: &Path, recursive: bool) -> Result<(), OsError>;
    fn pivot_root(&mut self, new_root: &Path, put_old: &Path) -> Result<(), OsError>;
    fn chdir(&mut self, path: &Path) -> Result<(), OsError>;
    fn create_dir_all(&mut self, path: &Path) -> Result<(), OsError>;
    fn remove_dir(&mut self, path: &Path) -> Result<(), OsError>;
    /// Whether `path` is a directory with no entries.
    fn is_empty_dir(&self, path: &Path) -> Result<bool, OsError>;
    /// Device id of the filesystem holding `path`.
    fn device_of(&self, path: &Path) -> Result<u64, OsError>;
}

/// [`Kernel`] backed by the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernel;

impl PrivilegeProbe for HostKernel {
    fn has_capability(&self, cap: Capability) -> bool {
        ProcessPrivileges.has_capability(cap)
    }
}

impl Kernel for HostKernel {
    fn unshare(&mut self, flags: CloneFlags) -> Result<(), OsError> {
        unshare(flags)
    }

    fn mount(&mut self, op: &MountOperation) -> Result<(), OsError> {
        op.issue()
    }

    fn unmount(&mut self, target: &Path, recursive: bool) -> Result<(), OsError> {
        unmount(target, recursive)
    }

    fn pivot_root(&mut self, new_root: &Path, put_old: &Path) -> Result<(), OsError> {
        pivot_root(new_root, put_old)
    }

    fn chdir(&mut self, path: &Path) -> Result<(), OsError> {
        nix::unistd::chdir(path).map_err(|e| OsError::new("chdir", e))
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<(), OsError> {
        std::fs::create_dir_all(path).map_err(|e| OsError::from_io("mkdir", &e))
    }

    fn remove_dir(&mut self, path: &Path) -> Result<(), OsError> {
        std::fs::remove_dir(path).map_err(|e| OsError::from_io("rmdir", &e))
    }

    fn is_empty_dir(&self, path: &Path) -> Result<bool, OsError> {
        let mut entries = std::fs::read_dir(path).map_err(|e| OsError::from_io("opendir", &e))?;
        Ok(entries.next().is_none())
    }

    fn device_of(&self, path: &Path) -> Result<u64, OsError> {
        use std::os::unix::fs::MetadataExt;

        std::fs::metadata(path)
            .map(|m| m.dev())
            .map_err(|e| OsError::from_io("stat", &e))
    }
}
