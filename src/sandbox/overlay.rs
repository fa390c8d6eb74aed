//! Overlay layer layout and mount options.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::SandboxError;
use crate::sys::{Kernel, MountOperation};

/// Default lower layer: the live root filesystem.
pub const DEFAULT_LOWER_DIR: &str = "/";

/// Layers of an overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    /// Read-only lower layer.
    pub lower: PathBuf,
    /// Writable upper layer.
    pub upper: PathBuf,
    /// Overlay scratch directory. Must be empty and share a filesystem with `upper`.
    pub work: PathBuf,
    /// Where the merged view is mounted.
    pub target: PathBuf,
}

impl OverlaySpec {
    /// Standard layout under a work area: `root/`, `upper/`, `work/`.
    pub fn in_work_area(work_area: &Path, lower: impl Into<PathBuf>) -> Self {
        Self {
            lower: lower.into(),
            upper: work_area.join("upper"),
            work: work_area.join("work"),
            target: work_area.join("root"),
        }
    }

    /// Same layout with the live root as lower layer.
    pub fn over_root(work_area: &Path) -> Self {
        Self::in_work_area(work_area, DEFAULT_LOWER_DIR)
    }

    /// `lowerdir=<L>,upperdir=<U>,workdir=<W>`
    pub fn mount_options(&self) -> OsString {
        let mut options = OsString::from("lowerdir=");
        options.push(&self.lower);
        options.push(",upperdir=");
        options.push(&self.upper);
        options.push(",workdir=");
        options.push(&self.work);
        options
    }

    /// The mount(2) call producing the merged view.
    pub fn mount_operation(&self) -> MountOperation {
        MountOperation::filesystem("overlay", &self.target).with_data(self.mount_options())
    }

    /// Directories that must exist before mounting.
    pub fn directories(&self) -> [&Path; 3] {
        [&self.upper, &self.work, &self.target]
    }

    /// Check the layer layout without touching the filesystem.
    pub fn validate(&self) -> Result<(), SandboxError> {
        for (name, path) in [
            ("lowerdir", &self.lower),
            ("upperdir", &self.upper),
            ("workdir", &self.work),
            ("target", &self.target),
        ] {
            if !path.is_absolute() {
                return Err(SandboxError::Precondition(format!(
                    "{} '{}' must be an absolute path",
                    name,
                    path.display()
                )));
            }
            // Overlay options are comma separated and colon separate lower layers.
            let text = path.display().to_string();
            if text.contains(',') || text.contains(':') {
                return Err(SandboxError::Precondition(format!(
                    "{} '{}' must not contain ',' or ':'",
                    name, text
                )));
            }
        }

        if self.upper == self.work {
            return Err(SandboxError::Precondition(format!(
                "upperdir and workdir must differ (both '{}')",
                self.upper.display()
            )));
        }
        if self.upper.starts_with(&self.work) || self.work.starts_with(&self.upper) {
            return Err(SandboxError::Precondition(
                "upperdir and workdir must not be nested".to_string(),
            ));
        }

        for (name, path) in [("upperdir", &self.upper), ("workdir", &self.work)] {
            if overlaps_lower(&self.lower, path) {
                return Err(SandboxError::Precondition(format!(
                    "{} '{}' overlaps lowerdir '{}'",
                    name,
                    path.display(),
                    self.lower.display()
                )));
            }
        }

        Ok(())
    }

    /// Create the layer directories (idempotent) and check the on-disk
    /// invariants: `work` empty, `upper` and `work` on one filesystem.
    pub fn materialize<K: Kernel>(&self, kernel: &mut K) -> Result<(), SandboxError> {
        for dir in self.directories() {
            kernel
                .create_dir_all(dir)
                .map_err(|source| SandboxError::Step {
                    step: "create overlay directories",
                    source,
                })?;
        }

        let step = |source| SandboxError::Step {
            step: "inspect overlay directories",
            source,
        };
        if !kernel.is_empty_dir(&self.work).map_err(step)? {
            return Err(SandboxError::Precondition(format!(
                "workdir '{}' is not empty",
                self.work.display()
            )));
        }
        if kernel.device_of(&self.upper).map_err(step)? != kernel.device_of(&self.work).map_err(step)? {
            return Err(SandboxError::Precondition(
                "upperdir and workdir must be on the same filesystem".to_string(),
            ));
        }

        Ok(())
    }
}

/// Whether a writable layer collides with the lower layer.
///
/// With the live root as lower layer every path lives "inside" it, so only
/// identity counts there; the writable layers sit on their own tmpfs mount.
fn overlaps_lower(lower: &Path, layer: &Path) -> bool {
    if lower == layer || lower.starts_with(layer) {
        return true;
    }
    lower != Path::new("/") && layer.starts_with(lower)
}
