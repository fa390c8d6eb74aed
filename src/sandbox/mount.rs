//! Mount namespace sequencer.
//!
//! Moves the calling process from the host root onto a private overlay
//! root. The steps run strictly in order; the first failure aborts the run
//! and nothing is rolled back, so a failed run leaves the process in a
//! partially transformed namespace.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::sandbox::overlay::OverlaySpec;
use crate::sys::{Capability, Kernel, MountOperation, OsError};
use crate::utils::CancellationToken;

/// Default fixed work area holding the tmpfs and overlay layers.
pub const DEFAULT_WORK_AREA: &str = "/run/sdbg";

/// Name of the old-root directory beneath the new root during the pivot.
pub const OLD_ROOT_DIR: &str = "oldroot";

/// Pseudo-filesystems carried over from the old root.
pub const PSEUDO_FILESYSTEMS: [&str; 3] = ["/dev", "/proc", "/sys"];

/// Mount propagation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    Shared,
    #[default]
    Slave,
}

impl Propagation {
    fn flag(&self) -> MsFlags {
        match self {
            Propagation::Private => MsFlags::MS_PRIVATE,
            Propagation::Shared => MsFlags::MS_SHARED,
            Propagation::Slave => MsFlags::MS_SLAVE,
        }
    }
}

/// How `/proc` and `/sys` are provided in the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PseudoFsMode {
    /// Move the live mounts over from the old root.
    #[default]
    Move,
    /// Mount new proc and sysfs instances. `/dev` is still moved.
    Fresh,
}

/// Steps of the sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SequenceStep {
    Unshare,
    Propagation,
    WorkArea,
    Overlay,
    Pivot,
    Chdir,
    PseudoFilesystems,
    DetachOldRoot,
}

impl SequenceStep {
    pub fn name(&self) -> &'static str {
        match self {
            SequenceStep::Unshare => "unshare mount namespace",
            SequenceStep::Propagation => "change mount propagation",
            SequenceStep::WorkArea => "mount work area tmpfs",
            SequenceStep::Overlay => "mount overlay",
            SequenceStep::Pivot => "pivot root",
            SequenceStep::Chdir => "enter new root",
            SequenceStep::PseudoFilesystems => "restore pseudo-filesystems",
            SequenceStep::DetachOldRoot => "detach old root",
        }
    }
}

impl fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical state of the mount namespace while the sequence runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceContext {
    /// The root as seen by the process.
    pub current_root: PathBuf,
    /// Where the old root is reachable; only meaningful after the pivot.
    pub old_root: PathBuf,
    /// Propagation applied to the tree, once it has been changed.
    pub propagation: Option<Propagation>,
    /// Last step that completed.
    pub completed: Option<SequenceStep>,
}

impl NamespaceContext {
    fn new(new_root: &Path) -> Self {
        Self {
            current_root: PathBuf::from("/"),
            old_root: new_root.join(OLD_ROOT_DIR),
            propagation: None,
            completed: None,
        }
    }

    fn complete(&mut self, step: SequenceStep) {
        tracing::debug!("mount sequence: {} done", step);
        self.completed = Some(step);
    }
}

/// Options for one sequencer run.
#[derive(Debug, Clone)]
pub struct MountPlan {
    /// Fixed directory that receives the tmpfs.
    pub work_area: PathBuf,
    /// Lower layer of the overlay.
    pub lower: PathBuf,
    pub propagation: Propagation,
    pub pseudo_filesystems: PseudoFsMode,
}

impl Default for MountPlan {
    fn default() -> Self {
        Self {
            work_area: PathBuf::from(DEFAULT_WORK_AREA),
            lower: PathBuf::from(crate::sandbox::overlay::DEFAULT_LOWER_DIR),
            propagation: Propagation::default(),
            pseudo_filesystems: PseudoFsMode::default(),
        }
    }
}

impl MountPlan {
    /// Overlay layout implied by the plan.
    pub fn overlay(&self) -> OverlaySpec {
        OverlaySpec::in_work_area(&self.work_area, &self.lower)
    }

    /// Check the plan before any syscall is issued.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if !self.work_area.is_absolute() || self.work_area == Path::new("/") {
            return Err(SandboxError::Precondition(format!(
                "work area '{}' must be an absolute path below /",
                self.work_area.display()
            )));
        }
        if self.propagation == Propagation::Shared {
            return Err(SandboxError::Precondition(
                "shared propagation would leak sandbox mounts to the host".to_string(),
            ));
        }
        self.overlay().validate()
    }
}

/// Result of a completed sequence.
#[derive(Debug, Clone)]
pub struct MountSummary {
    /// Work area as seen from the host before the pivot.
    pub work_area: PathBuf,
    /// Overlay option string that was mounted.
    pub overlay_options: OsString,
}

/// Drives the mount steps against a [`Kernel`].
pub struct MountSequencer<'a, K: Kernel> {
    kernel: &'a mut K,
    plan: MountPlan,
    cancel: CancellationToken,
}

impl<'a, K: Kernel> MountSequencer<'a, K> {
    pub fn new(kernel: &'a mut K, plan: MountPlan) -> Self {
        Self {
            kernel,
            plan,
            cancel: CancellationToken::new(),
        }
    }

    /// Check the token between steps.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the full sequence.
    pub fn run(self) -> Result<MountSummary, SandboxError> {
        let overlay = self.plan.overlay();
        self.plan.validate()?;

        if !self.kernel.has_capability(Capability::SysAdmin) {
            return Err(SandboxError::Privilege(format!(
                "{} is required to create a mount namespace",
                Capability::SysAdmin.name()
            )));
        }

        let mut ctx = NamespaceContext::new(&overlay.target);
        let result = self.execute(&overlay, &mut ctx);
        if let Err(ref e) = result {
            tracing::warn!(
                "mount sequence aborted after {}: {}",
                ctx.completed.map(|s| s.name()).unwrap_or("nothing"),
                e
            );
        }
        result
    }

    fn execute(
        mut self,
        overlay: &OverlaySpec,
        ctx: &mut NamespaceContext,
    ) -> Result<MountSummary, SandboxError> {
        let new_root = overlay.target.clone();

        // 1. Private copy of the mount table. CLONE_FS stops sharing root/cwd
        //    with any thread that might still reference the host root.
        self.step(SequenceStep::Unshare, |k| {
            k.unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_FS)
        })?;
        ctx.complete(SequenceStep::Unshare);

        // 2. Cut propagation back to the host before mounting anything.
        let propagation = self.plan.propagation;
        self.step(SequenceStep::Propagation, |k| {
            k.mount(&MountOperation::propagation("/", propagation.flag(), true))
        })?;
        ctx.propagation = Some(propagation);
        ctx.complete(SequenceStep::Propagation);

        // 3. tmpfs at the fixed work area; unmounting it removes every layer.
        let work_area = self.plan.work_area.clone();
        self.step(SequenceStep::WorkArea, |k| {
            k.create_dir_all(&work_area)?;
            k.mount(&MountOperation::filesystem("tmpfs", &work_area))
        })?;
        ctx.complete(SequenceStep::WorkArea);

        // 4. Overlay of the lower layer at the new root.
        self.checkpoint(SequenceStep::Overlay)?;
        overlay.materialize(&mut *self.kernel)?;
        let overlay_op = overlay.mount_operation();
        tracing::debug!("{}", overlay_op);
        self.step(SequenceStep::Overlay, |k| k.mount(&overlay_op))?;
        ctx.complete(SequenceStep::Overlay);

        // 5. Swap roots; the host root stays reachable under /oldroot.
        let put_old = ctx.old_root.clone();
        self.step(SequenceStep::Pivot, |k| {
            k.create_dir_all(&put_old)?;
            k.pivot_root(&new_root, &put_old)
        })?;
        ctx.current_root = new_root.clone();
        ctx.old_root = Path::new("/").join(OLD_ROOT_DIR);
        ctx.complete(SequenceStep::Pivot);

        // 6. The cwd may still point into the old root.
        self.step(SequenceStep::Chdir, |k| k.chdir(Path::new("/")))?;
        ctx.complete(SequenceStep::Chdir);

        // 7. Live /dev, /proc and /sys; moved, never bind mounted.
        let old_root = ctx.old_root.clone();
        let mode = self.plan.pseudo_filesystems;
        self.step(SequenceStep::PseudoFilesystems, |k| {
            for op in pseudo_filesystem_operations(&old_root, mode) {
                tracing::debug!("{}", op);
                k.mount(&op)?;
            }
            Ok(())
        })?;
        ctx.complete(SequenceStep::PseudoFilesystems);

        // 8. Drop every mount under the old root, then its directory.
        self.step(SequenceStep::DetachOldRoot, |k| {
            k.unmount(&old_root, true)?;
            k.remove_dir(&old_root)
        })?;
        ctx.complete(SequenceStep::DetachOldRoot);

        tracing::info!(
            "sandbox root ready: overlay of {} ({} propagation)",
            overlay.lower.display(),
            format!("{:?}", propagation).to_lowercase()
        );

        Ok(MountSummary {
            work_area: self.plan.work_area.clone(),
            overlay_options: overlay.mount_options(),
        })
    }

    fn checkpoint(&self, step: SequenceStep) -> Result<(), SandboxError> {
        if self.cancel.is_cancelled() {
            return Err(SandboxError::Cancelled(step.name()));
        }
        Ok(())
    }

    fn step<F>(&mut self, step: SequenceStep, f: F) -> Result<(), SandboxError>
    where
        F: FnOnce(&mut K) -> Result<(), OsError>,
    {
        self.checkpoint(step)?;
        f(&mut *self.kernel).map_err(|source| SandboxError::Step {
            step: step.name(),
            source,
        })
    }
}

/// Mount calls that restore `/dev`, `/proc` and `/sys` under the new root.
pub fn pseudo_filesystem_operations(old_root: &Path, mode: PseudoFsMode) -> Vec<MountOperation> {
    PSEUDO_FILESYSTEMS
        .iter()
        .map(|path| {
            let source = old_root.join(path.trim_start_matches('/'));
            match (mode, *path) {
                (PseudoFsMode::Fresh, "/proc") => MountOperation::filesystem("proc", *path),
                (PseudoFsMode::Fresh, "/sys") => MountOperation::filesystem("sysfs", *path),
                _ => MountOperation::move_mount(source, *path),
            }
        })
        .collect()
}
