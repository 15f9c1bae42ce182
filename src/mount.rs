//! Scoped mounts, bind mounts, and chroot preparation.
//!
//! Every mount taken during a build is owned by a guard that unmounts on
//! drop, so any exit path (success, error, panic unwind) leaves no mount
//! behind. A failed unmount during teardown is logged and never masks the
//! error that started the unwind. Teardown is strictly LIFO.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::process::Cmd;

/// A single mounted filesystem, unmounted on drop.
pub struct Mount {
    target: PathBuf,
    armed: bool,
}

impl Mount {
    /// Mount `device` at `target` with optional `-o` options.
    pub fn mount(device: &Path, target: &Path, options: Option<&str>) -> Result<Self> {
        Self::do_mount(device, target, options, false)
    }

    /// Bind-mount `source` at `target`.
    pub fn bind(source: &Path, target: &Path) -> Result<Self> {
        Self::do_mount(source, target, None, true)
    }

    /// Mount a named btrfs subvolume of `device` at `target`.
    pub fn subvol(device: &Path, target: &Path, subvol: &str) -> Result<Self> {
        Self::do_mount(device, target, Some(&format!("subvol={subvol}")), false)
    }

    fn do_mount(device: &Path, target: &Path, options: Option<&str>, bind: bool) -> Result<Self> {
        std::fs::create_dir_all(target)
            .with_context(|| format!("failed to create mount point {}", target.display()))?;

        // A crashed earlier run may have left this target mounted.
        let _ = Cmd::new("umount").arg_path(target).allow_fail().run();

        let mut cmd = Cmd::new("mount");
        if bind {
            cmd = cmd.arg("--bind");
        }
        if let Some(opts) = options {
            cmd = cmd.args(["-o", opts]);
        }
        cmd.arg_path(device)
            .arg_path(target)
            .error_msg(&format!("failed to mount {}", target.display()))
            .run()?;

        debug!("mounted {}", target.display());
        Ok(Self {
            target: target.to_path_buf(),
            armed: true,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        // Flush pending writes before unmounting.
        let _ = Cmd::new("sync").allow_fail().run();
        match Cmd::new("umount").arg_path(&self.target).allow_fail().run() {
            Ok(out) if out.success() => debug!("unmounted {}", self.target.display()),
            Ok(out) => warn!(
                "failed to unmount {}: {}",
                self.target.display(),
                out.stderr.trim()
            ),
            Err(err) => warn!("failed to unmount {}: {err:#}", self.target.display()),
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.release();
    }
}

/// An ordered set of mounts released in reverse order of acquisition.
/// A failed release does not stop the remaining releases.
#[derive(Default)]
pub struct MountStack {
    mounts: Vec<Mount>,
}

impl MountStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mount: Mount) {
        self.mounts.push(mount);
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl Drop for MountStack {
    fn drop(&mut self) {
        while let Some(mut mount) = self.mounts.pop() {
            mount.release();
        }
    }
}

/// Host package cache shared into every build.
pub const HOST_PKG_CACHE: &str = "/var/cache/pacman/pkg";

/// API filesystems and the package cache bound into a chroot, torn down
/// LIFO when dropped.
pub struct ChrootEnv {
    root: PathBuf,
    _mounts: MountStack,
}

impl ChrootEnv {
    /// Bind `/dev`, `/proc`, `/sys`, `/run` and the host package cache
    /// into `root`.
    pub fn prepare(root: &Path) -> Result<Self> {
        let mut mounts = MountStack::new();

        for dir in ["dev", "proc", "sys", "run"] {
            let source = Path::new("/").join(dir);
            let target = root.join(dir);
            mounts.push(
                Mount::bind(&source, &target)
                    .with_context(|| format!("failed to prepare chroot bind /{dir}"))?,
            );
        }

        let cache_target = root.join("var/cache/pacman/pkg");
        std::fs::create_dir_all(&cache_target)
            .with_context(|| format!("failed to create {}", cache_target.display()))?;
        mounts.push(
            Mount::bind(Path::new(HOST_PKG_CACHE), &cache_target)
                .context("failed to bind host package cache")?,
        );

        Ok(Self {
            root: root.to_path_buf(),
            _mounts: mounts,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // Mounting needs root and real devices; what is testable here is the
    // teardown ordering contract of the stack.
    struct Probe {
        order: Rc<RefCell<Vec<u32>>>,
        id: u32,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.order.borrow_mut().push(self.id);
        }
    }

    #[test]
    fn vec_pop_releases_lifo() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut stack = Vec::new();
        for id in 0..3 {
            stack.push(Probe {
                order: Rc::clone(&order),
                id,
            });
        }
        while let Some(probe) = stack.pop() {
            drop(probe);
        }
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn mount_stack_starts_empty() {
        let stack = MountStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);
    }
}
