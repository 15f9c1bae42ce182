//! Disk image provisioning.
//!
//! A missing image file is created from scratch: GPT with a 512M ESP and a
//! btrfs partition filling the rest, the three subvolumes (`@images`,
//! `@var`, `@home`), and the seed directories persistent state expects.
//! Access to an image file goes through a loop-device guard that detaches
//! on release.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::mount::Mount;
use crate::process::Cmd;

/// Scratch mount point used while creating subvolumes.
const SETUP_MOUNT: &str = "/mnt/darch-setup";

/// An attached loop device, detached on drop.
pub struct LoopDevice {
    device: String,
    armed: bool,
}

impl LoopDevice {
    /// Attach `image` with partition scanning and wait for the partition
    /// nodes to settle.
    pub fn attach(image: &Path) -> Result<Self> {
        let out = Cmd::new("losetup")
            .args(["-Pf", "--show"])
            .arg_path(image)
            .error_msg(&format!("failed to attach {}", image.display()))
            .run()?;
        let device = out.stdout_trimmed().to_string();

        Cmd::new("udevadm").arg("settle").allow_fail().run()?;

        debug!("attached {} as {device}", image.display());
        Ok(Self {
            device,
            armed: true,
        })
    }

    /// ESP partition node (first partition).
    pub fn esp_partition(&self) -> PathBuf {
        PathBuf::from(format!("{}p1", self.device))
    }

    /// btrfs partition node (second partition).
    pub fn btrfs_partition(&self) -> PathBuf {
        PathBuf::from(format!("{}p2", self.device))
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let _ = Cmd::new("sync").allow_fail().run();
        let _ = Cmd::new("losetup")
            .arg("-d")
            .arg(&self.device)
            .allow_fail()
            .run();
        debug!("detached {}", self.device);
    }
}

/// Attach an existing image, creating and formatting it first if absent.
pub fn ensure_image(image: &Path, size: &str) -> Result<LoopDevice> {
    if image.exists() {
        info!("using existing disk image {}", image.display());
        return LoopDevice::attach(image);
    }

    info!("creating disk image {} ({size})", image.display());
    create_image(image, size)?;
    LoopDevice::attach(image)
}

/// Create, partition, and format a new image file with the subvolume
/// layout.
pub fn create_image(image: &Path, size: &str) -> Result<()> {
    Cmd::new("truncate")
        .args(["-s", size])
        .arg_path(image)
        .error_msg("failed to allocate image file")
        .run()?;

    Cmd::new("sgdisk").arg("-Z").arg_path(image).run()?;
    Cmd::new("sgdisk")
        .args(["-n", "1:0:+512M", "-t", "1:ef00"])
        .arg_path(image)
        .error_msg("failed to create ESP partition")
        .run()?;
    Cmd::new("sgdisk")
        .args(["-n", "2:0:0", "-t", "2:8300"])
        .arg_path(image)
        .error_msg("failed to create btrfs partition")
        .run()?;

    let loop_dev = LoopDevice::attach(image)?;

    Cmd::new("mkfs.fat")
        .arg("-F32")
        .arg_path(&loop_dev.esp_partition())
        .error_msg("failed to format ESP")
        .run()?;
    Cmd::new("mkfs.btrfs")
        .arg("-f")
        .arg_path(&loop_dev.btrfs_partition())
        .error_msg("failed to format btrfs partition")
        .run()?;

    create_subvolumes(&loop_dev.btrfs_partition())?;

    info!("image created");
    Ok(())
}

/// Create `@images`, `@var`, `@home` and the seed directories.
fn create_subvolumes(btrfs_dev: &Path) -> Result<()> {
    let mount = Mount::mount(btrfs_dev, Path::new(SETUP_MOUNT), None)?;
    let root = mount.target();

    for subvol in ["@images", "@var", "@home"] {
        Cmd::new("btrfs")
            .args(["subvolume", "create"])
            .arg_path(&root.join(subvol))
            .error_msg(&format!("failed to create subvolume {subvol}"))
            .run()?;
    }

    let root_home = root.join("@home/root");
    std::fs::create_dir_all(&root_home)
        .with_context(|| format!("failed to create {}", root_home.display()))?;
    set_mode(&root_home, 0o700)?;

    std::fs::create_dir_all(root.join("@var/lib/machines"))
        .context("failed to create @var/lib/machines")?;

    Ok(())
}

/// Filesystem UUID of a block device.
pub fn blkid_uuid(device: &Path) -> Result<String> {
    let out = Cmd::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .arg_path(device)
        .error_msg(&format!("failed to read UUID of {}", device.display()))
        .run()?;
    let uuid = out.stdout_trimmed().to_string();
    if uuid.is_empty() {
        anyhow::bail!("{} has no filesystem UUID", device.display());
    }
    Ok(uuid)
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_nodes_derive_from_device() {
        let dev = LoopDevice {
            device: "/dev/loop7".to_string(),
            armed: false,
        };
        assert_eq!(dev.esp_partition(), PathBuf::from("/dev/loop7p1"));
        assert_eq!(dev.btrfs_partition(), PathBuf::from("/dev/loop7p2"));
    }

    #[test]
    fn set_mode_applies() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, "x").unwrap();
        set_mode(&file, 0o600).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
