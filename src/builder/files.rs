//! Applying declared files, symlinks, and service enablement to a
//! generation root.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::FileEntry;
use crate::image::set_mode;

/// Resolve an absolute declared path inside the generation root.
pub fn resolve(root: &Path, abs_path: &str) -> Result<PathBuf> {
    let Some(rel) = abs_path.strip_prefix('/') else {
        bail!("declared path must be absolute: {abs_path}");
    };
    Ok(root.join(rel))
}

/// Write a declared file, replacing whatever is at the path.
pub fn write_file(root: &Path, abs_path: &str, entry: &FileEntry) -> Result<()> {
    let path = resolve(root, abs_path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    remove_existing(&path)?;
    std::fs::write(&path, &entry.content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    if let Some(mode) = entry.mode {
        set_mode(&path, mode)?;
    }
    Ok(())
}

/// Create a declared symlink, replacing whatever is at the path. A
/// directory symlink must be unlinked (not recursed into), so removal
/// checks the symlink itself first.
pub fn write_symlink(root: &Path, abs_path: &str, target: &str) -> Result<()> {
    let path = resolve(root, abs_path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    remove_existing(&path)?;
    std::os::unix::fs::symlink(target, &path)
        .with_context(|| format!("failed to symlink {} -> {target}", path.display()))?;
    Ok(())
}

/// Delete a declared file or symlink if present.
pub fn remove_entry(root: &Path, abs_path: &str) -> Result<()> {
    let path = resolve(root, abs_path)?;
    remove_existing(&path)
}

fn remove_existing(path: &Path) -> Result<()> {
    if path.is_symlink() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove symlink {}", path.display()))?;
    } else if path.is_dir() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))?;
    } else if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Force-create a symlink at an already-resolved path.
pub fn force_symlink(path: &Path, target: &str) -> Result<()> {
    if path.is_symlink() || path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("failed to symlink {} -> {target}", path.display()))?;
    Ok(())
}

/// Where a unit's enablement symlink lives.
pub fn service_wants_path(unit: &str) -> String {
    format!("/etc/systemd/system/multi-user.target.wants/{unit}")
}

/// Enable a systemd unit by symlinking it into multi-user.target.wants.
pub fn enable_service(root: &Path, unit: &str) -> Result<()> {
    write_symlink(
        root,
        &service_wants_path(unit),
        &format!("/usr/lib/systemd/system/{unit}"),
    )
}

/// Remove a unit's enablement symlink.
pub fn disable_service(root: &Path, unit: &str) -> Result<()> {
    remove_entry(root, &service_wants_path(unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn write_file_creates_parents_and_mode() {
        let tmp = TempDir::new().unwrap();
        let entry = FileEntry::with_mode("#!/bin/sh\n", 0o755);

        write_file(tmp.path(), "/usr/local/bin/x", &entry).unwrap();

        let path = tmp.path().join("usr/local/bin/x");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "#!/bin/sh\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn write_file_replaces_symlink() {
        let tmp = TempDir::new().unwrap();
        write_symlink(tmp.path(), "/etc/motd", "/somewhere").unwrap();
        write_file(tmp.path(), "/etc/motd", &FileEntry::new("real\n")).unwrap();

        let path = tmp.path().join("etc/motd");
        assert!(!path.is_symlink());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "real\n");
    }

    #[test]
    fn write_symlink_replaces_existing_target() {
        let tmp = TempDir::new().unwrap();
        write_symlink(tmp.path(), "/etc/foo", "/old").unwrap();
        write_symlink(tmp.path(), "/etc/foo", "/new").unwrap();

        let target = std::fs::read_link(tmp.path().join("etc/foo")).unwrap();
        assert_eq!(target.to_str().unwrap(), "/new");
    }

    #[test]
    fn write_symlink_replaces_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc/foo")).unwrap();
        write_symlink(tmp.path(), "/etc/foo", "/usr/share/foo").unwrap();
        assert!(tmp.path().join("etc/foo").is_symlink());
    }

    #[test]
    fn remove_entry_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "/etc/x", &FileEntry::new("x")).unwrap();

        remove_entry(tmp.path(), "/etc/x").unwrap();
        assert!(!tmp.path().join("etc/x").exists());
        remove_entry(tmp.path(), "/etc/x").unwrap();
    }

    #[test]
    fn remove_entry_unlinks_dangling_symlink() {
        let tmp = TempDir::new().unwrap();
        write_symlink(tmp.path(), "/etc/dangling", "/nonexistent").unwrap();
        remove_entry(tmp.path(), "/etc/dangling").unwrap();
        assert!(!tmp.path().join("etc/dangling").is_symlink());
    }

    #[test]
    fn relative_paths_are_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(write_file(tmp.path(), "etc/x", &FileEntry::new("x")).is_err());
    }

    #[test]
    fn service_enable_disable() {
        let tmp = TempDir::new().unwrap();

        enable_service(tmp.path(), "sshd.service").unwrap();
        let link = tmp
            .path()
            .join("etc/systemd/system/multi-user.target.wants/sshd.service");
        assert!(link.is_symlink());
        assert_eq!(
            std::fs::read_link(&link).unwrap().to_str().unwrap(),
            "/usr/lib/systemd/system/sshd.service"
        );

        disable_service(tmp.path(), "sshd.service").unwrap();
        assert!(!link.is_symlink());
    }
}
