//! Structural delta between two configurations.
//!
//! The diff drives incremental builds: which packages to install/remove,
//! which files and symlinks to write or delete, which services to flip,
//! whether the initramfs must be regenerated, and whether identity state
//! (hostname, timezone, locale, user) changed. The builder applies
//! removals before additions so a removed symlink can never shadow a new
//! regular file at the same path.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{FileEntry, SystemConfig};

/// Everything an incremental build has to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    pub packages_to_add: BTreeSet<String>,
    pub packages_to_remove: BTreeSet<String>,
    pub files_to_write: BTreeMap<String, FileEntry>,
    pub files_to_delete: BTreeSet<String>,
    pub symlinks_to_create: BTreeMap<String, String>,
    pub symlinks_to_delete: BTreeSet<String>,
    pub services_to_enable: BTreeSet<String>,
    pub services_to_disable: BTreeSet<String>,
    pub needs_initramfs: bool,
    pub identity_changed: bool,
}

impl ConfigDiff {
    /// Delta from `old` to `new`. With `old = None` (fresh build) every
    /// declared item lands on the "add" side.
    pub fn compute(old: Option<&SystemConfig>, new: &SystemConfig) -> Self {
        let mut diff = Self::default();

        let empty = SystemConfig::default();
        let old_ref = old.unwrap_or(&empty);

        for pkg in new.packages.difference(&old_ref.packages) {
            diff.packages_to_add.insert(pkg.clone());
        }
        for pkg in old_ref.packages.difference(&new.packages) {
            diff.packages_to_remove.insert(pkg.clone());
        }

        for (path, entry) in &new.files {
            if old_ref.files.get(path) != Some(entry) {
                diff.files_to_write.insert(path.clone(), entry.clone());
            }
        }
        for path in old_ref.files.keys() {
            if !new.files.contains_key(path) {
                diff.files_to_delete.insert(path.clone());
            }
        }

        for (path, target) in &new.symlinks {
            if old_ref.symlinks.get(path) != Some(target) {
                diff.symlinks_to_create.insert(path.clone(), target.clone());
            }
        }
        for path in old_ref.symlinks.keys() {
            if !new.symlinks.contains_key(path) {
                diff.symlinks_to_delete.insert(path.clone());
            }
        }

        for unit in new.services.difference(&old_ref.services) {
            diff.services_to_enable.insert(unit.clone());
        }
        for unit in old_ref.services.difference(&new.services) {
            diff.services_to_disable.insert(unit.clone());
        }

        diff.needs_initramfs = new.initramfs_modules != old_ref.initramfs_modules
            || new.initramfs_hooks != old_ref.initramfs_hooks
            || diff.files_to_write.keys().any(|p| touches_initramfs(p))
            || diff.files_to_delete.iter().any(|p| touches_initramfs(p));

        diff.identity_changed = new.hostname != old_ref.hostname
            || new.timezone != old_ref.timezone
            || new.locale != old_ref.locale
            || new.user != old_ref.user;

        diff
    }

    pub fn has_changes(&self) -> bool {
        !self.packages_to_add.is_empty()
            || !self.packages_to_remove.is_empty()
            || !self.files_to_write.is_empty()
            || !self.files_to_delete.is_empty()
            || !self.symlinks_to_create.is_empty()
            || !self.symlinks_to_delete.is_empty()
            || !self.services_to_enable.is_empty()
            || !self.services_to_disable.is_empty()
            || self.needs_initramfs
            || self.identity_changed
    }

    /// One-line summary for the apply log.
    pub fn summary(&self) -> String {
        format!(
            "+{} -{} packages, {} file writes, {} file deletes, +{} -{} services",
            self.packages_to_add.len(),
            self.packages_to_remove.len(),
            self.files_to_write.len() + self.symlinks_to_create.len(),
            self.files_to_delete.len() + self.symlinks_to_delete.len(),
            self.services_to_enable.len(),
            self.services_to_disable.len(),
        )
    }
}

/// Paths whose change forces an initramfs rebuild. Kernel package updates
/// are covered by pacman's own hooks, so only builder-owned inputs count.
fn touches_initramfs(path: &str) -> bool {
    path == "/etc/mkinitcpio.conf"
        || path.starts_with("/usr/lib/initcpio/")
        || path.starts_with("/boot/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileEntry;

    fn base() -> SystemConfig {
        let mut cfg = SystemConfig::with_defaults("vm");
        cfg.packages.insert("vim".into());
        cfg.files
            .insert("/etc/motd".into(), FileEntry::new("hello\n"));
        cfg.symlinks
            .insert("/etc/foo".into(), "/usr/share/foo".into());
        cfg.services.insert("sshd.service".into());
        cfg.hostname = Some("vm".into());
        cfg
    }

    #[test]
    fn identical_configs_have_no_changes() {
        let cfg = base();
        let diff = ConfigDiff::compute(Some(&cfg), &cfg);
        assert!(!diff.has_changes());
        assert!(!diff.needs_initramfs);
        assert!(!diff.identity_changed);
    }

    #[test]
    fn package_add_and_remove() {
        let old = base();
        let mut new = base();
        new.packages.remove("vim");
        new.packages.insert("htop".into());

        let diff = ConfigDiff::compute(Some(&old), &new);
        assert_eq!(
            diff.packages_to_add,
            BTreeSet::from(["htop".to_string()])
        );
        assert_eq!(
            diff.packages_to_remove,
            BTreeSet::from(["vim".to_string()])
        );
        assert!(diff.has_changes());
    }

    #[test]
    fn fresh_diff_includes_everything() {
        let cfg = base();
        let diff = ConfigDiff::compute(None, &cfg);

        assert_eq!(diff.packages_to_add, cfg.packages);
        assert!(diff.packages_to_remove.is_empty());
        assert_eq!(diff.files_to_write.len(), cfg.files.len());
        assert_eq!(diff.symlinks_to_create.len(), cfg.symlinks.len());
        assert_eq!(diff.services_to_enable, cfg.services);
        // The defaults differ from an empty baseline.
        assert!(diff.needs_initramfs);
        assert!(diff.identity_changed);
    }

    #[test]
    fn changed_content_rewrites_file() {
        let old = base();
        let mut new = base();
        new.files
            .insert("/etc/motd".into(), FileEntry::new("changed\n"));

        let diff = ConfigDiff::compute(Some(&old), &new);
        assert_eq!(diff.files_to_write.len(), 1);
        assert!(diff.files_to_write.contains_key("/etc/motd"));
        assert!(diff.files_to_delete.is_empty());
    }

    #[test]
    fn changed_mode_rewrites_file() {
        let old = base();
        let mut new = base();
        new.files
            .insert("/etc/motd".into(), FileEntry::with_mode("hello\n", 0o600));

        let diff = ConfigDiff::compute(Some(&old), &new);
        assert!(diff.files_to_write.contains_key("/etc/motd"));
    }

    #[test]
    fn removed_file_and_symlink_are_deleted() {
        let old = base();
        let mut new = base();
        new.files.remove("/etc/motd");
        new.symlinks.remove("/etc/foo");

        let diff = ConfigDiff::compute(Some(&old), &new);
        assert!(diff.files_to_delete.contains("/etc/motd"));
        assert!(diff.symlinks_to_delete.contains("/etc/foo"));
        assert!(diff.files_to_write.is_empty());
        assert!(diff.symlinks_to_create.is_empty());
    }

    #[test]
    fn service_flip() {
        let old = base();
        let mut new = base();
        new.services.remove("sshd.service");
        new.services.insert("chronyd.service".into());

        let diff = ConfigDiff::compute(Some(&old), &new);
        assert!(diff.services_to_enable.contains("chronyd.service"));
        assert!(diff.services_to_disable.contains("sshd.service"));
    }

    #[test]
    fn initramfs_triggers() {
        let old = base();

        let mut new = base();
        new.initramfs_modules.push("nvme".into());
        assert!(ConfigDiff::compute(Some(&old), &new).needs_initramfs);

        let mut new = base();
        new.files.insert(
            "/etc/mkinitcpio.conf".into(),
            FileEntry::new("MODULES=()\n"),
        );
        assert!(ConfigDiff::compute(Some(&old), &new).needs_initramfs);

        let mut new = base();
        new.files.insert(
            "/usr/lib/initcpio/hooks/darch".into(),
            FileEntry::new("x"),
        );
        assert!(ConfigDiff::compute(Some(&old), &new).needs_initramfs);

        let mut new = base();
        new.files
            .insert("/boot/extra.img".into(), FileEntry::new("x"));
        assert!(ConfigDiff::compute(Some(&old), &new).needs_initramfs);

        // An unrelated file change must not trigger a rebuild.
        let mut new = base();
        new.files.insert("/etc/motd".into(), FileEntry::new("x"));
        assert!(!ConfigDiff::compute(Some(&old), &new).needs_initramfs);
    }

    #[test]
    fn identity_triggers() {
        let old = base();

        let mut new = base();
        new.hostname = Some("renamed".into());
        assert!(ConfigDiff::compute(Some(&old), &new).identity_changed);

        let mut new = base();
        new.timezone = Some("UTC".into());
        assert!(ConfigDiff::compute(Some(&old), &new).identity_changed);

        let mut new = base();
        new.user = Some(crate::config::UserSpec {
            name: "alice".into(),
            shell: "/bin/bash".into(),
            groups: BTreeSet::new(),
            uid: None,
        });
        assert!(ConfigDiff::compute(Some(&old), &new).identity_changed);
    }
}
