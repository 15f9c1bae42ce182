//! Declarative system configuration.
//!
//! [`SystemConfig`] is both the build input and, serialized, the manifest
//! persisted as `config.json` at a generation's root. All collections are
//! B-tree based so iteration order, serialization, and argv materialization
//! are deterministic without explicit sorting at the call sites.

pub mod lua;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Packages installed when a configuration declares none.
pub const DEFAULT_PACKAGES: &[&str] = &[
    "base",
    "linux",
    "btrfs-progs",
    "grub",
    "efibootmgr",
    "pacman-contrib",
];

/// Initramfs modules installed when a configuration declares none.
pub const DEFAULT_INITRAMFS_MODULES: &[&str] = &[
    "btrfs",
    "ata_piix",
    "ahci",
    "sd_mod",
    "virtio_blk",
    "virtio_pci",
];

/// Initramfs hook order used when a configuration declares none. The
/// `darch` hook assembles the tmpfs root at boot and must run after block
/// device setup and before filesystem mounts.
pub const DEFAULT_INITRAMFS_HOOKS: &[&str] = &[
    "base",
    "udev",
    "autodetect",
    "microcode",
    "modconf",
    "block",
    "darch",
    "filesystems",
    "fsck",
];

/// A declared regular file: UTF-8 content and an optional mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    pub content: String,
    #[serde(default)]
    pub mode: Option<u32>,
}

impl FileEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            mode: None,
        }
    }

    pub fn with_mode(content: impl Into<String>, mode: u32) -> Self {
        Self {
            content: content.into(),
            mode: Some(mode),
        }
    }
}

/// Declarative user account, written into a generation's `/etc` at build
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    pub name: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub uid: Option<u32>,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl UserSpec {
    /// Effective uid; also used as the primary gid.
    pub fn uid(&self) -> u32 {
        self.uid.unwrap_or(1000)
    }
}

/// The full declarative configuration of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Machine identifier; the hostname default.
    pub name: String,

    /// Package set, serialized sorted.
    #[serde(default)]
    pub packages: BTreeSet<String>,

    /// Absolute path -> file content and mode.
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,

    /// Absolute path -> symlink target.
    #[serde(default)]
    pub symlinks: BTreeMap<String, String>,

    /// systemd units to enable, normalized with a unit suffix.
    #[serde(default)]
    pub services: BTreeSet<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub locale: Option<String>,

    #[serde(default)]
    pub user: Option<UserSpec>,

    /// Kernel modules for the initramfs, in declaration order.
    #[serde(default)]
    pub initramfs_modules: Vec<String>,

    /// Initcpio hook order.
    #[serde(default)]
    pub initramfs_hooks: Vec<String>,
}

impl SystemConfig {
    /// A configuration with the stock package set, initramfs modules, and
    /// hook order filled in.
    pub fn with_defaults(name: &str) -> Self {
        let mut cfg = Self {
            name: name.to_string(),
            ..Self::default()
        };
        cfg.packages = DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect();
        cfg.initramfs_modules = DEFAULT_INITRAMFS_MODULES
            .iter()
            .map(|s| s.to_string())
            .collect();
        cfg.initramfs_hooks = DEFAULT_INITRAMFS_HOOKS
            .iter()
            .map(|s| s.to_string())
            .collect();
        cfg
    }

    /// Hostname to materialize: the explicit one, or the machine name.
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }

    /// Package list in the deterministic order passed to external tools.
    pub fn sorted_packages(&self) -> Vec<&str> {
        self.packages.iter().map(String::as_str).collect()
    }
}

/// Normalize a service name: bare names get a `.service` suffix, names
/// that already carry a unit suffix are kept as-is.
pub fn normalize_service_name(name: &str) -> String {
    const UNIT_SUFFIXES: &[&str] = &[".service", ".socket", ".timer", ".path", ".mount"];
    if UNIT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}
