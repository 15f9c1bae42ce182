//! Generation construction.
//!
//! Two modes: a fresh build bootstraps a generation from nothing with
//! pacstrap; an incremental build snapshots the predecessor and applies
//! the configuration diff. In both modes the atomic `config.json` write is
//! the final mutation, so everything before it can crash and leave only an
//! incomplete generation for the next garbage collection.

pub mod files;
pub mod users;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{FileEntry, SystemConfig};
use crate::diff::ConfigDiff;
use crate::manifest;
use crate::mount::{ChrootEnv, Mount, HOST_PKG_CACHE};
use crate::process::{chroot_run, chroot_run_interactive, Cmd};

/// Paths and identifiers a build operates with.
pub struct BuildContext {
    /// Where the new generation subvolume is mounted.
    pub mount_root: PathBuf,
    /// Where the ESP is mounted (`<mount_root>/efi`).
    pub efi_mount: PathBuf,
    /// The btrfs partition device.
    pub btrfs_dev: PathBuf,
    pub root_uuid: String,
    pub esp_uuid: String,
    /// Generation number being built.
    pub gen: u32,
    /// Run a full package upgrade during an incremental build.
    pub upgrade: bool,
}

/// Bootstrap a brand new generation.
pub fn build_fresh(cfg: &SystemConfig, ctx: &BuildContext) -> Result<()> {
    let root = ctx.mount_root.as_path();

    println!("=== Installing base system (pacstrap) ===");
    let cache_dir = root.join("var/cache/pacman/pkg");
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;
    {
        let _cache = Mount::bind(Path::new(HOST_PKG_CACHE), &cache_dir)
            .context("failed to bind host package cache for pacstrap")?;
        Cmd::new("pacstrap")
            .arg("-K")
            .arg_path(root)
            .args(cfg.sorted_packages())
            .error_msg("pacstrap failed")
            .run_interactive()?;
    }

    println!("=== Relocating pacman state ===");
    relocate_pacman_state(root)?;

    files::force_symlink(&root.join("current"), ".")?;

    // /var becomes the @var mount point; the bootstrap content is dropped.
    let var_dir = root.join("var");
    if var_dir.exists() {
        std::fs::remove_dir_all(&var_dir)
            .with_context(|| format!("failed to remove {}", var_dir.display()))?;
    }
    std::fs::create_dir(&var_dir)
        .with_context(|| format!("failed to create {}", var_dir.display()))?;

    let _var = Mount::subvol(&ctx.btrfs_dev, &var_dir, "@var")?;
    setup_var_pacman_symlink(&var_dir)?;

    println!("=== Applying configuration ===");
    apply_identity_files(root, cfg)?;
    for (path, entry) in &cfg.files {
        files::write_file(root, path, entry)?;
    }
    for (path, target) in &cfg.symlinks {
        files::write_symlink(root, path, target)?;
    }
    for unit in &cfg.services {
        files::enable_service(root, unit)?;
    }

    println!("=== Configuring system (chroot) ===");
    {
        let _chroot = ChrootEnv::prepare(root)?;
        run_identity_commands(root)?;
        chroot_run(root, ["mkinitcpio", "-P"])
            .context("initramfs generation failed in chroot")?;
        chroot_run(
            root,
            [
                "grub-install",
                "--target=x86_64-efi",
                "--efi-directory=/efi",
                "--boot-directory=/efi",
                "--bootloader-id=GRUB",
                "--removable",
            ],
        )
        .context("boot loader installation failed in chroot")?;
    }

    write_tmpfiles_overrides(root)?;
    fixup_etc_links(root)?;

    if let Some(user) = &cfg.user {
        println!("=== Configuring user: {} ===", user.name);
        let home_dir = root.join("home");
        std::fs::create_dir_all(&home_dir)?;
        let _home = Mount::subvol(&ctx.btrfs_dev, &home_dir, "@home")?;
        users::apply_user(root, user, Some(&home_dir))?;
    }

    println!("=== Finalizing gen-{} ===", ctx.gen);
    manifest::write_atomic(root, cfg)?;
    Ok(())
}

/// Mutate a snapshot of the predecessor according to the diff. The caller
/// has already parked the inherited completion marker.
pub fn build_incremental(cfg: &SystemConfig, diff: &ConfigDiff, ctx: &BuildContext) -> Result<()> {
    let root = ctx.mount_root.as_path();
    info!("incremental build: {}", diff.summary());

    // pacman reaches its database through /var/lib/pacman ->
    // ../../../current/pacman, so @var must be mounted first.
    let _var = Mount::subvol(&ctx.btrfs_dev, &root.join("var"), "@var")?;

    // Removals precede additions so a dropped symlink can never shadow a
    // new regular file at the same path.
    for path in &diff.symlinks_to_delete {
        files::remove_entry(root, path)?;
    }
    for path in &diff.files_to_delete {
        files::remove_entry(root, path)?;
    }
    for unit in &diff.services_to_disable {
        files::disable_service(root, unit)?;
    }

    let needs_chroot = !diff.packages_to_remove.is_empty()
        || !diff.packages_to_add.is_empty()
        || ctx.upgrade
        || diff.identity_changed
        || diff.needs_initramfs;

    let chroot_env = if needs_chroot {
        Some(ChrootEnv::prepare(root)?)
    } else {
        None
    };

    if !diff.packages_to_remove.is_empty() {
        println!("=== Removing packages ===");
        let mut args = vec!["pacman", "-Rns", "--noconfirm"];
        args.extend(diff.packages_to_remove.iter().map(String::as_str));
        chroot_run_interactive(root, args).context("package removal failed")?;
    }

    if !diff.packages_to_add.is_empty() {
        println!("=== Installing packages ===");
        let mut args = vec!["pacman", "-S", "--noconfirm"];
        args.extend(diff.packages_to_add.iter().map(String::as_str));
        chroot_run_interactive(root, args).context("package installation failed")?;
    }

    if ctx.upgrade {
        println!("=== Upgrading packages ===");
        chroot_run_interactive(root, ["pacman", "-Syu", "--noconfirm"])
            .context("package upgrade failed")?;
    }

    if diff.identity_changed {
        println!("=== Applying identity changes ===");
        apply_identity_files(root, cfg)?;
        run_identity_commands(root)?;
        if let Some(user) = &cfg.user {
            let home_dir = root.join("home");
            std::fs::create_dir_all(&home_dir)?;
            let _home = Mount::subvol(&ctx.btrfs_dev, &home_dir, "@home")?;
            users::apply_user(root, user, Some(&home_dir))?;
        }
    }

    if !diff.files_to_write.is_empty() || !diff.symlinks_to_create.is_empty() {
        println!("=== Applying file changes ===");
        for (path, entry) in &diff.files_to_write {
            files::write_file(root, path, entry)?;
        }
        for (path, target) in &diff.symlinks_to_create {
            files::write_symlink(root, path, target)?;
        }
    }
    for unit in &diff.services_to_enable {
        files::enable_service(root, unit)?;
    }

    if diff.needs_initramfs {
        println!("=== Regenerating initramfs ===");
        chroot_run(root, ["mkinitcpio", "-P"])
            .context("initramfs regeneration failed in chroot")?;
    }

    drop(chroot_env);

    let prev = root.join(manifest::CONFIG_JSON_PREV);
    if prev.exists() {
        std::fs::remove_file(&prev)
            .with_context(|| format!("failed to remove {}", prev.display()))?;
    }

    println!("=== Finalizing gen-{} ===", ctx.gen);
    manifest::write_atomic(root, cfg)?;
    Ok(())
}

/// Move the pacman database out of /var so it lives inside the immutable
/// generation. The runtime path is restored by a symlink in @var.
pub(crate) fn relocate_pacman_state(root: &Path) -> Result<()> {
    let src = root.join("var/lib/pacman");
    let dst = root.join("pacman");
    if !src.exists() {
        return Ok(());
    }
    std::fs::rename(&src, &dst).with_context(|| {
        format!("failed to move {} to {}", src.display(), dst.display())
    })?;
    Ok(())
}

/// `/var/lib/pacman -> ../../../current/pacman`: three levels up leaves
/// the @var mount and reaches the tmpfs root, `/current` follows into the
/// active generation (at build time `current -> .`), `/pacman` is the
/// relocated state. The link depends on /var sitting exactly three levels
/// deep, which the filesystem hierarchy guarantees.
pub(crate) fn setup_var_pacman_symlink(var_dir: &Path) -> Result<()> {
    let lib = var_dir.join("lib");
    std::fs::create_dir_all(&lib)
        .with_context(|| format!("failed to create {}", lib.display()))?;
    files::force_symlink(&lib.join("pacman"), "../../../current/pacman")
}

/// Identity state lowered to files: hostname, hosts, timezone, locale.
pub(crate) fn apply_identity_files(root: &Path, cfg: &SystemConfig) -> Result<()> {
    let hostname = cfg.effective_hostname();
    files::write_file(root, "/etc/hostname", &FileEntry::new(format!("{hostname}\n")))?;
    files::write_file(root, "/etc/hosts", &FileEntry::new(hosts_content(hostname)))?;

    if let Some(tz) = &cfg.timezone {
        files::write_symlink(root, "/etc/localtime", &format!("/usr/share/zoneinfo/{tz}"))?;
    }

    if let Some(locale) = &cfg.locale {
        files::write_file(
            root,
            "/etc/locale.gen",
            &FileEntry::new(format!("{locale} UTF-8\n")),
        )?;
        files::write_file(
            root,
            "/etc/locale.conf",
            &FileEntry::new(format!("LANG={locale}\n")),
        )?;
    }
    Ok(())
}

pub(crate) fn hosts_content(hostname: &str) -> String {
    format!(
        "127.0.0.1   localhost\n\
         ::1         localhost\n\
         127.0.1.1   {hostname}.localdomain {hostname}\n"
    )
}

/// Chroot commands for identity state. The caller holds a [`ChrootEnv`].
fn run_identity_commands(root: &Path) -> Result<()> {
    chroot_run(root, ["hwclock", "--systohc"]).context("hwclock failed in chroot")?;
    chroot_run(root, ["locale-gen"]).context("locale-gen failed in chroot")?;
    chroot_run(root, ["passwd", "-d", "root"]).context("passwd policy failed in chroot")?;
    Ok(())
}

/// tmpfiles.d overrides for the symlink-root layout: /etc/mtab must not be
/// force-recreated, and /root is a symlink rather than a directory.
pub(crate) fn write_tmpfiles_overrides(root: &Path) -> Result<()> {
    let overrides_dir = root.join("etc/tmpfiles.d");
    std::fs::create_dir_all(&overrides_dir)
        .with_context(|| format!("failed to create {}", overrides_dir.display()))?;

    let etc_conf = root.join("usr/lib/tmpfiles.d/etc.conf");
    if etc_conf.exists() {
        let content = std::fs::read_to_string(&etc_conf)?;
        std::fs::write(overrides_dir.join("etc.conf"), relax_mtab_line(&content))?;
    }

    let provision_conf = root.join("usr/lib/tmpfiles.d/provision.conf");
    if provision_conf.exists() {
        let content = std::fs::read_to_string(&provision_conf)?;
        std::fs::write(
            overrides_dir.join("provision.conf"),
            strip_root_entries(&content),
        )?;
    }
    Ok(())
}

/// `L+ /etc/mtab` would replace our symlink on every boot; downgrade it.
pub(crate) fn relax_mtab_line(content: &str) -> String {
    content.replace("L+ /etc/mtab", "L /etc/mtab")
}

/// Drop d/f entries for /root; the tmpfs root symlinks it into @home.
pub(crate) fn strip_root_entries(content: &str) -> String {
    let mut out: String = content
        .lines()
        .filter(|line| {
            let mut fields = line.split_whitespace();
            let kind = fields.next().unwrap_or("");
            let path = fields.next().unwrap_or("");
            let targets_root = path == "/root" || path.starts_with("/root/");
            !(targets_root && (kind.starts_with('d') || kind.starts_with('f')))
        })
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// resolv.conf and mtab point at their runtime-managed locations.
fn fixup_etc_links(root: &Path) -> Result<()> {
    files::write_symlink(
        root,
        "/etc/resolv.conf",
        "/run/systemd/resolve/stub-resolv.conf",
    )?;
    files::write_symlink(root, "/etc/mtab", "/proc/mounts")?;

    let machines = root.join("var/lib/machines");
    if machines.exists() {
        crate::image::set_mode(&machines, 0o755)?;
    }
    Ok(())
}
