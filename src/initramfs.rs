//! Generated file content: mkinitcpio.conf, the darch initcpio hooks, and
//! fstab.
//!
//! These are injected into the configuration's file map before diffing and
//! before the manifest is written, so a change in any of them is visible
//! to the diff engine like any other declared file.

use crate::config::{FileEntry, SystemConfig};

/// Paths of the generated files.
pub const MKINITCPIO_CONF: &str = "/etc/mkinitcpio.conf";
pub const HOOK_RUNTIME: &str = "/usr/lib/initcpio/hooks/darch";
pub const HOOK_INSTALL: &str = "/usr/lib/initcpio/install/darch";
pub const FSTAB: &str = "/etc/fstab";

/// mkinitcpio.conf with the declared module and hook order.
pub fn mkinitcpio_conf(modules: &[String], hooks: &[String]) -> String {
    format!(
        "MODULES=({})\nBINARIES=()\nFILES=()\nHOOKS=({})\nCOMPRESSION=\"zstd\"\n",
        modules.join(" "),
        hooks.join(" ")
    )
}

/// The runtime hook: replaces the default mount handler with one that
/// builds a tmpfs root of symlinks into the selected generation.
pub fn darch_runtime_hook() -> &'static str {
    r#"#!/usr/bin/ash
# darch initcpio runtime hook
# Assembles a tmpfs root with symlinks into the selected generation.

run_hook() {
    echo ":: darch: tmpfs root with generation symlinks"
    mount_handler="darch_mount_handler"
}

darch_mount_handler() {
    local newroot="$1"

    local root_uuid="" gen=""
    for param in $(cat /proc/cmdline); do
        case "$param" in
            root=UUID=*)
                root_uuid="${param#root=UUID=}"
                ;;
            darch.gen=*)
                gen="${param#darch.gen=}"
                ;;
        esac
    done

    if [ -z "$root_uuid" ]; then
        echo ":: darch: ERROR - no root UUID on cmdline"
        return 1
    fi
    if [ -z "$gen" ]; then
        echo ":: darch: ERROR - no generation selected (darch.gen=N)"
        return 1
    fi

    local device="/dev/disk/by-uuid/$root_uuid"
    local timeout=10
    while [ ! -b "$device" ] && [ $timeout -gt 0 ]; do
        sleep 1
        timeout=$((timeout - 1))
    done
    if [ ! -b "$device" ]; then
        echo ":: darch: ERROR - $device did not appear"
        return 1
    fi

    mount -t tmpfs -o size=512M,mode=0755 tmpfs "$newroot"

    mkdir -p "$newroot/dev" "$newroot/proc" "$newroot/sys" "$newroot/run" \
        "$newroot/tmp" "$newroot/mnt" "$newroot/efi" "$newroot/images" \
        "$newroot/var" "$newroot/home"
    chmod 1777 "$newroot/tmp"

    mount -t btrfs -o subvol=@images,ro "$device" "$newroot/images"
    mount -t btrfs -o subvol=@var "$device" "$newroot/var"
    mount -t btrfs -o subvol=@home "$device" "$newroot/home"

    if [ ! -d "$newroot/images/gen-$gen" ]; then
        echo ":: darch: ERROR - generation $gen not found"
        return 1
    fi

    # Relative symlinks so they resolve both before and after switch_root.
    ln -s "images/gen-$gen" "$newroot/current"
    ln -s current/usr "$newroot/usr"
    ln -s current/etc "$newroot/etc"
    ln -s current/boot "$newroot/boot"

    ln -s usr/bin "$newroot/bin"
    ln -s usr/lib "$newroot/lib"
    ln -s usr/lib "$newroot/lib64"
    ln -s usr/bin "$newroot/sbin"

    ln -s home/root "$newroot/root"
    ln -s usr/lib/systemd/systemd "$newroot/init"
}
"#
}

/// The install hook: packs the runtime hook into the image.
pub fn darch_install_hook() -> &'static str {
    r#"#!/usr/bin/bash
# darch initcpio install hook

build() {
    add_runscript
}

help() {
    cat <<HELPEOF
darch hook - assembles the tmpfs root from an immutable generation
HELPEOF
}
"#
}

/// fstab for the generated system. The root is tmpfs and the btrfs
/// subvolumes are mounted by the initramfs, so only the ESP appears.
pub fn fstab(esp_uuid: &str) -> String {
    format!(
        "# /etc/fstab: static file system information\n\
         # Root is tmpfs; @images/@var/@home are mounted by the initramfs.\n\
         #\n\
         # <file system>  <mount point>  <type>  <options>  <dump> <pass>\n\
         UUID={esp_uuid}  /efi  vfat  rw,relatime,fmask=0022,dmask=0022,utf8,errors=remount-ro  0 2\n"
    )
}

/// Insert the generated files into `cfg.files`.
pub fn inject(cfg: &mut SystemConfig, esp_uuid: &str) {
    cfg.files.insert(
        MKINITCPIO_CONF.to_string(),
        FileEntry::new(mkinitcpio_conf(
            &cfg.initramfs_modules,
            &cfg.initramfs_hooks,
        )),
    );
    cfg.files.insert(
        HOOK_RUNTIME.to_string(),
        FileEntry::with_mode(darch_runtime_hook(), 0o755),
    );
    cfg.files.insert(
        HOOK_INSTALL.to_string(),
        FileEntry::with_mode(darch_install_hook(), 0o755),
    );
    cfg.files
        .insert(FSTAB.to_string(), FileEntry::new(fstab(esp_uuid)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkinitcpio_preserves_declared_order() {
        let modules = vec!["virtio_blk".to_string(), "btrfs".to_string()];
        let hooks = vec!["base".to_string(), "darch".to_string()];
        let conf = mkinitcpio_conf(&modules, &hooks);

        assert!(conf.contains("MODULES=(virtio_blk btrfs)"));
        assert!(conf.contains("HOOKS=(base darch)"));
        assert!(conf.contains("COMPRESSION=\"zstd\""));
    }

    #[test]
    fn inject_adds_all_generated_files() {
        let mut cfg = SystemConfig::with_defaults("vm");
        inject(&mut cfg, "ABCD-1234");

        assert!(cfg.files.contains_key(MKINITCPIO_CONF));
        assert!(cfg.files.contains_key(HOOK_RUNTIME));
        assert!(cfg.files.contains_key(HOOK_INSTALL));
        assert!(cfg.files.contains_key(FSTAB));

        assert_eq!(cfg.files[HOOK_RUNTIME].mode, Some(0o755));
        assert!(cfg.files[FSTAB].content.contains("UUID=ABCD-1234"));
        assert!(cfg.files[MKINITCPIO_CONF]
            .content
            .contains("block darch filesystems"));
    }

    #[test]
    fn inject_is_deterministic() {
        let mut a = SystemConfig::with_defaults("vm");
        let mut b = SystemConfig::with_defaults("vm");
        inject(&mut a, "ABCD-1234");
        inject(&mut b, "ABCD-1234");
        assert_eq!(a, b);
    }

    #[test]
    fn runtime_hook_parses_generation_parameter() {
        let hook = darch_runtime_hook();
        assert!(hook.contains("darch.gen=*"));
        assert!(hook.contains("subvol=@images,ro"));
        assert!(hook.contains("ln -s \"images/gen-$gen\""));
    }
}
