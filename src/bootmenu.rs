//! Boot menu generation.
//!
//! The GRUB configuration on the ESP lists every complete generation,
//! newest first, each entry loading the kernel and initramfs straight out
//! of the generation's subvolume and passing `darch.gen=N` so the
//! initramfs hook knows which generation to assemble. The file is written
//! to `<cfg>.new` and renamed into place.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use time::OffsetDateTime;

use crate::subvol::Generation;

/// Menu path relative to the ESP root.
pub const GRUB_CFG_RELATIVE: &str = "grub/grub.cfg";

/// Render the menu. `generations` may arrive in any order and may contain
/// incomplete entries; only complete ones are emitted, newest first.
/// `default_gen` selects the default entry (rollback points it at an older
/// generation); when it names no listed generation the newest wins.
pub fn render(root_uuid: &str, generations: &[Generation], default_gen: u32) -> String {
    let mut complete: Vec<&Generation> = generations.iter().filter(|g| g.complete()).collect();
    complete.sort_by(|a, b| b.number.cmp(&a.number));

    let default_index = complete
        .iter()
        .position(|g| g.number == default_gen)
        .unwrap_or(0);

    let mut out = format!(
        "# GRUB configuration generated by darch\n\
         # Kernels are loaded directly from the btrfs generation subvolumes.\n\
         \n\
         set timeout=5\n\
         set default={default_index}\n\
         \n\
         serial --unit=0 --speed=115200\n\
         terminal_input serial console\n\
         terminal_output serial console\n\
         \n\
         insmod btrfs\n\
         search --set=root --fs-uuid {root_uuid}\n"
    );

    for gen in &complete {
        let n = gen.number;
        out.push_str(&format!(
            "\nmenuentry \"Arch Linux (gen-{n}, {created})\" {{\n\
             \x20   linux /@images/gen-{n}/boot/vmlinuz-linux \\\n\
             \x20       root=UUID={root_uuid} \\\n\
             \x20       darch.gen={n} \\\n\
             \x20       console=tty0 console=ttyS0,115200 \\\n\
             \x20       systemd.gpt_auto=0 rw\n\
             \x20   initrd /@images/gen-{n}/boot/initramfs-linux.img\n\
             }}\n",
            created = format_timestamp(gen.created_at),
        ));
    }

    out
}

/// Write the menu under `esp_dir`, atomically.
pub fn write(esp_dir: &Path, content: &str) -> Result<PathBuf> {
    let cfg_path = esp_dir.join(GRUB_CFG_RELATIVE);
    if let Some(parent) = cfg_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let new_path = cfg_path.with_extension("cfg.new");
    std::fs::write(&new_path, content)
        .with_context(|| format!("failed to write {}", new_path.display()))?;
    std::fs::rename(&new_path, &cfg_path)
        .with_context(|| format!("failed to rename {} into place", new_path.display()))?;

    Ok(cfg_path)
}

/// `YYYY-MM-DD HH:MM` for menu labels and generation listings.
pub(crate) fn format_timestamp(at: Option<SystemTime>) -> String {
    match at {
        Some(t) => {
            let dt = OffsetDateTime::from(t);
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}",
                dt.year(),
                dt.month() as u8,
                dt.day(),
                dt.hour(),
                dt.minute()
            )
        }
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn gen(number: u32, complete: bool) -> Generation {
        Generation {
            number,
            path: PathBuf::from(format!("/images/gen-{number}")),
            manifest: complete.then(|| SystemConfig::with_defaults("vm")),
            created_at: complete
                .then(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        }
    }

    #[test]
    fn lists_only_complete_newest_first() {
        let gens = vec![gen(1, true), gen(2, false), gen(3, true)];
        let menu = render("UUID-X", &gens, 3);

        assert!(menu.contains("gen-3"));
        assert!(menu.contains("gen-1"));
        assert!(!menu.contains("darch.gen=2"));

        let pos3 = menu.find("menuentry \"Arch Linux (gen-3").unwrap();
        let pos1 = menu.find("menuentry \"Arch Linux (gen-1").unwrap();
        assert!(pos3 < pos1);
    }

    #[test]
    fn newest_is_default() {
        let gens = vec![gen(1, true), gen(2, true)];
        let menu = render("UUID-X", &gens, 2);
        assert!(menu.contains("set default=0"));
    }

    #[test]
    fn rollback_default_selects_older_entry() {
        let gens = vec![gen(1, true), gen(2, true), gen(3, true)];
        // Entries are ordered 3, 2, 1; gen-2 is index 1.
        let menu = render("UUID-X", &gens, 2);
        assert!(menu.contains("set default=1"));
        assert!(menu.contains("darch.gen=3"));
    }

    #[test]
    fn entries_carry_generation_parameter_and_paths() {
        let gens = vec![gen(5, true)];
        let menu = render("1234-ROOT", &gens, 5);

        assert!(menu.contains("darch.gen=5"));
        assert!(menu.contains("root=UUID=1234-ROOT"));
        assert!(menu.contains("/@images/gen-5/boot/vmlinuz-linux"));
        assert!(menu.contains("/@images/gen-5/boot/initramfs-linux.img"));
        assert!(menu.contains("search --set=root --fs-uuid 1234-ROOT"));
    }

    #[test]
    fn write_is_atomic_and_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "menu-content\n").unwrap();

        assert_eq!(path, tmp.path().join("grub/grub.cfg"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "menu-content\n");
        assert!(!tmp.path().join("grub/grub.cfg.new").exists());
    }

    #[test]
    fn rewrite_replaces_previous_menu() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "first\n").unwrap();
        let path = write(tmp.path(), "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "second\n");
    }
}
