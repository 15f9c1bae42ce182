//! Host tool validation before a build touches the disk.
//!
//! A missing tool halfway through a build would leave an orphaned
//! generation for no good reason; checking upfront turns that into a
//! clean refusal.

use anyhow::Result;

use crate::error::Error;
use crate::process::Cmd;

/// Tools the build path needs, as (command, providing package).
pub const BUILD_TOOLS: &[(&str, &str)] = &[
    ("btrfs", "btrfs-progs"),
    ("mkfs.btrfs", "btrfs-progs"),
    ("mkfs.fat", "dosfstools"),
    ("sgdisk", "gptfdisk"),
    ("pacstrap", "arch-install-scripts"),
    ("blkid", "util-linux"),
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("udevadm", "systemd"),
    ("chroot", "coreutils"),
    ("truncate", "coreutils"),
];

/// Check if a command resolves in PATH.
pub fn command_exists(cmd: &str) -> bool {
    Cmd::new("which")
        .arg(cmd)
        .allow_fail()
        .run()
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Verify that every listed tool is present.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {tool} (install: {package})"));
        }
    }

    if !missing.is_empty() {
        return Err(Error::MissingPrerequisite(format!(
            "required host tools not found:\n{}",
            missing.join("\n")
        ))
        .into());
    }
    Ok(())
}

/// Verify the full build tool set.
pub fn check_build_tools() -> Result<()> {
    check_required_tools(BUILD_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_commands_exist() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn present_tools_pass() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn missing_tool_is_a_prerequisite_error() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingPrerequisite(_))
        ));
        assert!(format!("{err:#}").contains("fake-package"));
        assert_eq!(crate::error::exit_code_for(&err), 1);
    }
}
