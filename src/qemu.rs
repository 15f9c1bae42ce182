//! Boot a built image in QEMU.
//!
//! UEFI-only: OVMF firmware is required, with a writable copy of the vars
//! store so the guest's boot entries cannot leak onto the host.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::error::Error;
use crate::preflight::command_exists;
use crate::process::Cmd;

/// Known OVMF firmware locations, (code, vars).
const OVMF_CANDIDATES: &[(&str, &str)] = &[
    (
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.4m.fd",
        "/usr/share/edk2-ovmf/x64/OVMF_VARS.4m.fd",
    ),
    (
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
        "/usr/share/edk2-ovmf/x64/OVMF_VARS.fd",
    ),
    ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
];

/// Options for a test boot.
pub struct TestOptions {
    pub image: PathBuf,
    pub memory: String,
    pub cpus: u32,
    pub graphics: bool,
}

/// Locate OVMF firmware, returning (code, vars).
pub fn find_ovmf() -> Option<(PathBuf, PathBuf)> {
    OVMF_CANDIDATES
        .iter()
        .find(|(code, vars)| Path::new(code).exists() && Path::new(vars).exists())
        .map(|(code, vars)| (PathBuf::from(code), PathBuf::from(vars)))
}

/// Boot the image. Blocks until QEMU exits.
pub fn run_test(opts: &TestOptions) -> Result<()> {
    if !opts.image.exists() {
        anyhow::bail!("image file '{}' not found", opts.image.display());
    }
    if !command_exists("qemu-system-x86_64") {
        return Err(Error::MissingPrerequisite(
            "qemu-system-x86_64 not found (install: qemu-full)".into(),
        )
        .into());
    }
    let (ovmf_code, ovmf_vars) = find_ovmf().ok_or_else(|| {
        Error::MissingPrerequisite("OVMF firmware not found (install: edk2-ovmf)".into())
    })?;

    // The vars store is written by the firmware; give the guest a copy.
    let vars_copy = NamedTempFile::new().context("failed to create OVMF vars copy")?;
    std::fs::copy(&ovmf_vars, vars_copy.path()).context("failed to copy OVMF vars")?;

    println!("Booting {} (UEFI, {})", opts.image.display(), opts.memory);

    let mut cmd = Cmd::new("qemu-system-x86_64");
    if Path::new("/dev/kvm").exists() {
        cmd = cmd.args(["-enable-kvm", "-cpu", "host"]);
    }
    cmd = cmd
        .args(["-m", &opts.memory])
        .args(["-smp", &opts.cpus.to_string()])
        .arg("-drive")
        .arg(format!(
            "if=pflash,format=raw,readonly=on,file={}",
            ovmf_code.display()
        ))
        .arg("-drive")
        .arg(format!(
            "if=pflash,format=raw,file={}",
            vars_copy.path().display()
        ))
        .arg("-drive")
        .arg(format!("file={},format=raw", opts.image.display()))
        .args(["-net", "none", "-usb", "-device", "usb-tablet"]);

    if opts.graphics {
        cmd = cmd.args(["-device", "virtio-vga", "-display", "gtk"]);
        println!("Close the window to exit");
    } else {
        println!("Serial console; exit with Ctrl-A X");
        cmd = cmd.args([
            "-nographic",
            "-chardev",
            "stdio,mux=on,id=char0,logfile=qemu-console.log,signal=off",
            "-serial",
            "chardev:char0",
            "-mon",
            "chardev=char0",
        ]);
    }

    cmd.error_msg("qemu exited with an error").run_interactive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_fails_before_any_tool_check() {
        let opts = TestOptions {
            image: PathBuf::from("/definitely/not/here.img"),
            memory: "4G".into(),
            cpus: 2,
            graphics: false,
        };
        let err = run_test(&opts).unwrap_err();
        assert!(format!("{err:#}").contains("not found"));
        // No typed kind: a bad path is a user error, exit code 1.
        assert_eq!(crate::error::exit_code_for(&err), 1);
    }
}
