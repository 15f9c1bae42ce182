//! Declarative user accounts.
//!
//! The declared user is written into the generation's `/etc` account files
//! at build time. Rewrites are idempotent: any previous entry for the same
//! name is dropped before the fresh one is appended, and entries belonging
//! to other accounts pass through untouched.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::UserSpec;
use crate::image::set_mode;

/// Write the user into passwd/shadow/group/gshadow under `gen_root` and,
/// when `home_root` is given (the mounted `@home` subvolume), create the
/// home directory.
pub fn apply_user(gen_root: &Path, user: &UserSpec, home_root: Option<&Path>) -> Result<()> {
    let etc = gen_root.join("etc");
    let uid = user.uid();

    let mut passwd = read_account_file(&etc.join("passwd"), &user.name)?;
    passwd.push(format!(
        "{}:x:{uid}:{uid}::/home/{}:{}",
        user.name, user.name, user.shell
    ));
    write_account_file(&etc.join("passwd"), &passwd, None)?;

    let mut shadow = read_account_file(&etc.join("shadow"), &user.name)?;
    shadow.push(format!("{}:!:19000:0:99999:7:::", user.name));
    write_account_file(&etc.join("shadow"), &shadow, Some(0o600))?;

    let mut group = read_account_file(&etc.join("group"), &user.name)?;
    group.push(format!("{}:x:{uid}:", user.name));
    let group = add_to_supplementary_groups(group, user);
    write_account_file(&etc.join("group"), &group, None)?;

    let mut gshadow = read_account_file(&etc.join("gshadow"), &user.name)?;
    gshadow.push(format!("{}:!::", user.name));
    write_account_file(&etc.join("gshadow"), &gshadow, Some(0o600))?;

    if let Some(home_root) = home_root {
        ensure_home(home_root, user)?;
    }
    Ok(())
}

/// Read an account file, dropping any existing entry for `name`.
fn read_account_file(path: &Path, name: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let prefix = format!("{name}:");
    Ok(content
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with(&prefix))
        .map(str::to_string)
        .collect())
}

fn write_account_file(path: &Path, lines: &[String], mode: Option<u32>) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    if let Some(mode) = mode {
        set_mode(path, mode)?;
    }
    Ok(())
}

/// Append the user to the member list of each declared supplementary
/// group that exists.
fn add_to_supplementary_groups(lines: Vec<String>, user: &UserSpec) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            let mut parts: Vec<String> = line.split(':').map(str::to_string).collect();
            if parts.len() >= 4 && user.groups.contains(&parts[0]) {
                let mut members: Vec<&str> =
                    parts[3].split(',').filter(|m| !m.is_empty()).collect();
                if !members.contains(&user.name.as_str()) {
                    members.push(&user.name);
                }
                parts[3] = members.join(",");
                parts.join(":")
            } else {
                line
            }
        })
        .collect()
}

fn ensure_home(home_root: &Path, user: &UserSpec) -> Result<()> {
    let home = home_root.join(&user.name);
    if home.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&home)
        .with_context(|| format!("failed to create {}", home.display()))?;
    set_mode(&home, 0o700)?;
    let uid = user.uid();
    std::os::unix::fs::chown(&home, Some(uid), Some(uid))
        .with_context(|| format!("failed to chown {}", home.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn setup_etc(root: &Path) {
        let etc = root.join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("passwd"),
            "root:x:0:0:root:/root:/bin/bash\nbin:x:1:1::/:/usr/bin/nologin\n",
        )
        .unwrap();
        std::fs::write(etc.join("shadow"), "root:!:19000::::::\n").unwrap();
        std::fs::write(etc.join("group"), "root:x:0:\nwheel:x:998:\nvideo:x:985:\n").unwrap();
        std::fs::write(etc.join("gshadow"), "root:!::\nwheel:!::\n").unwrap();
    }

    fn user(groups: &[&str]) -> UserSpec {
        UserSpec {
            name: "alice".into(),
            shell: "/bin/zsh".into(),
            groups: groups.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            uid: Some(1000),
        }
    }

    #[test]
    fn user_entries_are_appended() {
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());

        apply_user(tmp.path(), &user(&[]), None).unwrap();

        let passwd = std::fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert!(passwd.contains("alice:x:1000:1000::/home/alice:/bin/zsh"));
        assert!(passwd.contains("root:x:0:0"));

        let shadow = std::fs::read_to_string(tmp.path().join("etc/shadow")).unwrap();
        assert!(shadow.contains("alice:!:"));
    }

    #[test]
    fn reapply_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());

        apply_user(tmp.path(), &user(&[]), None).unwrap();
        apply_user(tmp.path(), &user(&[]), None).unwrap();

        let passwd = std::fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        let count = passwd.lines().filter(|l| l.starts_with("alice:")).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn supplementary_groups_gain_the_member() {
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());

        apply_user(tmp.path(), &user(&["wheel", "video"]), None).unwrap();

        let group = std::fs::read_to_string(tmp.path().join("etc/group")).unwrap();
        assert!(group.contains("wheel:x:998:alice"));
        assert!(group.contains("video:x:985:alice"));
        assert!(group.contains("root:x:0:\n"));
    }

    #[test]
    fn member_is_not_duplicated() {
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());

        apply_user(tmp.path(), &user(&["wheel"]), None).unwrap();
        apply_user(tmp.path(), &user(&["wheel"]), None).unwrap();

        let group = std::fs::read_to_string(tmp.path().join("etc/group")).unwrap();
        let wheel = group.lines().find(|l| l.starts_with("wheel:")).unwrap();
        assert_eq!(wheel, "wheel:x:998:alice");
    }

    #[test]
    fn shadow_files_get_restrictive_modes() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());

        apply_user(tmp.path(), &user(&[]), None).unwrap();

        for name in ["shadow", "gshadow"] {
            let mode = std::fs::metadata(tmp.path().join("etc").join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{name} mode");
        }
    }

    #[test]
    fn home_directory_is_created_once() {
        let tmp = TempDir::new().unwrap();
        setup_etc(tmp.path());
        let home_root = tmp.path().join("home");
        std::fs::create_dir_all(&home_root).unwrap();

        // The chown must target ourselves so the test runs unprivileged.
        let mut u = user(&[]);
        u.uid = Some(nix::unistd::geteuid().as_raw());

        apply_user(tmp.path(), &u, Some(&home_root)).unwrap();
        assert!(home_root.join("alice").is_dir());

        // A second apply must not fail on the existing directory.
        apply_user(tmp.path(), &u, Some(&home_root)).unwrap();
    }
}
