//! Lua configuration frontend.
//!
//! The `--config` file is a Lua script that defines a `configure()`
//! function (either as a global or in a returned module table) and returns
//! a table of recognized options:
//!
//! ```lua
//! function configure()
//!     return {
//!         name = "vm",
//!         packages = { "vim", "openssh" },
//!         services = { "sshd" },
//!         timezone = "Europe/Berlin",
//!         locale = "en_US.UTF-8",
//!         files = {
//!             ["/etc/motd"] = "welcome\n",
//!             ["/usr/local/bin/greet"] = { content = "#!/bin/sh\necho hi\n", mode = 0x1ED },
//!         },
//!         symlinks = { ["/etc/foo"] = "/usr/share/foo" },
//!         user = { name = "alice", groups = { "wheel" } },
//!     }
//! end
//! ```
//!
//! Declared packages are merged into the stock base set; declared
//! initramfs module/hook sequences replace the stock ones. The evaluated
//! result is plain data to the rest of the engine.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use mlua::{Function, Lua, Table, Value};
use tracing::debug;

use super::{normalize_service_name, FileEntry, SystemConfig, UserSpec};

/// Evaluate a config script and produce the configuration it declares.
pub fn load_config(path: &Path) -> Result<SystemConfig> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;

    let lua = Lua::new();
    let chunk_result: Value = lua
        .load(&source)
        .set_name(path.to_string_lossy())
        .eval()
        .map_err(|e| anyhow!("failed to evaluate {}: {e}", path.display()))?;

    let configure = find_configure(&lua, &chunk_result)
        .with_context(|| format!("{} must define a configure() function", path.display()))?;

    let table: Table = configure
        .call(())
        .map_err(|e| anyhow!("error in configure(): {e}"))?;

    let cfg = from_table(&table)?;
    debug!(
        "loaded config '{}': {} packages, {} files, {} symlinks, {} services",
        cfg.name,
        cfg.packages.len(),
        cfg.files.len(),
        cfg.symlinks.len(),
        cfg.services.len()
    );
    Ok(cfg)
}

/// Locate `configure` as a global or in a returned module table.
fn find_configure(lua: &Lua, chunk_result: &Value) -> Result<Function> {
    if let Ok(f) = lua.globals().get::<Function>("configure") {
        return Ok(f);
    }
    if let Value::Table(module) = chunk_result {
        if let Ok(f) = module.get::<Function>("configure") {
            return Ok(f);
        }
    }
    bail!("no configure() found")
}

/// Convert the table returned by `configure()` into a [`SystemConfig`].
fn from_table(table: &Table) -> Result<SystemConfig> {
    let name: String = table
        .get::<Option<String>>("name")
        .map_err(|e| anyhow!("invalid 'name': {e}"))?
        .context("configuration must set 'name'")?;

    let mut cfg = SystemConfig::with_defaults(&name);

    if let Some(packages) = opt_table(table, "packages")? {
        for pkg in string_sequence(&packages, "packages")? {
            cfg.packages.insert(pkg);
        }
    }

    if let Some(files) = opt_table(table, "files")? {
        for pair in files.pairs::<String, Value>() {
            let (path, value) = pair.map_err(|e| anyhow!("invalid 'files' entry: {e}"))?;
            require_absolute(&path, "files")?;
            cfg.files.insert(path, file_entry(value)?);
        }
    }

    if let Some(symlinks) = opt_table(table, "symlinks")? {
        for pair in symlinks.pairs::<String, String>() {
            let (path, target) = pair.map_err(|e| anyhow!("invalid 'symlinks' entry: {e}"))?;
            require_absolute(&path, "symlinks")?;
            cfg.symlinks.insert(path, target);
        }
    }

    if let Some(services) = opt_table(table, "services")? {
        for name in string_sequence(&services, "services")? {
            cfg.services.insert(normalize_service_name(&name));
        }
    }

    cfg.hostname = opt_string(table, "hostname")?;
    cfg.timezone = opt_string(table, "timezone")?;
    cfg.locale = opt_string(table, "locale")?;

    if let Some(user) = opt_table(table, "user")? {
        cfg.user = Some(user_spec(&user)?);
    }

    if let Some(modules) = opt_table(table, "initramfs_modules")? {
        cfg.initramfs_modules = string_sequence(&modules, "initramfs_modules")?;
    }
    if let Some(hooks) = opt_table(table, "initramfs_hooks")? {
        cfg.initramfs_hooks = string_sequence(&hooks, "initramfs_hooks")?;
    }

    Ok(cfg)
}

fn file_entry(value: Value) -> Result<FileEntry> {
    match value {
        Value::String(s) => Ok(FileEntry::new(
            s.to_str().map_err(|e| anyhow!("invalid file content: {e}"))?.to_string(),
        )),
        Value::Table(t) => {
            let content: String = t
                .get::<Option<String>>("content")
                .map_err(|e| anyhow!("invalid file 'content': {e}"))?
                .context("file entry table must set 'content'")?;
            let mode: Option<u32> = t
                .get::<Option<u32>>("mode")
                .map_err(|e| anyhow!("invalid file 'mode': {e}"))?;
            Ok(FileEntry { content, mode })
        }
        other => bail!(
            "file entry must be a string or a table, got {}",
            other.type_name()
        ),
    }
}

fn user_spec(table: &Table) -> Result<UserSpec> {
    let name: String = table
        .get::<Option<String>>("name")
        .map_err(|e| anyhow!("invalid user 'name': {e}"))?
        .context("user table must set 'name'")?;
    let shell: Option<String> = opt_string(table, "shell")?;
    let uid: Option<u32> = table
        .get::<Option<u32>>("uid")
        .map_err(|e| anyhow!("invalid user 'uid': {e}"))?;

    let mut groups = std::collections::BTreeSet::new();
    if let Some(groups_table) = opt_table(table, "groups")? {
        for g in string_sequence(&groups_table, "user.groups")? {
            groups.insert(g);
        }
    }

    Ok(UserSpec {
        name,
        shell: shell.unwrap_or_else(|| "/bin/bash".to_string()),
        groups,
        uid,
    })
}

fn opt_table(table: &Table, key: &str) -> Result<Option<Table>> {
    table
        .get::<Option<Table>>(key)
        .map_err(|e| anyhow!("'{key}' must be a table: {e}"))
}

fn opt_string(table: &Table, key: &str) -> Result<Option<String>> {
    table
        .get::<Option<String>>(key)
        .map_err(|e| anyhow!("'{key}' must be a string: {e}"))
}

fn string_sequence(table: &Table, what: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for value in table.clone().sequence_values::<String>() {
        out.push(value.map_err(|e| anyhow!("'{what}' must be a list of strings: {e}"))?);
    }
    Ok(out)
}

fn require_absolute(path: &str, what: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("'{what}' keys must be absolute paths, got '{path}'");
    }
    Ok(())
}
