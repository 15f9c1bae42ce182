//! Manifest codec and the completion-marker protocol.
//!
//! A generation is complete exactly when `config.json` exists at its root;
//! no other metadata is authoritative. The file is written via tmp + fsync
//! + rename so a partial write can never be mistaken for completion, and
//! it is strictly the last filesystem mutation of a build.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::SystemConfig;
use crate::error::Error;

/// Completion marker at a generation's root.
pub const CONFIG_JSON: &str = "config.json";

/// Name the inherited marker is parked under during an incremental build.
pub const CONFIG_JSON_PREV: &str = "config.json.prev";

/// Stable JSON rendering: pretty-printed with the B-tree field ordering of
/// [`SystemConfig`], trailing newline.
pub fn serialize(cfg: &SystemConfig) -> Result<String> {
    let mut out = serde_json::to_string_pretty(cfg).context("failed to serialize manifest")?;
    out.push('\n');
    Ok(out)
}

/// Strict parse; unknown keys are rejected so schema drift surfaces here
/// rather than as silently dropped configuration.
pub fn parse(data: &str) -> Result<SystemConfig> {
    serde_json::from_str(data).context("failed to parse manifest")
}

/// Atomically write `config.json` into `gen_root`.
pub fn write_atomic(gen_root: &Path, cfg: &SystemConfig) -> Result<()> {
    let final_path = gen_root.join(CONFIG_JSON);
    let tmp_path = gen_root.join(format!("{CONFIG_JSON}.tmp"));

    let data = serialize(cfg)?;
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(data.as_bytes())
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    drop(file);

    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
    Ok(())
}

/// Load the manifest of the generation at `gen_root`. `Ok(None)` when the
/// marker is absent (incomplete generation); [`Error::ManifestInvalid`]
/// when it exists but does not parse.
pub fn load(gen_root: &Path) -> Result<Option<SystemConfig>> {
    let path = gen_root.join(CONFIG_JSON);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    match parse(&data) {
        Ok(cfg) => Ok(Some(cfg)),
        Err(err) => Err(Error::ManifestInvalid {
            path,
            reason: format!("{err:#}"),
        }
        .into()),
    }
}
