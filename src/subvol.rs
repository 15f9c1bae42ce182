//! Generations as btrfs subvolumes under the images directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::SystemConfig;
use crate::manifest;
use crate::process::Cmd;

/// Directory-name prefix of a generation subvolume.
pub const GEN_PREFIX: &str = "gen-";

/// One generation: a numbered subvolume, complete iff its manifest exists.
#[derive(Debug, Clone)]
pub struct Generation {
    pub number: u32,
    pub path: PathBuf,
    /// Present exactly when the generation is complete.
    pub manifest: Option<SystemConfig>,
    /// Taken from the completion marker; `None` while incomplete.
    pub created_at: Option<SystemTime>,
}

impl Generation {
    pub fn complete(&self) -> bool {
        self.manifest.is_some()
    }
}

/// Operations over the mounted `@images` subvolume.
pub struct ImageSet {
    images: PathBuf,
}

impl ImageSet {
    pub fn new(images: impl Into<PathBuf>) -> Self {
        Self {
            images: images.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.images
    }

    pub fn gen_dir(&self, number: u32) -> PathBuf {
        self.images.join(format!("{GEN_PREFIX}{number}"))
    }

    /// All generations, sorted ascending by number. A generation whose
    /// marker exists but does not parse is reported incomplete; the next
    /// garbage collection removes it.
    pub fn list_generations(&self) -> Result<Vec<Generation>> {
        let mut out = Vec::new();

        let entries = std::fs::read_dir(&self.images)
            .with_context(|| format!("failed to read {}", self.images.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(number) = parse_generation_number(&name.to_string_lossy()) else {
                continue;
            };
            let path = entry.path();

            let manifest = match manifest::load(&path) {
                Ok(m) => m,
                Err(err) => {
                    warn!("gen-{number}: {err:#}; treating as incomplete");
                    None
                }
            };
            let created_at = manifest.as_ref().and_then(|_| {
                std::fs::metadata(path.join(manifest::CONFIG_JSON))
                    .and_then(|m| m.modified())
                    .ok()
            });

            out.push(Generation {
                number,
                path,
                manifest,
                created_at,
            });
        }

        out.sort_by_key(|g| g.number);
        Ok(out)
    }

    /// The highest-numbered complete generation, if any.
    pub fn current_complete(&self) -> Result<Option<Generation>> {
        Ok(self
            .list_generations()?
            .into_iter()
            .rev()
            .find(Generation::complete))
    }

    /// Number for the next generation: `max(existing) + 1`, or 1.
    pub fn next_number(&self) -> Result<u32> {
        let max = self
            .list_generations()?
            .last()
            .map(|g| g.number)
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// `btrfs subvolume create` a fresh generation.
    pub fn create(&self, number: u32) -> Result<()> {
        Cmd::new("btrfs")
            .args(["subvolume", "create"])
            .arg_path(&self.gen_dir(number))
            .error_msg(&format!("failed to create gen-{number}"))
            .run()?;
        Ok(())
    }

    /// Writable snapshot of `src` as generation `dst`.
    pub fn snapshot(&self, src: u32, dst: u32) -> Result<()> {
        Cmd::new("btrfs")
            .args(["subvolume", "snapshot"])
            .arg_path(&self.gen_dir(src))
            .arg_path(&self.gen_dir(dst))
            .error_msg(&format!("failed to snapshot gen-{src} as gen-{dst}"))
            .run()?;
        Ok(())
    }

    /// Delete a generation subvolume. Missing is success.
    pub fn delete(&self, number: u32) -> Result<()> {
        let path = self.gen_dir(number);
        if !path.exists() {
            return Ok(());
        }
        Cmd::new("btrfs")
            .args(["subvolume", "delete"])
            .arg_path(&path)
            .error_msg(&format!("failed to delete gen-{number}"))
            .run()?;
        Ok(())
    }
}

/// Parse `gen-N` into `N`; anything else (including `gen-07x` or a bare
/// `gen-`) is not a generation.
pub fn parse_generation_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(GEN_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number: u32 = digits.parse().ok()?;
    if number == 0 {
        return None;
    }
    Some(number)
}
