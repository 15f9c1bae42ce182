//! Generation garbage collection.
//!
//! Incomplete generations are orphans of failed or interrupted builds and
//! are always deleted. Complete generations are pruned oldest-first by
//! count and age, with floors that keep a minimum population and protect
//! young generations. Planning is pure so the policy is testable without a
//! filesystem; execution goes through the subvolume manager.

use std::time::SystemTime;

use anyhow::Result;
use tracing::info;

use crate::subvol::{parse_generation_number, Generation, ImageSet};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Retention policy.
#[derive(Debug, Clone, Copy)]
pub struct GcPolicy {
    /// Never drop below this many complete generations.
    pub keep_min: usize,
    /// Prune down to this many complete generations.
    pub keep_max: usize,
    /// Complete generations younger than this are never deleted.
    pub min_age_days: f64,
    /// Complete generations that reach this age expire.
    pub max_age_days: f64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            keep_min: 3,
            keep_max: 10,
            min_age_days: 7.0,
            max_age_days: 30.0,
        }
    }
}

impl GcPolicy {
    pub fn with_keep_max(keep_max: usize) -> Self {
        Self {
            keep_max,
            ..Self::default()
        }
    }
}

/// Decide which generation numbers to delete. `protected` is the
/// generation the running system currently points at, when discoverable.
pub fn plan(
    generations: &[Generation],
    now: SystemTime,
    protected: Option<u32>,
    policy: &GcPolicy,
) -> Vec<u32> {
    let mut deletions = Vec::new();

    // Every incomplete generation is an orphan; the lock is held, so no
    // build owns any of them.
    for gen in generations {
        if !gen.complete() && protected != Some(gen.number) {
            deletions.push(gen.number);
        }
    }

    let complete: Vec<&Generation> = generations.iter().filter(|g| g.complete()).collect();
    let mut remaining = complete.len();

    for gen in &complete {
        if remaining <= policy.keep_min {
            break;
        }
        let age = age_days(gen, now);
        let over_budget = remaining > policy.keep_max || age >= policy.max_age_days;
        if !over_budget {
            break;
        }
        if age < policy.min_age_days {
            break;
        }
        if protected == Some(gen.number) {
            continue;
        }
        deletions.push(gen.number);
        remaining -= 1;
    }

    deletions
}

/// Plan and execute a collection over `images`.
pub fn collect(images: &ImageSet, policy: &GcPolicy) -> Result<Vec<u32>> {
    let generations = images.list_generations()?;
    let protected = discover_active_generation();
    let deletions = plan(&generations, SystemTime::now(), protected, policy);

    for number in &deletions {
        info!("deleting gen-{number}");
        images.delete(*number)?;
    }
    if !deletions.is_empty() {
        info!("garbage collected {} generation(s)", deletions.len());
    }
    Ok(deletions)
}

/// On a running darch host, `/current` is a symlink of the form
/// `images/gen-N`; the generation it names must survive collection. On a
/// build host the link either does not exist or has another shape, so
/// nothing is protected.
pub fn discover_active_generation() -> Option<u32> {
    let target = std::fs::read_link("/current").ok()?;
    let parent_is_images = target
        .parent()
        .map(|p| p.ends_with("images"))
        .unwrap_or(false);
    if !parent_is_images {
        return None;
    }
    parse_generation_number(&target.file_name()?.to_string_lossy())
}

fn age_days(gen: &Generation, now: SystemTime) -> f64 {
    let Some(created) = gen.created_at else {
        return 0.0;
    };
    now.duration_since(created)
        .map(|d| d.as_secs_f64() / SECONDS_PER_DAY)
        .unwrap_or(0.0)
}
