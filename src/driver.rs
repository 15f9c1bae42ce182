//! Top-level command flows: apply, list, rollback, gc.
//!
//! Every mutating flow takes the build lock first, then works through
//! scoped mounts so that any failure unwinds cleanly. The apply sequence
//! is lock, prerequisites, garbage collection, build, boot menu; the
//! menu rewrite is the moment a finished generation becomes the boot
//! default.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use console::style;
use tracing::info;

use crate::bootmenu;
use crate::builder::{self, BuildContext};
use crate::config::lua;
use crate::diff::ConfigDiff;
use crate::error::Error;
use crate::gc::{self, GcPolicy};
use crate::image::{self, LoopDevice};
use crate::lock::{lock_path, BuildLock};
use crate::manifest;
use crate::mount::Mount;
use crate::preflight;
use crate::subvol::{Generation, ImageSet};

/// Mount points used by the build flows.
const IMAGES_MOUNT: &str = "/mnt/darch-images";
const BUILD_MOUNT: &str = "/mnt/darch-build";
const ESP_MOUNT: &str = "/mnt/darch-esp";

/// Options for the apply flow.
pub struct ApplyOptions {
    pub image: PathBuf,
    pub config: PathBuf,
    pub size: String,
    pub rebuild: bool,
    pub upgrade: bool,
}

/// Build or update the image from the declared configuration.
pub fn apply(opts: &ApplyOptions) -> Result<()> {
    let _lock = BuildLock::acquire(&lock_path(), "apply")?;
    preflight::check_build_tools()?;

    let mut cfg = lua::load_config(&opts.config)?;

    let loop_dev = image::ensure_image(&opts.image, &opts.size)?;
    let esp_dev = loop_dev.esp_partition();
    let btrfs_dev = loop_dev.btrfs_partition();
    let esp_uuid = image::blkid_uuid(&esp_dev)?;
    let root_uuid = image::blkid_uuid(&btrfs_dev)?;

    crate::initramfs::inject(&mut cfg, &esp_uuid);

    let images_mount = Mount::subvol(&btrfs_dev, Path::new(IMAGES_MOUNT), "@images")?;
    let images = ImageSet::new(images_mount.target());

    // Orphans of earlier crashed builds go first, before numbering.
    gc::collect(&images, &GcPolicy::default())?;

    let prior = images.current_complete()?;
    let fresh = opts.rebuild || prior.is_none();

    let diff = if fresh {
        None
    } else {
        let prior_gen = prior.as_ref().unwrap();
        let old = prior_gen.manifest.as_ref().unwrap();
        let diff = ConfigDiff::compute(Some(old), &cfg);
        if !diff.has_changes() && !opts.upgrade {
            println!("Already up to date (gen-{}).", prior_gen.number);
            return Ok(());
        }
        info!("diff vs gen-{}: {}", prior_gen.number, diff.summary());
        Some(diff)
    };

    let n = images.next_number()?;
    clear_stale_target(&images, n)?;

    if fresh {
        println!("Building gen-{n} (fresh)");
        images.create(n)?;
    } else {
        let p = prior.as_ref().unwrap().number;
        println!("Building gen-{n} (incremental from gen-{p})");
        images.snapshot(p, n)?;
        // Park the inherited marker immediately: from here on a crash
        // leaves an incomplete generation.
        let gen_dir = images.gen_dir(n);
        std::fs::rename(
            gen_dir.join(manifest::CONFIG_JSON),
            gen_dir.join(manifest::CONFIG_JSON_PREV),
        )
        .context("failed to park inherited completion marker")?;
    }

    let mount_root = PathBuf::from(BUILD_MOUNT);
    let _root_mount = Mount::subvol(&btrfs_dev, &mount_root, &format!("@images/gen-{n}"))?;
    let efi_mount = mount_root.join("efi");
    let _efi = Mount::mount(&esp_dev, &efi_mount, None)?;

    let ctx = BuildContext {
        mount_root: mount_root.clone(),
        efi_mount: efi_mount.clone(),
        btrfs_dev: btrfs_dev.clone(),
        root_uuid: root_uuid.clone(),
        esp_uuid,
        gen: n,
        upgrade: opts.upgrade,
    };

    let result = if fresh {
        builder::build_fresh(&cfg, &ctx)
    } else {
        builder::build_incremental(&cfg, diff.as_ref().unwrap(), &ctx)
    };
    result.with_context(|| match &prior {
        Some(p) => format!(
            "build of gen-{n} failed; it will be reaped on the next run, \
             gen-{} remains the bootable default",
            p.number
        ),
        None => format!("build of gen-{n} failed; it will be reaped on the next run"),
    })?;

    // gen-N is complete on disk; the menu rewrite makes it the default.
    let generations = images.list_generations()?;
    let menu = bootmenu::render(&root_uuid, &generations, n);
    bootmenu::write(&efi_mount, &menu)?;

    println!(
        "{} gen-{n} built and set as boot default",
        style("Success:").green().bold()
    );
    Ok(())
}

/// Enumerate complete generations.
pub fn list(image_path: &Path) -> Result<()> {
    require_image(image_path)?;
    let loop_dev = LoopDevice::attach(image_path)?;
    let _images_mount = Mount::mount(
        &loop_dev.btrfs_partition(),
        Path::new(IMAGES_MOUNT),
        Some("subvol=@images,ro"),
    )?;
    let images = ImageSet::new(IMAGES_MOUNT);

    let generations = images.list_generations()?;
    let complete: Vec<&Generation> = generations.iter().filter(|g| g.complete()).collect();
    if complete.is_empty() {
        println!("No complete generations.");
        return Ok(());
    }

    let newest = complete.last().map(|g| g.number);
    for gen in &complete {
        let marker = if Some(gen.number) == newest { "*" } else { " " };
        println!(
            "{marker} gen-{:<4} {}",
            gen.number,
            bootmenu::format_timestamp(gen.created_at)
        );
    }
    Ok(())
}

/// Make the previous complete generation the boot default.
pub fn rollback(image_path: &Path) -> Result<()> {
    let _lock = BuildLock::acquire(&lock_path(), "rollback")?;
    require_image(image_path)?;

    let loop_dev = LoopDevice::attach(image_path)?;
    let btrfs_dev = loop_dev.btrfs_partition();
    let esp_dev = loop_dev.esp_partition();
    let root_uuid = image::blkid_uuid(&btrfs_dev)?;

    let _images_mount = Mount::mount(
        &btrfs_dev,
        Path::new(IMAGES_MOUNT),
        Some("subvol=@images,ro"),
    )?;
    let images = ImageSet::new(IMAGES_MOUNT);
    let generations = images.list_generations()?;
    let complete: Vec<&Generation> = generations.iter().filter(|g| g.complete()).collect();

    let [.., previous, newest] = complete.as_slice() else {
        bail!("nothing to roll back to: fewer than two complete generations");
    };

    let esp = Mount::mount(&esp_dev, Path::new(ESP_MOUNT), None)?;
    let menu = bootmenu::render(&root_uuid, &generations, previous.number);
    bootmenu::write(esp.target(), &menu)?;

    println!(
        "{} boot default rolled back to gen-{} (gen-{} stays available in the menu)",
        style("Success:").green().bold(),
        previous.number,
        newest.number
    );
    Ok(())
}

/// Options for the standalone gc flow.
pub struct GcOptions {
    pub image: PathBuf,
    pub keep: Option<usize>,
}

/// Collect garbage and refresh the boot menu to match the survivors.
pub fn run_gc(opts: &GcOptions) -> Result<()> {
    let _lock = BuildLock::acquire(&lock_path(), "gc")?;
    require_image(&opts.image)?;

    let loop_dev = LoopDevice::attach(&opts.image)?;
    let btrfs_dev = loop_dev.btrfs_partition();
    let root_uuid = image::blkid_uuid(&btrfs_dev)?;

    let _images_mount = Mount::subvol(&btrfs_dev, Path::new(IMAGES_MOUNT), "@images")?;
    let images = ImageSet::new(IMAGES_MOUNT);

    let policy = match opts.keep {
        Some(keep) => GcPolicy::with_keep_max(keep),
        None => GcPolicy::default(),
    };
    let deleted = gc::collect(&images, &policy)?;
    println!("Deleted {} generation(s).", deleted.len());

    // The menu must only reference surviving generations.
    let generations = images.list_generations()?;
    if let Some(newest) = generations.iter().rev().find(|g| g.complete()) {
        let esp = Mount::mount(&loop_dev.esp_partition(), Path::new(ESP_MOUNT), None)?;
        let menu = bootmenu::render(&root_uuid, &generations, newest.number);
        bootmenu::write(esp.target(), &menu)?;
    }
    Ok(())
}

/// A leftover subvolume under the target number can only be an orphan of a
/// crashed build; anything complete there means the numbering is broken.
fn clear_stale_target(images: &ImageSet, number: u32) -> Result<()> {
    let dir = images.gen_dir(number);
    if !dir.exists() {
        return Ok(());
    }
    if dir.join(manifest::CONFIG_JSON).exists() {
        return Err(Error::InvariantViolation(format!(
            "gen-{number} already exists and is complete, but was allocated as the next number"
        ))
        .into());
    }
    info!("deleting stale incomplete gen-{number}");
    images.delete(number)
}

fn require_image(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("image file '{}' not found", path.display());
    }
    Ok(())
}
