//! The overlay assembler (C4): builds the lower/upper/work dir set for a
//! container and mounts its root filesystem.
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};

use crate::error::RuntimeResult;
use crate::image;
use crate::manifest;
use crate::paths;

/// Mounts the overlay rootfs for `container_id` built from `image_hash`.
/// Lower dirs are the manifest's layer order *reversed*, so the topmost
/// layer comes first in `lowerdir=` (overlayfs gives earlier entries
/// precedence).
pub fn mount_overlay(container_id: &str, image_hash: &str) -> RuntimeResult<()> {
    let manifest = image::load_manifest(image_hash)?;
    let entry = manifest::single_entry(&manifest)
        .map_err(crate::error::RuntimeError::Registry)?;

    let image_dir = paths::image_base_path(image_hash);
    let lower_dirs: Vec<String> = entry
        .layers
        .iter()
        .rev()
        .map(|layer| format!("{}/{}/fs", image_dir, manifest::first12(layer)))
        .collect();

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower_dirs.join(":"),
        paths::container_upper_path(container_id),
        paths::container_work_path(container_id),
    );

    mount(
        Some("none"),
        Path::new(&paths::container_mnt_path(container_id)),
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )?;

    Ok(())
}

pub fn umount_overlay(container_id: &str) -> RuntimeResult<()> {
    umount(Path::new(&paths::container_mnt_path(container_id)))?;
    Ok(())
}
