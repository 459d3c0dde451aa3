//! The image acquirer (C3): resolves a `name[:tag]` reference to an image
//! hash, pulling and unpacking it onto disk only if it isn't already there.
use std::fs;
use std::path::Path;

use log::info;

use crate::error::{RuntimeError, RuntimeResult};
use crate::image_store::ImageIndex;
use crate::manifest::{self, Manifest};
use crate::paths;
use crate::registry;
use crate::tarball;

/// Resolves `src` (`name[:tag]`) to an image hash, pulling the image if it
/// isn't already present under that name and tag.
pub async fn ensure_image(src: &str) -> RuntimeResult<String> {
    let (name, tag) = registry::parse_image_name(src)?;
    let mut index = ImageIndex::load()?;

    if let Some(hash) = index.resolve_by_tag(&name, &tag) {
        info!("image already exists. not downloading.");
        return Ok(hash);
    }

    info!("downloading image {}:{}...", name, tag);
    let (hash, tarball_path) = registry::pull(&name, &tag).await?;

    if let Some((alt_name, alt_tag)) = index.resolve_by_hash(&hash) {
        info!(
            "the image you requested {}:{} is the same as {}:{}",
            name, tag, alt_name, alt_tag
        );
        index.put(&name, &tag, &hash)?;
        let _ = fs::remove_dir_all(format!("{}/{}", paths::TMP_PATH, hash));
        return Ok(hash);
    }

    extract_and_store(&name, &tag, &hash, &tarball_path, &mut index)?;
    Ok(hash)
}

fn extract_and_store(
    name: &str,
    tag: &str,
    hash: &str,
    tarball_path: &str,
    index: &mut ImageIndex,
) -> RuntimeResult<()> {
    let tmp_dir = format!("{}/{}", paths::TMP_PATH, hash);
    tarball::untar(Path::new(tarball_path), Path::new(&tmp_dir))?;

    let manifest_path = format!("{}/manifest.json", tmp_dir);
    let manifest_data = fs::read_to_string(&manifest_path)?;
    let parsed: Manifest = serde_json::from_str(&manifest_data)?;
    let entry = manifest::single_entry(&parsed).map_err(RuntimeError::Registry)?;

    let image_dir = paths::image_base_path(hash);
    fs::create_dir_all(&image_dir)?;

    for layer in &entry.layers {
        let layer_hash = manifest::first12(layer);
        info!("uncompressing layer to: {}/{}/fs", image_dir, layer_hash);
        let src_layer = format!("{}/{}", tmp_dir, layer);
        let dst_fs = format!("{}/{}/fs", image_dir, layer_hash);
        fs::create_dir_all(&dst_fs)?;
        tarball::untar(Path::new(&src_layer), Path::new(&dst_fs))?;
    }

    fs::copy(&manifest_path, paths::image_manifest_path(hash))?;
    fs::copy(format!("{}/{}", tmp_dir, entry.config), paths::image_config_path(hash))?;

    index.put(name, tag, hash)?;
    fs::remove_dir_all(&tmp_dir)?;

    Ok(())
}

/// Loads the persisted manifest for `image_hash`, already validated to have
/// exactly one record with at least one layer when it was first extracted.
pub fn load_manifest(image_hash: &str) -> RuntimeResult<Manifest> {
    let data = fs::read_to_string(paths::image_manifest_path(image_hash))?;
    Ok(serde_json::from_str(&data)?)
}

/// Loads the default env/command for containers built from `image_hash`.
pub fn load_config(image_hash: &str) -> RuntimeResult<manifest::ImageConfig> {
    let data = fs::read_to_string(paths::image_config_path(image_hash))?;
    Ok(serde_json::from_str(&data)?)
}

pub fn list_images() -> RuntimeResult<Vec<(String, String, String)>> {
    Ok(ImageIndex::load()?.list())
}

pub fn print_available_images() -> RuntimeResult<()> {
    println!("REPOSITORY\tTAG\tIMAGE ID");
    for (name, tag, hash) in list_images()? {
        println!("{}\t{}\t{}", name, tag, hash);
    }
    Ok(())
}

/// Removes the on-disk image directory and every index entry pointing at
/// `image_hash`, refusing if a running container still references it (the
/// check-then-remove race is accepted, not fixed: see DESIGN.md).
pub fn remove_image(image_hash: &str) -> RuntimeResult<()> {
    let mut index = ImageIndex::load()?;
    let (name, tag) = index
        .resolve_by_hash(image_hash)
        .ok_or_else(|| RuntimeError::NotFound(format!("no such image: {}", image_hash)))?;

    for running in crate::enumerator::list_running()? {
        if running.image == format!("{}:{}", name, tag) {
            return Err(RuntimeError::Conflict(format!(
                "cannot delete image because it is in use by: {}",
                running.container_id
            )));
        }
    }

    fs::remove_dir_all(paths::image_base_path(image_hash))?;
    index.remove_by_hash(image_hash)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;

    #[test]
    fn manifest_roundtrips_through_json() {
        let manifest: Manifest = vec![ManifestEntry {
            config: "abc123.json".into(),
            repo_tags: vec!["alpine:latest".into()],
            layers: vec!["deadbeefcafe0011223344/layer.tar".into()],
        }];
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].config, "abc123.json");
        assert_eq!(manifest::first12(&parsed[0].layers[0]), "deadbeefcafe");
    }
}
