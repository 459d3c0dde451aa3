//! Canonical on-disk paths. Fixed at compile time per the design contract:
//! callers never get to retarget these, so the test suite can assert against
//! the literal paths below.
use std::fs;
use std::io;

pub const RUNTIME_NAME: &str = "rockcrate";

pub const HOME_PATH: &str = "/var/lib/rockcrate";
pub const TMP_PATH: &str = "/var/lib/rockcrate/tmp";
pub const IMAGES_PATH: &str = "/var/lib/rockcrate/images";
pub const CONTAINERS_PATH: &str = "/var/run/rockcrate/containers";
pub const NET_NS_PATH: &str = "/var/run/rockcrate/net-ns";

pub fn images_index_path() -> String {
    format!("{}/images.json", IMAGES_PATH)
}

pub fn image_base_path(image_hash: &str) -> String {
    format!("{}/{}", IMAGES_PATH, image_hash)
}

pub fn image_manifest_path(image_hash: &str) -> String {
    format!("{}/manifest.json", image_base_path(image_hash))
}

pub fn image_config_path(image_hash: &str) -> String {
    format!("{}/{}.json", image_base_path(image_hash), image_hash)
}

pub fn container_base_path(container_id: &str) -> String {
    format!("{}/{}", CONTAINERS_PATH, container_id)
}

pub fn container_fs_path(container_id: &str) -> String {
    format!("{}/fs", container_base_path(container_id))
}

pub fn container_mnt_path(container_id: &str) -> String {
    format!("{}/mnt", container_fs_path(container_id))
}

pub fn container_upper_path(container_id: &str) -> String {
    format!("{}/upperdir", container_fs_path(container_id))
}

pub fn container_work_path(container_id: &str) -> String {
    format!("{}/workdir", container_fs_path(container_id))
}

pub fn net_ns_bind_path(container_id: &str) -> String {
    format!("{}/{}", NET_NS_PATH, container_id)
}

/// Creates the runtime's directory skeleton, idempotently.
pub fn init_dirs() -> io::Result<()> {
    for dir in [HOME_PATH, TMP_PATH, IMAGES_PATH, CONTAINERS_PATH, NET_NS_PATH] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
