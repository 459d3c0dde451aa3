//! The container enumerator (C8): reconstructs running-container records
//! from cgroup directories and `/proc`, rather than from any persisted
//! side-database. This is what lets `ps` survive a crashed runtime process.
use std::fs;
use std::path::Path;

use crate::error::RuntimeResult;
use crate::image_store::ImageIndex;
use crate::manifest;
use crate::paths::{self, RUNTIME_NAME};

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub container_id: String,
    pub image: String,
    pub command: String,
    pub pid: i32,
}

fn cgroup_cpu_root() -> String {
    format!("/sys/fs/cgroup/cpu/{}", RUNTIME_NAME)
}

fn last_pid(container_id: &str) -> RuntimeResult<Option<i32>> {
    let procs_path = format!("{}/{}/cgroup.procs", cgroup_cpu_root(), container_id);
    let data = match fs::read_to_string(&procs_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .and_then(|l| l.trim().parse().ok()))
}

fn command_for_pid(pid: i32, container_id: &str) -> Option<String> {
    let exe_target = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
    let mnt_path = paths::container_mnt_path(container_id);
    let real_mnt = fs::canonicalize(&mnt_path).unwrap_or_else(|_| Path::new(&mnt_path).to_path_buf());
    let exe_str = exe_target.to_string_lossy().to_string();
    let real_mnt_str = real_mnt.to_string_lossy().to_string();
    Some(
        exe_str
            .strip_prefix(real_mnt_str.as_str())
            .unwrap_or(&exe_str)
            .to_string(),
    )
}

fn image_for_container(container_id: &str, index: &ImageIndex) -> Option<String> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    let line = mounts
        .lines()
        .find(|l| l.contains(container_id) && l.contains("lowerdir="))?;

    let lowerdir_pos = line.find("lowerdir=")?;
    let rest = &line[lowerdir_pos + "lowerdir=".len()..];
    let end = rest.find([',', ' ']).unwrap_or(rest.len());
    let first_lower = rest[..end].split(':').next()?;

    let images_prefix = format!("{}/", paths::IMAGES_PATH);
    let after_prefix = first_lower.strip_prefix(images_prefix.as_str())?;
    let image_hash_raw = after_prefix.split('/').next()?;
    let image_hash = manifest::first12(image_hash_raw);

    index
        .resolve_by_hash(&image_hash)
        .map(|(name, tag)| format!("{}:{}", name, tag))
}

/// Lists every container currently accounted for in the runtime's cgroup
/// hierarchy. A missing cgroup root means "no containers", not an error.
pub fn list_running() -> RuntimeResult<Vec<RunningContainer>> {
    let root = cgroup_cpu_root();
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let index = ImageIndex::load()?;
    let mut containers = Vec::new();

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let container_id = entry.file_name().to_string_lossy().to_string();

        let pid = match last_pid(&container_id)? {
            Some(pid) => pid,
            None => continue,
        };

        let command = command_for_pid(pid, &container_id).unwrap_or_default();
        let image = image_for_container(&container_id, &index).unwrap_or_default();

        containers.push(RunningContainer {
            container_id,
            image,
            command,
            pid,
        });
    }

    Ok(containers)
}

pub fn print_running_containers() -> RuntimeResult<()> {
    println!("CONTAINER ID\tIMAGE\t\tCOMMAND");
    for container in list_running()? {
        println!(
            "{}\t{}\t{}",
            container.container_id, container.image, container.command
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_for_pid_returns_none_for_nonexistent_pid() {
        assert!(command_for_pid(i32::MAX, "nosuchcontainer").is_none());
    }
}
