//! The cgroup controller (C6): raw cgroup-v1-filesystem writes under
//! `/sys/fs/cgroup/{memory,pids,cpu}`, one sibling directory per controller
//! per container. No systemd/D-Bus mediation (see DESIGN.md for why the
//! teacher's transient-unit approach was dropped).
use std::fs;
use std::path::PathBuf;

use log::warn;
use nix::unistd::{getpid, Pid};

use crate::error::RuntimeResult;
use crate::paths::RUNTIME_NAME;

const CONTROLLERS: [&str; 3] = ["memory", "pids", "cpu"];

fn controller_dir(controller: &str, container_id: &str) -> PathBuf {
    PathBuf::from(format!(
        "/sys/fs/cgroup/{}/{}/{}",
        controller, RUNTIME_NAME, container_id
    ))
}

/// Creates (if requested) the three controller directories and attaches the
/// calling process's pid to each, so the child that eventually execs the
/// user command is accounted for before it does.
pub fn create_cgroups(container_id: &str, create_dirs: bool) -> RuntimeResult<()> {
    let pid = getpid();
    for controller in CONTROLLERS {
        let dir = controller_dir(controller, container_id);
        if create_dirs {
            fs::create_dir_all(&dir)?;
        }
        fs::write(dir.join("notify_on_release"), b"1")?;
        attach_pid(&dir, pid)?;
    }
    Ok(())
}

fn attach_pid(dir: &PathBuf, pid: Pid) -> RuntimeResult<()> {
    fs::write(dir.join("cgroup.procs"), pid.as_raw().to_string())?;
    Ok(())
}

/// Applies the resource limits the `run` subcommand was given. Each limit is
/// independently optional; `-1` (the CLI default) means "unset".
pub fn configure_cgroups(
    container_id: &str,
    mem_mb: i64,
    swap_mb: i64,
    pids_limit: i64,
    cpus: f64,
) -> RuntimeResult<()> {
    if mem_mb > 0 {
        let mem_dir = controller_dir("memory", container_id);
        let mem_bytes = mem_mb * 1024 * 1024;
        fs::write(mem_dir.join("memory.limit_in_bytes"), mem_bytes.to_string())?;

        if swap_mb >= 0 {
            let total_bytes = mem_bytes + swap_mb * 1024 * 1024;
            fs::write(
                mem_dir.join("memory.memsw.limit_in_bytes"),
                total_bytes.to_string(),
            )?;
        }
    }

    if cpus > 0.0 {
        let num_cpus = num_cpus();
        if cpus > num_cpus as f64 {
            warn!(
                "requested {} cpus but host only has {}; ignoring cpu limit",
                cpus, num_cpus
            );
        } else {
            let cpu_dir = controller_dir("cpu", container_id);
            const PERIOD_US: i64 = 1_000_000;
            let quota_us = (PERIOD_US as f64 * cpus).round() as i64;
            fs::write(cpu_dir.join("cpu.cfs_period_us"), PERIOD_US.to_string())?;
            fs::write(cpu_dir.join("cpu.cfs_quota_us"), quota_us.to_string())?;
        }
    }

    if pids_limit > 0 {
        let pids_dir = controller_dir("pids", container_id);
        fs::write(pids_dir.join("pids.max"), pids_limit.to_string())?;
    }

    Ok(())
}

pub fn remove_cgroups(container_id: &str) -> RuntimeResult<()> {
    for controller in CONTROLLERS {
        let dir = controller_dir(controller, container_id);
        fs::remove_dir(&dir)?;
    }
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_dir_uses_runtime_name_and_container_id() {
        let dir = controller_dir("memory", "abc123def456");
        assert_eq!(
            dir,
            PathBuf::from("/sys/fs/cgroup/memory/rockcrate/abc123def456")
        );
    }
}
