//! Attach (C9): joins an already-running container's namespaces and execs an
//! additional command inside it, without touching the resource limits the
//! container already has (see DESIGN.md on the `exec` open question).
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, close, execve};

use crate::cgroup;
use crate::enumerator;
use crate::error::{RuntimeError, RuntimeResult};
use crate::image;
use crate::paths;
use crate::registry;

const NS_FILES: [(&str, CloneFlags); 5] = [
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("mnt", CloneFlags::CLONE_NEWNS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("uts", CloneFlags::CLONE_NEWUTS),
];

fn find_pid(container_id: &str) -> RuntimeResult<i32> {
    enumerator::list_running()?
        .into_iter()
        .find(|c| c.container_id == container_id)
        .map(|c| c.pid)
        .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {}", container_id)))
}

/// Opens all five namespace files before entering any of them: a partial
/// `setns` sequence would leave the process straddling namespaces with no
/// clean way back.
fn open_ns_files(pid: i32) -> RuntimeResult<Vec<(RawFd, CloneFlags)>> {
    let base = format!("/proc/{}/ns", pid);
    let mut fds = Vec::with_capacity(NS_FILES.len());
    for (name, flag) in NS_FILES {
        let path = format!("{}/{}", base, name);
        let fd = open(path.as_str(), OFlag::O_RDONLY, Mode::empty())?;
        fds.push((fd, flag));
    }
    Ok(fds)
}

pub async fn exec(container_id: &str, cmd: &str, args: &[String]) -> RuntimeResult<()> {
    let pid = find_pid(container_id)?;
    let fds = open_ns_files(pid)?;

    for (fd, flag) in &fds {
        setns(*fd, *flag)?;
    }
    for (fd, _) in fds {
        close(fd)?;
    }

    cgroup::create_cgroups(container_id, false)?;

    let running = enumerator::list_running()?
        .into_iter()
        .find(|c| c.container_id == container_id)
        .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {}", container_id)))?;
    let (name, tag) = registry::parse_image_name(&running.image)?;
    let index = crate::image_store::ImageIndex::load()?;
    let image_hash = index
        .resolve_by_tag(&name, &tag)
        .ok_or_else(|| RuntimeError::NotFound(format!("no such image: {}:{}", name, tag)))?;
    let config = image::load_config(&image_hash)?;

    chroot(Path::new(&paths::container_mnt_path(container_id)))?;
    chdir("/")?;

    let c_cmd = CString::new(cmd).map_err(|_| RuntimeError::Precondition("invalid command".to_string()))?;
    let mut c_args: Vec<CString> = vec![c_cmd.clone()];
    for arg in args {
        c_args.push(
            CString::new(arg.as_str())
                .map_err(|_| RuntimeError::Precondition("invalid argument".to_string()))?,
        );
    }
    let env: Vec<CString> = config
        .config
        .env
        .iter()
        .map(|e| CString::new(e.as_str()).expect("env has no interior nul"))
        .collect();

    execve(&c_cmd, &c_args, &env)?;
    Ok(())
}
