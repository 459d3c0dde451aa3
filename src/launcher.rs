//! The container launcher (C7): the multi-stage self-re-exec protocol that
//! carries a process from host context into an isolated container.
//!
//! `run` does host-side setup, then re-execs `/proc/self/exe` three times:
//! once per subcommand (`setup-netns`, `setup-veth`) as an ordinary child
//! process, and once more (`child-mode`) inside a `clone()` with the
//! isolating namespace flags set, because `CLONE_NEWPID`/`CLONE_NEWNS` only
//! take effect for processes *created* with those flags - unsharing them
//! after the fact doesn't move the calling process into the new namespace.
use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::process::Command;

use log::info;
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, chroot, execv, sethostname};

use crate::cgroup;
use crate::error::{RuntimeError, RuntimeResult};
use crate::image;
use crate::network;
use crate::overlay;
use crate::paths;

const RESOLV_CONF_CANDIDATES: [&str; 3] = [
    "/var/run/systemd/resolve/resolv.conf",
    "/etc/rockcrateresolv.conf",
    "/etc/resolv.conf",
];

fn create_container_id() -> String {
    let random_bytes = rand::random::<[u8; 6]>();
    hex::encode(random_bytes)
}

fn create_container_directories(container_id: &str) -> RuntimeResult<()> {
    for dir in [
        paths::container_mnt_path(container_id),
        paths::container_upper_path(container_id),
        paths::container_work_path(container_id),
    ] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn self_exe() -> RuntimeResult<String> {
    fs::read_link("/proc/self/exe")
        .map(|p| p.to_string_lossy().to_string())
        .map_err(RuntimeError::Io)
}

/// Stage 1, driven by the CLI's `run` subcommand.
pub async fn run(
    mem: i64,
    swap: i64,
    pids: i64,
    cpus: f64,
    image_ref: &str,
    cmd: &str,
    args: &[String],
) -> RuntimeResult<()> {
    network::ensure_bridge().await?;

    let container_id = create_container_id();
    info!("new container ID: {}", container_id);

    let image_hash = image::ensure_image(image_ref).await?;
    info!("image to overlay mount: {}", image_hash);

    create_container_directories(&container_id)?;
    overlay::mount_overlay(&container_id, &image_hash)?;
    network::create_host_veth(&container_id).await?;

    let exe = self_exe()?;

    let status = Command::new(&exe)
        .args(["setup-netns", &container_id])
        .status()?;
    if !status.success() {
        return Err(RuntimeError::Registry(
            "setup-netns stage failed".to_string(),
        ));
    }

    let status = Command::new(&exe)
        .args(["setup-veth", &container_id])
        .status()?;
    if !status.success() {
        return Err(RuntimeError::Registry(
            "setup-veth stage failed".to_string(),
        ));
    }

    spawn_child_mode(&exe, mem, swap, pids, cpus, &image_hash, &container_id, cmd, args)?;

    info!("container done");

    network::unmount_net_ns(&container_id)?;
    overlay::umount_overlay(&container_id)?;
    cgroup::remove_cgroups(&container_id)?;
    fs::remove_dir_all(paths::container_base_path(&container_id))?;

    Ok(())
}

/// Builds the `child-mode` argv and runs it in a freshly-cloned process with
/// `CLONE_NEWPID | CLONE_NEWNS | CLONE_NEWUTS | CLONE_NEWIPC`, then waits for
/// it to exit.
fn spawn_child_mode(
    exe: &str,
    mem: i64,
    swap: i64,
    pids: i64,
    cpus: f64,
    image_hash: &str,
    container_id: &str,
    cmd: &str,
    args: &[String],
) -> RuntimeResult<()> {
    let mut argv: Vec<String> = vec![exe.to_string(), "child-mode".to_string()];
    if mem > 0 {
        argv.push(format!("--mem={}", mem));
    }
    if swap >= 0 {
        argv.push(format!("--swap={}", swap));
    }
    if pids > 0 {
        argv.push(format!("--pids={}", pids));
    }
    if cpus > 0.0 {
        argv.push(format!("--cpus={}", cpus));
    }
    argv.push(format!("--img={}", image_hash));
    argv.push(container_id.to_string());
    argv.push(cmd.to_string());
    argv.extend(args.iter().cloned());

    let c_exe = CString::new(exe).expect("exe path has no interior nul");
    let c_argv: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_str()).expect("argv has no interior nul"))
        .collect();

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let child_body = move || -> isize {
        match execv(&c_exe, &c_argv) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    };

    let clone_flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;

    let pid = unsafe {
        clone(
            Box::new(child_body),
            &mut stack,
            clone_flags,
            Some(Signal::SIGCHLD as i32),
        )
    }?;

    waitpid(pid, None)?;
    Ok(())
}

/// Stage 2 (`setup-netns <id>`).
pub async fn setup_netns(container_id: &str) -> RuntimeResult<()> {
    network::create_net_ns(container_id)
}

/// Stage 3 (`setup-veth <id>`): move the container-side veth into the
/// namespace, then join it to configure the address and route from inside.
pub async fn setup_veth(container_id: &str) -> RuntimeResult<()> {
    network::move_veth_into_ns(container_id).await?;
    network::join_net_ns(container_id)?;
    network::configure_container_veth(container_id).await
}

pub struct ChildModeArgs {
    pub mem: i64,
    pub swap: i64,
    pub pids: i64,
    pub cpus: f64,
    pub image_hash: String,
    pub container_id: String,
    pub cmd: String,
    pub args: Vec<String>,
}

/// Stage 4 (`child-mode`): runs inside the freshly-cloned PID/mount/UTS/IPC
/// namespaces. Joins the container's net-ns, sets up cgroups for itself (so
/// the exec'd command inherits the accounting), chroots, mounts the
/// in-container pseudo-filesystems, and execs the user command.
pub async fn child_mode(opts: ChildModeArgs) -> RuntimeResult<()> {
    let mnt_path = paths::container_mnt_path(&opts.container_id);
    let config = image::load_config(&opts.image_hash)?;

    sethostname(&opts.container_id)?;
    network::join_net_ns(&opts.container_id)?;

    cgroup::create_cgroups(&opts.container_id, true)?;
    cgroup::configure_cgroups(&opts.container_id, opts.mem, opts.swap, opts.pids, opts.cpus)?;

    copy_nameserver_config(&opts.container_id)?;

    chroot(Path::new(&mnt_path))?;
    chdir("/")?;

    mount_pseudo_filesystems()?;
    network::setup_loopback().await?;

    exec_user_command(&opts.cmd, &opts.args, &config)?;

    unmount_pseudo_filesystems();
    Ok(())
}

fn copy_nameserver_config(container_id: &str) -> RuntimeResult<()> {
    let dst = format!("{}/etc/resolv.conf", paths::container_mnt_path(container_id));
    for candidate in RESOLV_CONF_CANDIDATES {
        if Path::new(candidate).exists() {
            if let Some(parent) = Path::new(&dst).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(candidate, &dst)?;
            return Ok(());
        }
    }
    Ok(())
}

fn mount_pseudo_filesystems() -> RuntimeResult<()> {
    fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    fs::create_dir_all("/dev/pts")?;
    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    fs::create_dir_all("/sys")?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    Ok(())
}

fn unmount_pseudo_filesystems() {
    for path in ["/dev/pts", "/dev", "/sys", "/proc", "/tmp"] {
        let _ = umount(path);
    }
}

fn exec_user_command(
    cmd: &str,
    args: &[String],
    config: &crate::manifest::ImageConfig,
) -> RuntimeResult<()> {
    let c_cmd = CString::new(cmd).map_err(|_| RuntimeError::Precondition("invalid command".to_string()))?;
    let mut c_args: Vec<CString> = vec![c_cmd.clone()];
    for arg in args {
        c_args.push(CString::new(arg.as_str()).map_err(|_| {
            RuntimeError::Precondition("invalid argument".to_string())
        })?);
    }

    let env: Vec<CString> = config
        .config
        .env
        .iter()
        .map(|e| CString::new(e.as_str()).expect("env has no interior nul"))
        .collect();

    nix::unistd::execve(&c_cmd, &c_args, &env)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_is_twelve_lowercase_hex_chars() {
        let id = create_container_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
