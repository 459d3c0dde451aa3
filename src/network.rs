//! The network fabric (C5): one host bridge, a veth pair and a bind-mounted
//! network namespace per container. Link/address/route plumbing goes through
//! `rtnetlink`; namespace creation and entry are raw `nix` syscalls, because
//! those steps run as distinct processes in the self-re-exec protocol (C7)
//! rather than as async tasks.
use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use futures::TryStreamExt;
use log::{info, warn};
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use rand::Rng;
use rtnetlink::{new_connection, Handle};

use crate::error::{RuntimeError, RuntimeResult};
use crate::paths;

const BRIDGE_NAME: &str = "rockcrate0";
const BRIDGE_ADDRESS: &str = "172.29.0.1";
const NETWORK_PREFIX: u8 = 16;

fn veth_host_name(container_id: &str) -> String {
    format!("veth0_{}", &container_id[0..6])
}

fn veth_container_name(container_id: &str) -> String {
    format!("veth1_{}", &container_id[0..6])
}

fn create_mac_address() -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac[0] = 0x02;
    mac[1] = 0x42;
    rand::thread_rng().fill(&mut mac[2..]);
    mac
}

fn create_ip_address() -> IpAddr {
    let mut rng = rand::thread_rng();
    let b1: u8 = rng.gen_range(1..254);
    let b2: u8 = rng.gen_range(1..254);
    format!("172.29.{}.{}", b1, b2).parse().expect("valid ipv4")
}

async fn connection() -> RuntimeResult<Handle> {
    let (connection, handle, _) =
        new_connection().map_err(|e| RuntimeError::Registry(e.to_string()))?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn find_link_index(handle: &Handle, name: &str) -> RuntimeResult<Option<u32>> {
    let mut links = handle.link().get().set_name_filter(name.to_string()).execute();
    match links
        .try_next()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?
    {
        Some(link) => Ok(Some(link.header.index)),
        None => Ok(None),
    }
}

async fn set_link_up(handle: &Handle, name: &str) -> RuntimeResult<()> {
    let index = find_link_index(handle, name)
        .await?
        .ok_or_else(|| RuntimeError::NotFound(format!("link not found: {}", name)))?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;
    Ok(())
}

/// Creates the `rockcrate0` bridge and assigns `172.29.0.1/16` if it doesn't
/// already exist, then brings it up either way.
pub async fn ensure_bridge() -> RuntimeResult<()> {
    let handle = connection().await?;

    if find_link_index(&handle, BRIDGE_NAME).await?.is_some() {
        info!("{} (bridge) already exists", BRIDGE_NAME);
        set_link_up(&handle, BRIDGE_NAME).await?;
        return Ok(());
    }

    handle
        .link()
        .add()
        .bridge(BRIDGE_NAME.to_string())
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    let index = find_link_index(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| RuntimeError::Registry("failed to create bridge".to_string()))?;

    let bridge_ip: Ipv4Addr = BRIDGE_ADDRESS.parse().expect("valid ipv4");
    handle
        .address()
        .add(index, IpAddr::V4(bridge_ip), NETWORK_PREFIX)
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    set_link_up(&handle, BRIDGE_NAME).await?;
    Ok(())
}

/// Creates the host-side half of a container's veth pair and attaches it to
/// the bridge. The container-side half stays on the host until the launcher
/// moves it into the container's net-ns in a later stage.
pub async fn create_host_veth(container_id: &str) -> RuntimeResult<()> {
    let handle = connection().await?;
    let host_name = veth_host_name(container_id);
    let container_name = veth_container_name(container_id);

    handle
        .link()
        .add()
        .veth(host_name.clone(), container_name)
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    set_link_up(&handle, &host_name).await?;

    let host_index = find_link_index(&handle, &host_name)
        .await?
        .ok_or_else(|| RuntimeError::NotFound(format!("link not found: {}", host_name)))?;
    let mac = create_mac_address();
    let _ = handle.link().set(host_index).address(mac.to_vec()).execute().await;

    let bridge_index = find_link_index(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| RuntimeError::NotFound(format!("link not found: {}", BRIDGE_NAME)))?;
    handle
        .link()
        .set(host_index)
        .master(bridge_index)
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    Ok(())
}

/// Stage 2 of the self-re-exec protocol (`setup-netns`): creates a fresh net
/// namespace and pins it with a bind mount so later stages can re-enter it
/// by container id, then returns the caller to its original namespace.
pub fn create_net_ns(container_id: &str) -> RuntimeResult<()> {
    let bind_target = paths::net_ns_bind_path(container_id);
    let bind_file = open(
        bind_target.as_str(),
        OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::from_bits_truncate(0o644),
    )?;
    close(bind_file)?;

    let original_ns = open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())?;

    unshare(CloneFlags::CLONE_NEWNET)?;

    mount(
        Some("/proc/self/ns/net"),
        Path::new(&bind_target),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;

    setns(original_ns, CloneFlags::CLONE_NEWNET)?;
    close(original_ns)?;

    Ok(())
}

/// Stage 3 of the self-re-exec protocol (`setup-veth`): moves the
/// container-side veth into the namespace created in stage 2.
pub async fn move_veth_into_ns(container_id: &str) -> RuntimeResult<()> {
    let handle = connection().await?;
    let name = veth_container_name(container_id);
    let index = find_link_index(&handle, &name)
        .await?
        .ok_or_else(|| RuntimeError::NotFound(format!("link not found: {}", name)))?;

    let ns_file = OpenOptions::new()
        .read(true)
        .open(paths::net_ns_bind_path(container_id))?;

    handle
        .link()
        .set(index)
        .setns_by_fd(ns_file.as_raw_fd())
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    Ok(())
}

/// Must be called from inside the container's net namespace (i.e. after
/// `join_net_ns`): assigns a random `172.29.x.y/16` address, brings the
/// interface up and installs a default route via the bridge.
pub async fn configure_container_veth(container_id: &str) -> RuntimeResult<()> {
    let handle = connection().await?;
    let name = veth_container_name(container_id);
    let index = find_link_index(&handle, &name)
        .await?
        .ok_or_else(|| RuntimeError::NotFound(format!("link not found: {}", name)))?;

    let ip = create_ip_address();
    info!("container's IP address is {}", ip);
    handle
        .address()
        .add(index, ip, NETWORK_PREFIX)
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    set_link_up(&handle, &name).await?;

    let gateway: Ipv4Addr = BRIDGE_ADDRESS.parse().expect("valid ipv4");
    handle
        .route()
        .add()
        .v4()
        .destination_prefix("0.0.0.0".parse().expect("valid ipv4"), 0)
        .gateway(gateway)
        .execute()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    Ok(())
}

/// Brings up `lo` with `127.0.0.1/32`. Looked up by enumerating all links and
/// matching on name, because by-name lookup for loopback is unreliable.
pub async fn setup_loopback() -> RuntimeResult<()> {
    let handle = connection().await?;
    let mut links = handle.link().get().execute();
    while let Some(link) = links
        .try_next()
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?
    {
        use rtnetlink::packet::rtnl::link::nlas::Nla;
        let is_lo = link.nlas.iter().any(|nla| matches!(nla, Nla::IfName(name) if name == "lo"));
        if !is_lo {
            continue;
        }
        let index = link.header.index;
        let loopback: Ipv4Addr = "127.0.0.1".parse().expect("valid ipv4");
        if let Err(e) = handle
            .address()
            .add(index, IpAddr::V4(loopback), 32)
            .execute()
            .await
        {
            warn!("unable to configure loopback interface: {}", e);
        }
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| RuntimeError::Registry(e.to_string()))?;
        return Ok(());
    }
    warn!("link not found: lo");
    Ok(())
}

/// Enters the container's net namespace from the current process.
pub fn join_net_ns(container_id: &str) -> RuntimeResult<()> {
    let bind_target = paths::net_ns_bind_path(container_id);
    let fd = open(bind_target.as_str(), OFlag::O_RDONLY, Mode::empty())?;
    unshare(CloneFlags::CLONE_NEWNET)?;
    setns(fd, CloneFlags::CLONE_NEWNET)?;
    close(fd)?;
    Ok(())
}

/// Unmounts and removes the net-ns bind mount file created by `create_net_ns`.
pub fn unmount_net_ns(container_id: &str) -> RuntimeResult<()> {
    let bind_target = paths::net_ns_bind_path(container_id);
    nix::mount::umount(Path::new(&bind_target))?;
    std::fs::remove_file(&bind_target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_use_first_six_hex_chars_of_the_id() {
        let id = "aabbccddeeff";
        assert_eq!(veth_host_name(id), "veth0_aabbcc");
        assert_eq!(veth_container_name(id), "veth1_aabbcc");
    }

    #[test]
    fn mac_address_uses_locally_administered_prefix() {
        let mac = create_mac_address();
        assert_eq!(mac[0], 0x02);
        assert_eq!(mac[1], 0x42);
    }

    #[test]
    fn ip_address_is_in_the_container_subnet() {
        let ip = create_ip_address();
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                assert_eq!(octets[0], 172);
                assert_eq!(octets[1], 29);
            }
            _ => panic!("expected ipv4"),
        }
    }
}
