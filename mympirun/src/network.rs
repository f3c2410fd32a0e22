use crate::flavor::Flavor;
use itertools::Itertools;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    net::{IpAddr, Ipv4Addr, ToSocketAddrs},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Logical interconnect, in order of preference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    Ib,
    Det,
    Shm,
    Socket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetmaskType {
    Ib,
    Eth,
}

static IB_INTERFACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ib").expect("static regex"));
static ETH_INTERFACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:eth|em|en|bond|p\d)").expect("static regex"));

impl Device {
    pub const ORDER: [Device; 4] = [Device::Ib, Device::Det, Device::Shm, Device::Socket];

    /// device node proving the interconnect is present, sockets always are
    pub const fn location(&self) -> Option<&'static str> {
        match self {
            Self::Ib => Some("/dev/infiniband"),
            Self::Det => Some("/dev/det"),
            Self::Shm => Some("/dev/shm"),
            Self::Socket => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ib => "ib",
            Self::Det => "det",
            Self::Shm => "shm",
            Self::Socket => "socket",
        }
    }

    pub const fn netmask_type(&self) -> NetmaskType {
        match self {
            Self::Ib => NetmaskType::Ib,
            _ => NetmaskType::Eth,
        }
    }
}

impl NetmaskType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ib => "ib",
            Self::Eth => "eth",
        }
    }

    pub fn matches(&self, interface: &str) -> bool {
        match self {
            Self::Ib => IB_INTERFACE.is_match(interface),
            Self::Eth => ETH_INTERFACE.is_match(interface),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Flavor {flavor} has no mapping for device {device}")]
    UnmappedDevice {
        flavor: &'static str,
        device: &'static str,
    },
    #[error("Failed to list network interfaces")]
    Interfaces(#[from] network_interface::Error),
    #[error("No {0} interface with an IPv4 netmask found")]
    NoNetmask(&'static str),
    #[error("None of the nodes {0:?} is bound to a local interface")]
    NoLocalhost(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSelection {
    pub device: Device,
    /// flavor specific spelling of `device`
    pub mpidevice: &'static str,
    pub netmasktype: NetmaskType,
}

/// Pick the interconnect for this run, probing the device nodes of this host.
pub fn select_device(
    flavor: &Flavor,
    forced: Option<Device>,
    nr_unique_nodes: usize,
) -> Result<DeviceSelection, DeviceError> {
    select_device_with(flavor, forced, nr_unique_nodes, |location| Path::new(location).exists())
}

#[instrument(skip(flavor, exists), fields(flavor = flavor.name), level = "debug")]
pub fn select_device_with<F>(
    flavor: &Flavor,
    forced: Option<Device>,
    nr_unique_nodes: usize,
    exists: F,
) -> Result<DeviceSelection, DeviceError>
where
    F: Fn(&str) -> bool,
{
    let device = match forced {
        Some(device) => {
            debug!(device = device.as_str(), "Using forced device");
            device
        }
        None => Device::ORDER
            .into_iter()
            .filter(|device| *device != Device::Shm || nr_unique_nodes == 1)
            .find(|device| device.location().map_or(true, &exists))
            .unwrap_or(Device::Socket),
    };

    let mpidevice = flavor.device(device).ok_or(DeviceError::UnmappedDevice {
        flavor: flavor.name,
        device: device.as_str(),
    })?;

    info!(device = device.as_str(), mpidevice = mpidevice, "Selected device");

    Ok(DeviceSelection {
        device,
        mpidevice,
        netmasktype: device.netmask_type(),
    })
}

/// IPv4 view of one host interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ipv4: Vec<(Ipv4Addr, Option<Ipv4Addr>)>,
}

pub fn list_interfaces() -> Result<Vec<Interface>, DeviceError> {
    let interfaces = NetworkInterface::show()?
        .into_iter()
        .map(|iface| Interface {
            ipv4: iface
                .addr
                .iter()
                .filter_map(|addr| match addr {
                    Addr::V4(V4IfAddr { ip, netmask, .. }) => Some((*ip, *netmask)),
                    Addr::V6(_) => None,
                })
                .collect(),
            name: iface.name,
        })
        .collect_vec();

    debug!(interfaces = ?interfaces, "Host interfaces");
    Ok(interfaces)
}

fn network(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// `network/netmask` of every matching interface, unique and joined by `:`
pub fn set_netmask(interfaces: &[Interface], netmasktype: NetmaskType) -> Result<String, DeviceError> {
    let netmask = interfaces
        .iter()
        .filter(|iface| netmasktype.matches(&iface.name))
        .flat_map(|iface| iface.ipv4.iter())
        .filter_map(|(ip, mask)| mask.map(|mask| format!("{}/{}", network(*ip, mask), mask)))
        .unique()
        .join(":");

    if netmask.is_empty() {
        return Err(DeviceError::NoNetmask(netmasktype.as_str()));
    }

    debug!(netmask = %netmask, "Netmask");
    Ok(netmask)
}

fn resolve_host(node: &str) -> Vec<IpAddr> {
    match (node, 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
        Err(error) => {
            debug!(error = ?error, node = node, "Failed to resolve node");
            Vec::new()
        }
    }
}

/// `(node, interface)` pairs for the nodes that live on this host
pub fn get_localhosts(
    nodes: &[String],
    interfaces: &[Interface],
    hostname: &str,
) -> Vec<(String, String)> {
    get_localhosts_with(nodes, interfaces, hostname, resolve_host)
}

pub fn get_localhosts_with<F>(
    nodes: &[String],
    interfaces: &[Interface],
    hostname: &str,
    resolve: F,
) -> Vec<(String, String)>
where
    F: Fn(&str) -> Vec<IpAddr>,
{
    let mut pairs = Vec::new();

    for node in nodes.iter().unique() {
        let addresses = resolve(node);
        for iface in interfaces {
            let bound = iface.ipv4.iter().any(|(ip, _)| {
                addresses.contains(&IpAddr::V4(*ip)) || (node == hostname && !ip.is_loopback())
            });
            if bound {
                pairs.push((node.clone(), iface.name.clone()));
            }
        }
    }

    pairs
}

/// node and interface mpdboot should bind to on this host
pub fn set_mpdboot_localhost_interface(
    nodes: &[String],
    localhosts: &[(String, String)],
) -> Result<(String, String), DeviceError> {
    match localhosts {
        [] => Err(DeviceError::NoLocalhost(nodes.iter().unique().cloned().collect())),
        [first, rest @ ..] => {
            if !rest.is_empty() {
                warn!(
                    localhosts = ?localhosts,
                    "Multiple localhost interfaces found, using the first one"
                );
            }
            Ok(first.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{Flavor, UNTYPED};

    fn iface(name: &str, ip: [u8; 4], mask: [u8; 4]) -> Interface {
        Interface {
            name: name.to_string(),
            ipv4: vec![(Ipv4Addr::from(ip), Some(Ipv4Addr::from(mask)))],
        }
    }

    #[test]
    fn prefers_infiniband_when_present() {
        let flavor = Flavor::by_name("impirun").unwrap();
        let selection = select_device_with(flavor, None, 2, |_| true).unwrap();
        assert_eq!(selection.device, Device::Ib);
        assert_eq!(selection.mpidevice, "rdssm");
        assert_eq!(selection.netmasktype, NetmaskType::Ib);
    }

    #[test]
    fn shm_only_for_single_node() {
        let only_shm = |location: &str| location == "/dev/shm";

        let single = select_device_with(&UNTYPED, None, 1, only_shm).unwrap();
        assert_eq!(single.device, Device::Shm);

        let multi = select_device_with(&UNTYPED, None, 3, only_shm).unwrap();
        assert_eq!(multi.device, Device::Socket);
        assert_eq!(multi.netmasktype, NetmaskType::Eth);
    }

    #[test]
    fn forced_device_wins() {
        let selection = select_device_with(&UNTYPED, Some(Device::Socket), 1, |_| true).unwrap();
        assert_eq!(selection.mpidevice, "socket");
    }

    #[test]
    fn netmask_of_matching_interfaces() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], [255, 0, 0, 0]),
            iface("ib0", [10, 141, 3, 7], [255, 255, 0, 0]),
            iface("ib1", [10, 141, 9, 1], [255, 255, 0, 0]),
            iface("eth0", [172, 16, 1, 20], [255, 255, 255, 0]),
        ];

        assert_eq!(
            set_netmask(&interfaces, NetmaskType::Ib).unwrap(),
            "10.141.0.0/255.255.0.0"
        );
        assert_eq!(
            set_netmask(&interfaces, NetmaskType::Eth).unwrap(),
            "172.16.1.0/255.255.255.0"
        );
        assert!(matches!(
            set_netmask(&interfaces[..1], NetmaskType::Eth),
            Err(DeviceError::NoNetmask("eth"))
        ));
    }

    #[test]
    fn localhost_interface() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], [255, 0, 0, 0]),
            iface("eth0", [172, 16, 1, 20], [255, 255, 255, 0]),
        ];
        let nodes = vec!["node1".to_string(), "node2".to_string(), "node1".to_string()];
        let resolve = |node: &str| match node {
            "node1" => vec![IpAddr::V4(Ipv4Addr::new(172, 16, 1, 20))],
            _ => vec![IpAddr::V4(Ipv4Addr::new(172, 16, 1, 21))],
        };

        let localhosts = get_localhosts_with(&nodes, &interfaces, "elsewhere", resolve);
        assert_eq!(localhosts, vec![("node1".to_string(), "eth0".to_string())]);
        assert_eq!(
            set_mpdboot_localhost_interface(&nodes, &localhosts).unwrap(),
            ("node1".to_string(), "eth0".to_string())
        );

        assert!(matches!(
            set_mpdboot_localhost_interface(&nodes, &[]),
            Err(DeviceError::NoLocalhost(unique)) if unique.len() == 2
        ));
    }
}
