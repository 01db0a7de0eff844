use std::net::Ipv4Addr;

use if_addrs::IfAddr;
use tracing::{error, trace};

/// An IPv4 address of a local network interface
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl NetworkInterface {
    /// the directed broadcast address for an address and its netmask
    pub fn derived_broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(address.to_bits() | !netmask.to_bits())
    }
}

/// Lists the IPv4 addresses of all local network interfaces. An interface with several
///  addresses is listed once per address. Enumeration failures are logged and result in an
///  empty list.
pub fn get_interfaces() -> Vec<NetworkInterface> {
    let raw = match if_addrs::get_if_addrs() {
        Ok(raw) => raw,
        Err(e) => {
            error!("failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    raw.into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(NetworkInterface {
                broadcast: v4.broadcast
                    .unwrap_or_else(|| NetworkInterface::derived_broadcast(v4.ip, v4.netmask)),
                name: iface.name,
                address: v4.ip,
                netmask: v4.netmask,
            }),
            IfAddr::V6(_) => None,
        })
        .inspect(|iface| trace!("found network interface {:?}", iface))
        .collect()
}

/// the first IPv4 address of the interface with the given name
pub fn find_interface(name: &str) -> Option<NetworkInterface> {
    get_interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
}
