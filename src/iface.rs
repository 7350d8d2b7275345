//! Network interface lookup
//!
//! Thin wrapper over interface enumeration used by the DHCP client (to
//! notice address changes and to source DHCPINFORM frames) and by the
//! dialer (to bind outbound sockets to a named interface).

use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

use crate::error::{Error, Result};

/// IPv4 address and netmask of a named interface.
pub fn pick_ipv4(name: &str) -> Result<(Ipv4Addr, Option<Ipv4Addr>)> {
    let iface = find(name)?;
    for addr in &iface.addr {
        if let Addr::V4(v4) = addr {
            return Ok((v4.ip, v4.netmask));
        }
    }
    Err(Error::Config(format!(
        "interface '{}' has no IPv4 address",
        name
    )))
}

/// Hardware address of a named interface.
pub fn mac_addr(name: &str) -> Result<[u8; 6]> {
    let iface = find(name)?;
    iface
        .mac_addr
        .as_deref()
        .and_then(parse_mac)
        .ok_or_else(|| Error::Config(format!("interface '{}' has no MAC address", name)))
}

fn find(name: &str) -> Result<NetworkInterface> {
    NetworkInterface::show()
        .map_err(|e| Error::Config(format!("enumerating interfaces: {}", e)))?
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| Error::Config(format!("interface '{}' not found", name)))
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}
