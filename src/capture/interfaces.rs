//! Interface discovery using the pnet library.

use std::fmt;

use macaddr::MacAddr6;
use pnet::datalink::{self, NetworkInterface};

/// A network interface as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr6>,
    pub is_up: bool,
    pub is_loopback: bool,
    pub addresses: Vec<String>,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            index: iface.index,
            mac: iface.mac.map(|mac| MacAddr6::from(mac.octets())),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
            addresses: iface.ips.iter().map(|ip| ip.to_string()).collect(),
        }
    }
}

impl fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_up { "UP" } else { "DOWN" };
        let mac = self
            .mac
            .map(|mac| mac.to_string())
            .unwrap_or_else(|| "no MAC".to_string());
        let ips = if self.addresses.is_empty() {
            "no IP".to_string()
        } else {
            self.addresses.join(", ")
        };
        write!(f, "{}: {} {} [{}]", self.name, status, mac, ips)
    }
}

/// List all available network interfaces.
pub fn list_interfaces() -> Vec<InterfaceInfo> {
    datalink::interfaces().iter().map(InterfaceInfo::from).collect()
}

/// Look up one interface by name.
pub fn find_interface(name: &str) -> Option<InterfaceInfo> {
    datalink::interfaces()
        .iter()
        .find(|iface| iface.name == name)
        .map(InterfaceInfo::from)
}
