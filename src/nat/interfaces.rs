//! Local interface queries backed by `if-addrs`

use std::net::Ipv4Addr;

use if_addrs::IfAddr;

use crate::nat::classify::prefix_length;

/// Subnet prefix length of a local address
pub trait OnLinkPrefixResolver: Send + Sync {
    fn prefix_length_for(&self, local: Ipv4Addr) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IfAddrsPrefixResolver;

impl OnLinkPrefixResolver for IfAddrsPrefixResolver {
    fn prefix_length_for(&self, local: Ipv4Addr) -> Option<u8> {
        let interfaces = if_addrs::get_if_addrs().ok()?;
        interfaces.into_iter().find_map(|iface| match iface.addr {
            IfAddr::V4(v4) if v4.ip == local => prefix_length(v4.netmask),
            _ => None,
        })
    }
}

/// IPv4 configuration of one interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterfaceAddress {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// Sorted view of every non-loopback IPv4 address on the host.
///
/// Two snapshots compare equal when nothing a mapping run depends on changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSnapshot(Vec<InterfaceAddress>);

impl InterfaceSnapshot {
    pub fn capture() -> std::io::Result<Self> {
        let interfaces = if_addrs::get_if_addrs()?;
        Ok(Self::from_addresses(interfaces.into_iter().filter_map(|iface| {
            match iface.addr {
                IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(InterfaceAddress {
                    name: iface.name,
                    address: v4.ip,
                    prefix_len: prefix_length(v4.netmask).unwrap_or(32),
                }),
                _ => None,
            }
        })))
    }

    pub fn from_addresses(addresses: impl IntoIterator<Item = InterfaceAddress>) -> Self {
        let mut addresses: Vec<_> = addresses.into_iter().collect();
        addresses.sort();
        addresses.dedup();
        Self(addresses)
    }

    pub fn addresses(&self) -> &[InterfaceAddress] {
        &self.0
    }
}
