//! Address classification helpers used by the hop walk and the WoL mappings

use std::net::Ipv4Addr;

/// (network, mask) pairs of the ranges that sit behind some NAT
const NAT_RANGES: [(u32, u32); 4] = [
    (0x0A00_0000, 0xFF00_0000), // 10.0.0.0/8
    (0xAC10_0000, 0xFFF0_0000), // 172.16.0.0/12
    (0xC0A8_0000, 0xFFFF_0000), // 192.168.0.0/16
    (0x6440_0000, 0xFFC0_0000), // 100.64.0.0/10, RFC 6598 shared CGN space
];

/// True if `addr` is a private (RFC 1918) or shared (RFC 6598) address,
/// meaning whoever owns it is very likely behind another NAT.
pub fn is_likely_nat(addr: impl Into<u32>) -> bool {
    let addr = addr.into();
    NAT_RANGES
        .iter()
        .any(|&(network, mask)| addr & mask == network)
}

/// Directed broadcast address of the subnet `local` lives in
pub fn broadcast_address(local: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let prefix_len = prefix_len.min(32);
    let netmask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    };
    Ipv4Addr::from(u32::from(local) | !netmask)
}

/// Prefix length of a contiguous netmask, `None` for non-contiguous masks
pub fn prefix_length(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return None;
    }
    Some(ones as u8)
}
