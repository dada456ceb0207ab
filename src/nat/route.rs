//! Default route lookup

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::nat::error::{NatError, NatResult};

/// Next hop of the default route and the local address used to reach it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub local_address: Ipv4Addr,
}

#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn default_route(&self) -> NatResult<DefaultRoute>;
}

/// Reads the host routing table
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRoute;

#[async_trait]
impl RouteResolver for SystemRoute {
    async fn default_route(&self) -> NatResult<DefaultRoute> {
        let gateway = default_gateway()
            .await?
            .ok_or_else(|| NatError::NotSupported("No default gateway found".to_string()))?;
        let local_address = local_address_towards(SocketAddrV4::new(gateway, 9)).await?;

        debug!("Default route via {} from {}", gateway, local_address);
        Ok(DefaultRoute {
            gateway,
            local_address,
        })
    }
}

/// Local address the OS would use to reach `peer`. No packet is sent.
pub(crate) async fn local_address_towards(peer: SocketAddrV4) -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(peer).await?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "IPv6 local address",
        )),
    }
}

#[cfg(target_os = "linux")]
async fn default_gateway() -> NatResult<Option<Ipv4Addr>> {
    let table = tokio::fs::read_to_string("/proc/net/route").await?;
    Ok(parse_proc_net_route(&table))
}

#[cfg(target_os = "macos")]
async fn default_gateway() -> NatResult<Option<Ipv4Addr>> {
    let output = tokio::process::Command::new("netstat")
        .args(["-nr", "-f", "inet"])
        .output()
        .await?;
    Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "windows")]
async fn default_gateway() -> NatResult<Option<Ipv4Addr>> {
    let output = tokio::process::Command::new("route")
        .args(["print", "-4"])
        .output()
        .await?;
    Ok(parse_route_print(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn default_gateway() -> NatResult<Option<Ipv4Addr>> {
    Err(NatError::Platform(
        "default route lookup is not implemented on this platform".to_string(),
    ))
}

/// Gateway of the first default route in `/proc/net/route`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 || parts[1] != "00000000" {
            return None;
        }
        // Gateway is in hex, little-endian
        let gateway_hex = u32::from_str_radix(parts[2], 16).ok()?;
        let gateway = Ipv4Addr::from(gateway_hex.swap_bytes());
        (!gateway.is_unspecified()).then_some(gateway)
    })
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_netstat(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| line.split_whitespace().nth(1)?.parse().ok())
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_route_print(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 || parts[0] != "0.0.0.0" || parts[1] != "0.0.0.0" {
            return None;
        }
        parts[2].parse().ok()
    })
}
