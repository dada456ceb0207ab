//! SSDP discovery of Internet Gateway Devices

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use xmltree::{Element, XMLNode};

use super::{DiscoveredIgd, IgdDiscoverer, IgdStatus, SoapIgd};
use crate::nat::error::{NatResult, UpnpError};
use crate::nat::route::local_address_towards;
use crate::protocol::constants::{SSDP_MULTICAST_ADDR, SSDP_PORT};

const SEARCH_TARGETS: [&str; 2] = [
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:2",
];

const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Multicast (or unicast, for upstream hops) SSDP discovery
#[derive(Debug, Clone)]
pub struct SsdpDiscoverer {
    http: reqwest::Client,
}

impl SsdpDiscoverer {
    pub fn new() -> NatResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DESCRIPTION_TIMEOUT)
            .build()
            .map_err(UpnpError::from)?;
        Ok(Self { http })
    }

    /// Collect `LOCATION` URLs from SSDP responses until the window closes
    async fn search(&self, target: Option<Ipv4Addr>, window: Duration) -> NatResult<Vec<String>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let destination = SocketAddrV4::new(target.unwrap_or(SSDP_MULTICAST_ADDR), SSDP_PORT);
        let mx = window.as_secs().clamp(1, 5);

        for st in SEARCH_TARGETS {
            let request = format!(
                "M-SEARCH * HTTP/1.1\r\n\
                 HOST: {}:{}\r\n\
                 ST: {}\r\n\
                 MAN: \"ssdp:discover\"\r\n\
                 MX: {}\r\n\r\n",
                SSDP_MULTICAST_ADDR, SSDP_PORT, st, mx
            );
            socket.send_to(request.as_bytes(), destination).await?;
        }

        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();
        let mut locations = Vec::new();
        let mut buf = vec![0u8; 2048];

        while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
            let (size, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    debug!("SSDP receive failed: {}", e);
                    break;
                }
            };

            let response = String::from_utf8_lossy(&buf[..size]);
            if let Some(location) = parse_ssdp_location(&response) {
                if seen.insert(location.clone()) {
                    debug!("SSDP response from {}: {}", from, location);
                    locations.push(location);
                }
            }

            // A targeted query only ever has one device to hear from
            if target.is_some() && !locations.is_empty() {
                break;
            }
        }

        Ok(locations)
    }

    /// Fetch a device description and build a control client for its WAN service
    async fn describe(&self, location: &str) -> Result<(SoapIgd, SocketAddrV4), UpnpError> {
        let xml = self.http.get(location).send().await?.text().await?;
        let root = Element::parse(xml.as_bytes())?;

        let (control_path, service_type) = find_wan_service(&root)
            .ok_or_else(|| UpnpError::InvalidResponse("no WAN connection service".to_string()))?;

        let base = root
            .get_child("URLBase")
            .and_then(|b| b.get_text())
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| location.to_string());

        let control_url = resolve_url(&base, &control_path)
            .ok_or_else(|| UpnpError::InvalidResponse(format!("bad control URL {}", control_path)))?;
        let device_addr = host_addr(&control_url)
            .ok_or_else(|| UpnpError::InvalidResponse(format!("bad control host {}", control_url)))?;

        Ok((SoapIgd::new(control_url, service_type)?, device_addr))
    }
}

#[async_trait]
impl IgdDiscoverer for SsdpDiscoverer {
    async fn discover(
        &self,
        target: Option<Ipv4Addr>,
        window: Duration,
    ) -> NatResult<Option<DiscoveredIgd>> {
        let locations = self.search(target, window).await?;
        info!(
            "UPnP discovery on {} found {} device(s)",
            target.map_or_else(|| "local network".to_string(), |t| t.to_string()),
            locations.len()
        );

        if locations.is_empty() {
            return Ok(None);
        }

        let mut fallback = None;

        for location in &locations {
            let (igd, device_addr) = match self.describe(location).await {
                Ok(found) => found,
                Err(e) => {
                    debug!("Skipping UPnP device at {}: {}", location, e);
                    continue;
                }
            };

            let local_address = match local_address_towards(device_addr).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Cannot determine local address towards {}: {}", device_addr, e);
                    continue;
                }
            };

            let status = match igd.status().await {
                Ok(status) => status,
                Err(e) => {
                    debug!("GetStatusInfo failed on {}: {}", igd.control_url(), e);
                    IgdStatus::Disconnected
                }
            };

            info!(
                "UPnP IGD at {} ({}) is {:?}, local address {}",
                igd.control_url(),
                igd.service_type(),
                status,
                local_address
            );

            let discovered = DiscoveredIgd {
                control: Box::new(igd),
                local_address,
                status,
            };

            if status == IgdStatus::Connected {
                return Ok(Some(discovered));
            }
            if fallback.is_none() {
                fallback = Some(discovered);
            }
        }

        if fallback.is_none() {
            info!("No UPnP IGD found among discovered devices");
        }
        Ok(fallback)
    }
}

fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// `(controlURL, serviceType)` of the first WANIPConnection/WANPPPConnection service
fn find_wan_service(root: &Element) -> Option<(String, String)> {
    let device = root.get_child("device")?;
    find_wan_service_in_device(device)
}

fn find_wan_service_in_device(device: &Element) -> Option<(String, String)> {
    if let Some(services) = device.get_child("serviceList") {
        for service in child_elements(services).filter(|e| e.name == "service") {
            let Some(service_type) = service.get_child("serviceType").and_then(|s| s.get_text()) else {
                continue;
            };
            let service_type = service_type.trim();
            if service_type.contains("WANIPConnection") || service_type.contains("WANPPPConnection") {
                let control_url = service.get_child("controlURL")?.get_text()?;
                return Some((control_url.trim().to_string(), service_type.to_string()));
            }
        }
    }

    // IGDs nest WANDevice -> WANConnectionDevice
    let embedded = device.get_child("deviceList")?;
    child_elements(embedded)
        .filter(|e| e.name == "device")
        .find_map(find_wan_service_in_device)
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

/// `scheme://host[:port]` prefix of an absolute URL
fn url_origin(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")? + 3;
    let path_start = url[scheme_end..].find('/').map_or(url.len(), |i| scheme_end + i);
    Some(&url[..path_start])
}

fn resolve_url(base: &str, path: &str) -> Option<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Some(path.to_string());
    }
    let origin = url_origin(base)?;
    if path.starts_with('/') {
        Some(format!("{}{}", origin, path))
    } else {
        Some(format!("{}/{}", origin, path))
    }
}

fn host_addr(url: &str) -> Option<SocketAddrV4> {
    let origin = url_origin(url)?;
    let authority = &origin[origin.find("://")? + 3..];
    if let Ok(addr) = authority.parse::<SocketAddrV4>() {
        return Some(addr);
    }
    authority.parse::<Ipv4Addr>().ok().map(|ip| SocketAddrV4::new(ip, 80))
}
