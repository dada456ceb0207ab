//! PCP (RFC 6887) MAP client
//!
//! Only IPv4 mappings are requested. Addresses travel as IPv4-mapped IPv6
//! addresses as the RFC requires.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::nat::error::PcpError;
use crate::protocol::constants::{requested_lifetime, PCP_SERVER_PORT};
use crate::protocol::PortSpec;

const PCP_VERSION: u8 = 2;
const OP_MAP: u8 = 1;
const RESPONSE_BIT: u8 = 0x80;
const OPTION_THIRD_PARTY: u8 = 1;

const HEADER_LEN: usize = 24;
const MAP_BODY_LEN: usize = 36;
const RESPONSE_LEN: usize = HEADER_LEN + MAP_BODY_LEN;

pub const NONCE_LEN: usize = 12;

/// Maps one port for an arbitrary internal address through an arbitrary PCP server
#[async_trait]
pub trait PcpMapper: Send + Sync {
    async fn map_port(
        &self,
        internal: Ipv4Addr,
        target: Ipv4Addr,
        spec: PortSpec,
        enable: bool,
        indefinite: bool,
    ) -> bool;
}

/// Fields of one MAP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub client: Ipv4Addr,
    /// Set when mapping on behalf of a host other than `client`
    pub third_party: Option<Ipv4Addr>,
    pub nonce: [u8; NONCE_LEN],
    pub spec: PortSpec,
    pub suggested_port: u16,
    pub lifetime: u32,
}

/// Successful MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResponse {
    pub lifetime: u32,
    pub epoch: u32,
    pub internal_port: u16,
    pub external_port: u16,
    pub external_address: Ipv4Addr,
}

pub fn encode_map_request(request: &MapRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RESPONSE_LEN + 20);

    buf.put_u8(PCP_VERSION);
    buf.put_u8(OP_MAP);
    buf.put_u16(0); // Reserved
    buf.put_u32(request.lifetime);
    buf.put_slice(&request.client.to_ipv6_mapped().octets());

    buf.put_slice(&request.nonce);
    buf.put_u8(request.spec.transport.iana_number());
    buf.put_slice(&[0u8; 3]);
    buf.put_u16(request.spec.port);
    buf.put_u16(request.suggested_port);
    buf.put_slice(&Ipv4Addr::UNSPECIFIED.to_ipv6_mapped().octets());

    if let Some(internal) = request.third_party {
        buf.put_u8(OPTION_THIRD_PARTY);
        buf.put_u8(0);
        buf.put_u16(16);
        buf.put_slice(&internal.to_ipv6_mapped().octets());
    }

    buf
}

/// Parse a MAP response, returning `Ok(None)` for packets that answer some other request
pub fn decode_map_response(
    packet: &[u8],
    nonce: &[u8; NONCE_LEN],
    spec: PortSpec,
) -> Result<Option<MapResponse>, PcpError> {
    if packet.len() < RESPONSE_LEN {
        return Ok(None);
    }

    let mut buf = packet;
    let version = buf.get_u8();
    let opcode = buf.get_u8();
    if version != PCP_VERSION || opcode != (OP_MAP | RESPONSE_BIT) {
        return Ok(None);
    }
    buf.advance(1);
    let result_code = buf.get_u8();
    let lifetime = buf.get_u32();
    let epoch = buf.get_u32();
    buf.advance(12);

    let mut resp_nonce = [0u8; NONCE_LEN];
    buf.copy_to_slice(&mut resp_nonce);
    let protocol = buf.get_u8();
    buf.advance(3);
    let internal_port = buf.get_u16();
    let external_port = buf.get_u16();
    let mut external = [0u8; 16];
    buf.copy_to_slice(&mut external);

    if &resp_nonce != nonce
        || protocol != spec.transport.iana_number()
        || internal_port != spec.port
    {
        return Ok(None);
    }

    if result_code != 0 {
        return Err(PcpError::from_code(result_code));
    }

    let external_address = Ipv6Addr::from(external)
        .to_ipv4_mapped()
        .ok_or(PcpError::InvalidResponse("external address is not IPv4"))?;

    Ok(Some(MapResponse {
        lifetime,
        epoch,
        internal_port,
        external_port,
        external_address,
    }))
}

/// Deterministic mapping nonce.
///
/// Derived from stable inputs so that a later run, with no saved state, can
/// refresh or delete what an earlier run created.
pub fn mapping_nonce(host_name: &str, internal: Ipv4Addr, spec: PortSpec) -> [u8; NONCE_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(host_name.as_bytes());
    hasher.update(&internal.octets());
    hasher.update(&[spec.transport.iana_number()]);
    hasher.update(&spec.port.to_be_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_LEN]);
    nonce
}

/// PCP client speaking UDP to port 5351 of each target
#[derive(Debug, Clone)]
pub struct PcpClient {
    host_name: String,
    server_port: u16,
    initial_retransmit: Duration,
    max_retries: u32,
}

impl PcpClient {
    pub fn new(host_name: impl Into<String>, initial_retransmit: Duration, max_retries: u32) -> Self {
        Self {
            host_name: host_name.into(),
            server_port: PCP_SERVER_PORT,
            initial_retransmit,
            max_retries: max_retries.max(1),
        }
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        request: &MapRequest,
    ) -> Result<MapResponse, PcpError> {
        let packet = encode_map_request(request);
        let mut delay = self.initial_retransmit;
        let mut buf = [0u8; 1100];

        for attempt in 0..self.max_retries {
            trace!("PCP MAP {} attempt {}", request.spec, attempt + 1);
            socket.send(&packet).await?;

            // RFC 6887 §8.1.1: +/-10% randomization
            let jitter = rand::thread_rng().gen_range(0.9..1.1);
            let deadline = Instant::now() + delay.mul_f64(jitter);

            while let Ok(received) = timeout_at(deadline, socket.recv(&mut buf)).await {
                let size = received?;
                if let Some(response) = decode_map_response(&buf[..size], &request.nonce, request.spec)? {
                    return Ok(response);
                }
            }

            delay *= 2;
        }

        Err(PcpError::NoResponse(self.max_retries))
    }

    async fn try_map(
        &self,
        internal: Ipv4Addr,
        target: Ipv4Addr,
        spec: PortSpec,
        enable: bool,
        indefinite: bool,
    ) -> Result<bool, PcpError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(SocketAddrV4::new(target, self.server_port))
            .await?;
        let client = match socket.local_addr()? {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => return Err(PcpError::InvalidResponse("IPv6 source address")),
        };

        let mut request = MapRequest {
            client,
            third_party: (internal != client).then_some(internal),
            nonce: mapping_nonce(&self.host_name, internal, spec),
            spec,
            suggested_port: spec.port,
            lifetime: requested_lifetime(enable, indefinite),
        };

        debug!(
            "PCP MAP {} for {} via {} (lifetime {}s)",
            spec, internal, target, request.lifetime
        );
        let response = self.exchange(&socket, &request).await?;

        if !enable {
            info!("Deleted PCP mapping for {} on {}", spec, target);
            return Ok(true);
        }

        if response.external_port != spec.port {
            warn!(
                "PCP conflict for {}: {} granted external port {}",
                spec, target, response.external_port
            );
            request.lifetime = 0;
            if let Err(e) = self.exchange(&socket, &request).await {
                warn!("Failed to release PCP mapping for {}: {}", spec, e);
            }
            return Ok(false);
        }

        info!(
            "PCP mapping for {} is in place on {} ({}:{}, {} seconds remaining)",
            spec, target, response.external_address, response.external_port, response.lifetime
        );
        Ok(true)
    }
}

#[async_trait]
impl PcpMapper for PcpClient {
    async fn map_port(
        &self,
        internal: Ipv4Addr,
        target: Ipv4Addr,
        spec: PortSpec,
        enable: bool,
        indefinite: bool,
    ) -> bool {
        match self.try_map(internal, target, spec, enable, indefinite).await {
            Ok(success) => success,
            Err(e) => {
                warn!("PCP mapping for {} via {} failed: {}", spec, target, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Transport;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn request(third_party: Option<Ipv4Addr>) -> MapRequest {
        let spec = PortSpec::udp(47998);
        MapRequest {
            client: CLIENT,
            third_party,
            nonce: mapping_nonce("desktop", third_party.unwrap_or(CLIENT), spec),
            spec,
            suggested_port: 47998,
            lifetime: 3600,
        }
    }

    fn response_for(request: &MapRequest, result: u8, external_port: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(0x81);
        buf.put_u8(0);
        buf.put_u8(result);
        buf.put_u32(request.lifetime);
        buf.put_u32(7);
        buf.put_slice(&[0u8; 12]);
        buf.put_slice(&request.nonce);
        buf.put_u8(request.spec.transport.iana_number());
        buf.put_slice(&[0u8; 3]);
        buf.put_u16(request.spec.port);
        buf.put_u16(external_port);
        buf.put_slice(&Ipv4Addr::new(203, 0, 113, 5).to_ipv6_mapped().octets());
        buf
    }

    #[test]
    fn test_encode_map_request() {
        let packet = encode_map_request(&request(None));
        assert_eq!(packet.len(), 60);
        assert_eq!(&packet[..2], &[2, 1]);
        assert_eq!(&packet[4..8], &3600u32.to_be_bytes());
        assert_eq!(&packet[8..24], &CLIENT.to_ipv6_mapped().octets());
        assert_eq!(packet[36], 17);
        assert_eq!(&packet[40..42], &47998u16.to_be_bytes());
        assert_eq!(&packet[42..44], &47998u16.to_be_bytes());
    }

    #[test]
    fn test_third_party_option() {
        let other = Ipv4Addr::new(100, 64, 3, 2);
        let packet = encode_map_request(&request(Some(other)));
        assert_eq!(packet.len(), 80);
        assert_eq!(&packet[60..64], &[1, 0, 0, 16]);
        assert_eq!(&packet[64..80], &other.to_ipv6_mapped().octets());
    }

    #[test]
    fn test_nonce_is_stable_and_distinct() {
        let tcp = PortSpec::tcp(47984);
        let a = mapping_nonce("desktop", CLIENT, tcp);
        assert_eq!(a, mapping_nonce("desktop", CLIENT, tcp));
        assert_ne!(a, mapping_nonce("laptop", CLIENT, tcp));
        assert_ne!(a, mapping_nonce("desktop", CLIENT, PortSpec::udp(47984)));
        assert_ne!(a, mapping_nonce("desktop", Ipv4Addr::new(10, 0, 0, 2), tcp));
    }

    #[test]
    fn test_decode_matching_response() {
        let req = request(None);
        let packet = response_for(&req, 0, 47998);
        let response = decode_map_response(&packet, &req.nonce, req.spec)
            .unwrap()
            .unwrap();
        assert_eq!(response.external_port, 47998);
        assert_eq!(response.external_address, Ipv4Addr::new(203, 0, 113, 5));
        assert_eq!(response.epoch, 7);
    }

    #[test]
    fn test_decode_ignores_other_requests() {
        let req = request(None);
        let packet = response_for(&req, 0, 47998);
        let other_nonce = [9u8; NONCE_LEN];
        assert!(decode_map_response(&packet, &other_nonce, req.spec).unwrap().is_none());
        assert!(decode_map_response(&packet, &req.nonce, PortSpec::tcp(47998)).unwrap().is_none());
        assert!(decode_map_response(&packet[..40], &req.nonce, req.spec).unwrap().is_none());
    }

    #[test]
    fn test_decode_result_code() {
        let req = request(None);
        let packet = response_for(&req, 8, 0);
        let err = decode_map_response(&packet, &req.nonce, req.spec).unwrap_err();
        assert!(matches!(err, PcpError::ResultCode { code: 8 }));
    }

    /// Loopback PCP server granting `granted` for every MAP and counting requests
    async fn spawn_server(granted: Option<u16>) -> (u16, tokio::sync::mpsc::UnboundedReceiver<u32>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = [0u8; 1100];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else { return };
                if n < 60 {
                    continue;
                }
                let lifetime = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let _ = tx.send(lifetime);

                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&buf[24..36]);
                let transport = if buf[36] == 6 { Transport::Tcp } else { Transport::Udp };
                let internal_port = u16::from_be_bytes([buf[40], buf[41]]);
                let req = MapRequest {
                    client: CLIENT,
                    third_party: None,
                    nonce,
                    spec: PortSpec { transport, port: internal_port },
                    suggested_port: internal_port,
                    lifetime,
                };
                let external = if lifetime == 0 { 0 } else { granted.unwrap_or(internal_port) };
                let reply = response_for(&req, 0, external);
                let _ = socket.send_to(&reply, peer).await;
            }
        });

        (port, rx)
    }

    #[tokio::test]
    async fn test_client_maps_and_deletes() {
        let (port, mut lifetimes) = spawn_server(None).await;
        let client = PcpClient::new("desktop", Duration::from_millis(50), 2).with_server_port(port);
        let localhost = Ipv4Addr::LOCALHOST;

        assert!(client.map_port(localhost, localhost, PortSpec::tcp(47984), true, false).await);
        assert_eq!(lifetimes.recv().await, Some(3600));

        assert!(client.map_port(localhost, localhost, PortSpec::tcp(47984), false, false).await);
        assert_eq!(lifetimes.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_client_releases_wrong_port() {
        let (port, mut lifetimes) = spawn_server(Some(50001)).await;
        let client = PcpClient::new("desktop", Duration::from_millis(50), 2).with_server_port(port);
        let localhost = Ipv4Addr::LOCALHOST;

        assert!(!client.map_port(localhost, localhost, PortSpec::udp(47999), true, true).await);
        assert_eq!(lifetimes.recv().await, Some(604_800));
        assert_eq!(lifetimes.recv().await, Some(0));
    }
}
