//! NAT-PMP (RFC 6886) mapping client
//!
//! [`map_port`] holds the lease and conflict policy; [`UdpNatPmpSession`] is the
//! wire session with the RFC retransmission schedule.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::nat::error::{NatPmpError, NatResult};
use crate::nat::route::RouteResolver;
use crate::protocol::constants::{requested_lifetime, NATPMP_INITIAL_RETRANSMIT, NATPMP_SERVER_PORT};
use crate::protocol::{PortSpec, Transport};

const OP_PUBLIC_ADDRESS: u8 = 0;
const RESPONSE_BIT: u8 = 128;
const PUBLIC_ADDRESS_RESPONSE_LEN: usize = 12;
const MAPPING_RESPONSE_LEN: usize = 16;

/// Server answer to a mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingResponse {
    pub private_port: u16,
    pub public_port: u16,
    pub lifetime: u32,
    pub epoch: u32,
}

/// One NAT-PMP conversation with a single gateway.
///
/// Implementations own retransmission; a returned error is definitive.
#[async_trait]
pub trait NatPmpSession: Send {
    async fn public_address(&mut self) -> Result<Ipv4Addr, NatPmpError>;

    async fn request_mapping(
        &mut self,
        transport: Transport,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    ) -> Result<MappingResponse, NatPmpError>;
}

/// Opens sessions; `None` means the default gateway
#[async_trait]
pub trait NatPmpConnector: Send + Sync {
    async fn open(&self, gateway: Option<Ipv4Addr>) -> NatResult<Box<dyn NatPmpSession>>;
}

/// Create or delete one mapping whose external port must equal the internal port.
///
/// A grant for any other external port is useless to remote peers, so it is
/// released straight away and reported as a failure.
pub async fn map_port(
    session: &mut dyn NatPmpSession,
    spec: PortSpec,
    enable: bool,
    indefinite: bool,
) -> bool {
    let lifetime = requested_lifetime(enable, indefinite);
    let requested_public = if enable { spec.port } else { 0 };

    debug!("Updating NAT-PMP port mapping for {} (lifetime {}s)", spec, lifetime);
    let response = match session
        .request_mapping(spec.transport, spec.port, requested_public, lifetime)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("NAT-PMP mapping request for {} failed: {}", spec, e);
            return false;
        }
    };

    if response.lifetime == 0 && !enable {
        info!("Deleted NAT-PMP mapping for {}", spec);
        return true;
    }

    if response.public_port != spec.port {
        warn!(
            "NAT-PMP conflict for {}: gateway granted external port {}",
            spec, response.public_port
        );
        info!(
            "Deleting unwanted NAT-PMP mapping for {} {}",
            spec.transport, response.public_port
        );
        match session
            .request_mapping(spec.transport, response.private_port, 0, 0)
            .await
        {
            Ok(_) => debug!("Released NAT-PMP mapping for {} {}", spec.transport, response.public_port),
            Err(e) => warn!("Failed to release NAT-PMP mapping for {}: {}", spec, e),
        }
        return false;
    }

    info!(
        "NAT-PMP mapping for {} is in place ({} seconds remaining)",
        spec, response.lifetime
    );
    true
}

/// NAT-PMP over a connected UDP socket
#[derive(Debug)]
pub struct UdpNatPmpSession {
    socket: UdpSocket,
    server: SocketAddrV4,
    initial_retransmit: Duration,
    max_retries: u32,
}

impl UdpNatPmpSession {
    /// Session with the NAT-PMP server on `gateway`
    pub async fn connect(gateway: Ipv4Addr, max_retries: u32) -> std::io::Result<Self> {
        Self::connect_to(SocketAddrV4::new(gateway, NATPMP_SERVER_PORT), max_retries).await
    }

    pub async fn connect_to(server: SocketAddrV4, max_retries: u32) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            server,
            initial_retransmit: NATPMP_INITIAL_RETRANSMIT,
            max_retries: max_retries.max(1),
        })
    }

    pub fn with_initial_retransmit(mut self, delay: Duration) -> Self {
        self.initial_retransmit = delay;
        self
    }

    /// Send `request` until a matching response arrives, doubling the wait each time
    async fn exchange(
        &self,
        request: &[u8],
        opcode: u8,
        min_len: usize,
        private_port: Option<u16>,
    ) -> Result<Vec<u8>, NatPmpError> {
        let expected_opcode = opcode | RESPONSE_BIT;
        let mut delay = self.initial_retransmit;
        let mut buf = [0u8; 64];

        for attempt in 0..self.max_retries {
            trace!("NAT-PMP request op {} to {} (attempt {})", opcode, self.server, attempt + 1);
            self.socket.send(request).await?;
            let deadline = Instant::now() + delay;

            while let Ok(received) = timeout_at(deadline, self.socket.recv(&mut buf)).await {
                let size = received?;
                let mut response = &buf[..size];
                if response.len() < 4 {
                    continue;
                }

                let version = response.get_u8();
                let resp_opcode = response.get_u8();
                let result_code = response.get_u16();

                if version != 0 || resp_opcode != expected_opcode {
                    // Late answers to earlier requests land here
                    trace!("Ignoring NAT-PMP response op {} (version {})", resp_opcode, version);
                    continue;
                }
                // Mapping answers, errors included, must echo our private port
                if let Some(port) = private_port {
                    if size >= 10 && u16::from_be_bytes([buf[8], buf[9]]) != port {
                        trace!("Ignoring NAT-PMP response for another private port");
                        continue;
                    }
                }
                if result_code != 0 {
                    return Err(NatPmpError::from_code(result_code));
                }
                if size < min_len {
                    return Err(NatPmpError::InvalidResponse("response too short"));
                }
                return Ok(buf[..size].to_vec());
            }

            delay *= 2;
        }

        Err(NatPmpError::NoResponse(self.max_retries))
    }
}

#[async_trait]
impl NatPmpSession for UdpNatPmpSession {
    async fn public_address(&mut self) -> Result<Ipv4Addr, NatPmpError> {
        let request = [0u8, OP_PUBLIC_ADDRESS];
        let response = self
            .exchange(&request, OP_PUBLIC_ADDRESS, PUBLIC_ADDRESS_RESPONSE_LEN, None)
            .await?;

        let mut body = &response[8..];
        let address = Ipv4Addr::from(body.get_u32());
        debug!("NAT-PMP public address from {} is {}", self.server, address);
        Ok(address)
    }

    async fn request_mapping(
        &mut self,
        transport: Transport,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    ) -> Result<MappingResponse, NatPmpError> {
        let opcode = transport.natpmp_opcode();

        let mut request = BytesMut::with_capacity(12);
        request.put_u8(0); // Version
        request.put_u8(opcode);
        request.put_u16(0); // Reserved
        request.put_u16(private_port);
        request.put_u16(public_port);
        request.put_u32(lifetime);

        let response = self
            .exchange(&request, opcode, MAPPING_RESPONSE_LEN, Some(private_port))
            .await?;

        let mut body = &response[4..];
        let epoch = body.get_u32();
        let private_port = body.get_u16();
        let public_port = body.get_u16();
        let lifetime = body.get_u32();

        Ok(MappingResponse {
            private_port,
            public_port,
            lifetime,
            epoch,
        })
    }
}

/// Opens [`UdpNatPmpSession`]s, resolving the default gateway on demand
pub struct UdpNatPmpConnector {
    routes: Arc<dyn RouteResolver>,
    max_retries: u32,
}

impl UdpNatPmpConnector {
    pub fn new(routes: Arc<dyn RouteResolver>, max_retries: u32) -> Self {
        Self { routes, max_retries }
    }
}

#[async_trait]
impl NatPmpConnector for UdpNatPmpConnector {
    async fn open(&self, gateway: Option<Ipv4Addr>) -> NatResult<Box<dyn NatPmpSession>> {
        let gateway = match gateway {
            Some(gateway) => gateway,
            None => self.routes.default_route().await?.gateway,
        };
        let session = UdpNatPmpSession::connect(gateway, self.max_retries).await?;
        Ok(Box::new(session))
    }
}
