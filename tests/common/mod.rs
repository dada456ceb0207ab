//! Simulated gateway network for driving the orchestrator without real routers
//!
//! Every gateway keeps its own UPnP, NAT-PMP and PCP rule tables. Changes to
//! those tables are appended to a shared mutation log; refreshing an identical
//! rule is not a mutation.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hopmap::nat::{
    Collaborators, DefaultRoute, DiscoveredIgd, HopChainResolver, IgdControl, IgdDiscoverer,
    IgdStatus, MappingResponse, NatError, NatPmpConnector, NatPmpError, NatPmpSession, NatResult,
    OnLinkPrefixResolver, PcpMapper, PortMappingEntry, RouteResolver, UpnpError,
};
use hopmap::{MapperConfig, Orchestrator, PortSpec, Transport};

pub const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Upnp,
    NatPmp,
    Pcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Replaced,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub gateway: Ipv4Addr,
    pub protocol: Protocol,
    pub spec: PortSpec,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpRule {
    pub client: Ipv4Addr,
    pub lease: u32,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatPmpRule {
    pub public_port: u16,
    pub lifetime: u32,
}

/// One simulated NAT box
#[derive(Debug)]
pub struct SimGateway {
    /// Address the gateway answers on, and its traceroute hop address
    pub address: Ipv4Addr,
    /// Address of whoever talks to this gateway, as the gateway sees it
    pub client_side: Ipv4Addr,
    pub external: Ipv4Addr,
    pub upnp: bool,
    pub upnp_connected: bool,
    /// `GetExternalIPAddress` answer; `None` makes the call fail
    pub upnp_external: Option<Ipv4Addr>,
    pub natpmp: bool,
    pub pcp: bool,
    /// External ports already used by someone else on the NAT-PMP side
    pub natpmp_taken: HashSet<PortSpec>,
    pub upnp_rules: Mutex<HashMap<PortSpec, UpnpRule>>,
    pub natpmp_rules: Mutex<HashMap<PortSpec, NatPmpRule>>,
    pub pcp_rules: Mutex<HashMap<PortSpec, Ipv4Addr>>,
}

impl SimGateway {
    pub fn new(address: Ipv4Addr, client_side: Ipv4Addr, external: Ipv4Addr) -> Self {
        Self {
            address,
            client_side,
            external,
            upnp: false,
            upnp_connected: true,
            upnp_external: Some(external),
            natpmp: false,
            pcp: false,
            natpmp_taken: HashSet::new(),
            upnp_rules: Mutex::new(HashMap::new()),
            natpmp_rules: Mutex::new(HashMap::new()),
            pcp_rules: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_upnp(mut self) -> Self {
        self.upnp = true;
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.upnp_connected = false;
        self
    }

    pub fn without_upnp_external(mut self) -> Self {
        self.upnp_external = None;
        self
    }

    pub fn with_natpmp(mut self) -> Self {
        self.natpmp = true;
        self
    }

    pub fn with_pcp(mut self) -> Self {
        self.pcp = true;
        self
    }

    pub fn with_natpmp_taken(mut self, spec: PortSpec) -> Self {
        self.natpmp_taken.insert(spec);
        self
    }

    pub fn rule_count(&self) -> usize {
        self.upnp_rules.lock().len() + self.natpmp_rules.lock().len() + self.pcp_rules.lock().len()
    }
}

/// The default gateway first, then the traceroute chain past it
pub struct SimNetwork {
    pub gateways: Vec<Arc<SimGateway>>,
    /// Hop chain returned by the probe, `None` makes the probe fail
    pub chain: Option<Vec<Ipv4Addr>>,
    pub prefix_len: Option<u8>,
    pub mutations: Mutex<Vec<Mutation>>,
    /// Discovery targets in call order, one per hop pass
    pub visits: Mutex<Vec<Option<Ipv4Addr>>>,
}

impl SimNetwork {
    pub fn new(gateways: Vec<SimGateway>, chain: Vec<Ipv4Addr>) -> Arc<Self> {
        Self::build(gateways, Some(chain), Some(24))
    }

    pub fn with_failing_probe(gateways: Vec<SimGateway>) -> Arc<Self> {
        Self::build(gateways, None, Some(24))
    }

    /// Host whose interface prefix cannot be determined
    pub fn without_prefix(gateways: Vec<SimGateway>, chain: Vec<Ipv4Addr>) -> Arc<Self> {
        Self::build(gateways, Some(chain), None)
    }

    fn build(
        gateways: Vec<SimGateway>,
        chain: Option<Vec<Ipv4Addr>>,
        prefix_len: Option<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateways: gateways.into_iter().map(Arc::new).collect(),
            chain,
            prefix_len,
            mutations: Mutex::new(Vec::new()),
            visits: Mutex::new(Vec::new()),
        })
    }

    pub fn gateway(&self, target: Option<Ipv4Addr>) -> Option<Arc<SimGateway>> {
        match target {
            None => self.gateways.first().cloned(),
            Some(address) => self.gateways.iter().find(|g| g.address == address).cloned(),
        }
    }

    pub fn record(&self, gateway: Ipv4Addr, protocol: Protocol, spec: PortSpec, change: Change) {
        self.mutations.lock().push(Mutation {
            gateway,
            protocol,
            spec,
            change,
        });
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().len()
    }

    pub fn mutations_since(&self, start: usize) -> Vec<Mutation> {
        self.mutations.lock()[start..].to_vec()
    }

    pub fn total_rules(&self) -> usize {
        self.gateways.iter().map(|g| g.rule_count()).sum()
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            hops: Arc::new(SimHops(self.clone())),
            prefixes: Arc::new(SimPrefix(self.prefix_len)),
            routes: Arc::new(SimRoutes(self.clone())),
            igd: Arc::new(SimDiscoverer(self.clone())),
            natpmp: Arc::new(SimNatPmp(self.clone())),
            pcp: Arc::new(SimPcp(self.clone())),
        }
    }

    pub fn orchestrator(self: &Arc<Self>) -> Orchestrator {
        Orchestrator::new(self.collaborators(), &test_config(), "testhost")
    }
}

pub fn test_config() -> MapperConfig {
    MapperConfig {
        upnp_discovery_delay_ms: 200,
        interface_settle_delay_secs: 0,
        ..MapperConfig::default()
    }
}

fn refused() -> NatError {
    NatError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no such service"))
}

fn fault(code: u16) -> UpnpError {
    UpnpError::SoapFault {
        code,
        description: String::new(),
    }
}

struct SimHops(Arc<SimNetwork>);

#[async_trait]
impl HopChainResolver for SimHops {
    async fn probe(&self) -> NatResult<Vec<Ipv4Addr>> {
        self.0
            .chain
            .clone()
            .ok_or_else(|| NatError::NotSupported("traceroute unavailable".to_string()))
    }
}

struct SimPrefix(Option<u8>);

impl OnLinkPrefixResolver for SimPrefix {
    fn prefix_length_for(&self, _local: Ipv4Addr) -> Option<u8> {
        self.0
    }
}

struct SimRoutes(Arc<SimNetwork>);

#[async_trait]
impl RouteResolver for SimRoutes {
    async fn default_route(&self) -> NatResult<DefaultRoute> {
        let gateway = self.0.gateway(None).ok_or_else(refused)?;
        Ok(DefaultRoute {
            gateway: gateway.address,
            local_address: gateway.client_side,
        })
    }
}

struct SimDiscoverer(Arc<SimNetwork>);

#[async_trait]
impl IgdDiscoverer for SimDiscoverer {
    async fn discover(
        &self,
        target: Option<Ipv4Addr>,
        _window: Duration,
    ) -> NatResult<Option<DiscoveredIgd>> {
        self.0.visits.lock().push(target);

        let Some(gateway) = self.0.gateway(target).filter(|g| g.upnp) else {
            return Ok(None);
        };

        Ok(Some(DiscoveredIgd {
            local_address: gateway.client_side,
            status: if gateway.upnp_connected {
                IgdStatus::Connected
            } else {
                IgdStatus::Disconnected
            },
            control: Box::new(SimIgd {
                network: self.0.clone(),
                gateway,
            }),
        }))
    }
}

struct SimIgd {
    network: Arc<SimNetwork>,
    gateway: Arc<SimGateway>,
}

#[async_trait]
impl IgdControl for SimIgd {
    async fn specific_port_mapping(&self, spec: PortSpec) -> Result<PortMappingEntry, UpnpError> {
        let rules = self.gateway.upnp_rules.lock();
        let rule = rules.get(&spec).ok_or_else(|| fault(714))?;
        Ok(PortMappingEntry {
            internal_client: rule.client.to_string(),
            internal_port: spec.port,
            description: rule.description.clone(),
            enabled: true,
            lease_duration: rule.lease,
        })
    }

    async fn add_port_mapping(
        &self,
        spec: PortSpec,
        internal_client: Ipv4Addr,
        description: &str,
        lease_secs: u32,
    ) -> Result<(), UpnpError> {
        let rule = UpnpRule {
            client: internal_client,
            lease: lease_secs,
            description: description.to_string(),
        };
        let previous = self.gateway.upnp_rules.lock().insert(spec, rule);
        match previous {
            None => self.network.record(self.gateway.address, Protocol::Upnp, spec, Change::Created),
            Some(old) if old.client != internal_client => {
                self.network.record(self.gateway.address, Protocol::Upnp, spec, Change::Replaced)
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn delete_port_mapping(&self, spec: PortSpec) -> Result<(), UpnpError> {
        let removed = self.gateway.upnp_rules.lock().remove(&spec);
        match removed {
            Some(_) => {
                self.network.record(self.gateway.address, Protocol::Upnp, spec, Change::Deleted);
                Ok(())
            }
            None => Err(fault(714)),
        }
    }

    async fn external_ip(&self) -> Result<Ipv4Addr, UpnpError> {
        self.gateway.upnp_external.ok_or_else(|| fault(501))
    }
}

struct SimNatPmp(Arc<SimNetwork>);

#[async_trait]
impl NatPmpConnector for SimNatPmp {
    async fn open(&self, target: Option<Ipv4Addr>) -> NatResult<Box<dyn NatPmpSession>> {
        let gateway = self.0.gateway(target).filter(|g| g.natpmp).ok_or_else(refused)?;
        Ok(Box::new(SimNatPmpSession {
            network: self.0.clone(),
            gateway,
        }))
    }
}

struct SimNatPmpSession {
    network: Arc<SimNetwork>,
    gateway: Arc<SimGateway>,
}

#[async_trait]
impl NatPmpSession for SimNatPmpSession {
    async fn public_address(&mut self) -> Result<Ipv4Addr, NatPmpError> {
        Ok(self.gateway.external)
    }

    async fn request_mapping(
        &mut self,
        transport: Transport,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    ) -> Result<MappingResponse, NatPmpError> {
        let spec = PortSpec {
            transport,
            port: private_port,
        };
        let mut rules = self.gateway.natpmp_rules.lock();

        if lifetime == 0 {
            if rules.remove(&spec).is_some() {
                self.network.record(self.gateway.address, Protocol::NatPmp, spec, Change::Deleted);
            }
            return Ok(MappingResponse {
                private_port,
                public_port: 0,
                lifetime: 0,
                epoch: 1,
            });
        }

        let granted = if self.gateway.natpmp_taken.contains(&PortSpec { transport, port: public_port }) {
            public_port.wrapping_add(1000)
        } else {
            public_port
        };
        let rule = NatPmpRule {
            public_port: granted,
            lifetime,
        };
        if rules.insert(spec, rule).is_none() {
            self.network.record(self.gateway.address, Protocol::NatPmp, spec, Change::Created);
        }

        Ok(MappingResponse {
            private_port,
            public_port: granted,
            lifetime,
            epoch: 1,
        })
    }
}

struct SimPcp(Arc<SimNetwork>);

#[async_trait]
impl PcpMapper for SimPcp {
    async fn map_port(
        &self,
        internal: Ipv4Addr,
        target: Ipv4Addr,
        spec: PortSpec,
        enable: bool,
        _indefinite: bool,
    ) -> bool {
        let Some(gateway) = self.0.gateway(Some(target)).filter(|g| g.pcp) else {
            return false;
        };

        let mut rules = gateway.pcp_rules.lock();
        if enable {
            if rules.insert(spec, internal) != Some(internal) {
                self.0.record(gateway.address, Protocol::Pcp, spec, Change::Created);
            }
        } else if rules.remove(&spec).is_some() {
            self.0.record(gateway.address, Protocol::Pcp, spec, Change::Deleted);
        }
        true
    }
}
