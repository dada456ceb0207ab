//! Port mapping across NAT layers
//!
//! Leaves first: address classification, the per-protocol mapping clients,
//! the OS-facing resolvers, then the orchestrator that ties them together.

pub mod classify;
pub mod error;
pub mod hops;
pub mod interfaces;
pub mod natpmp;
pub mod orchestrator;
pub mod pcp;
pub mod report;
pub mod route;
pub mod upnp;

pub use classify::{broadcast_address, is_likely_nat};
pub use error::{NatError, NatPmpError, NatResult, PcpError, UpnpError, UpnpErrorCode};
pub use hops::{HopChainResolver, TracerouteResolver};
pub use interfaces::{IfAddrsPrefixResolver, InterfaceSnapshot, OnLinkPrefixResolver};
pub use natpmp::{MappingResponse, NatPmpConnector, NatPmpSession, UdpNatPmpConnector, UdpNatPmpSession};
pub use orchestrator::{host_name, Collaborators, HopTarget, Orchestrator};
pub use pcp::{PcpClient, PcpMapper};
pub use report::{
    select_upstream, HopReport, PortResult, ProtocolOutcome, ProtocolReport, RunReport,
    SkipReason, UpstreamResolution,
};
pub use route::{DefaultRoute, RouteResolver, SystemRoute};
pub use upnp::{
    DiscoveredIgd, IgdControl, IgdDiscoverer, IgdStatus, PortMappingEntry, SoapIgd,
    SsdpDiscoverer,
};
