//! Port tables, lease policy and the per-attempt mapping intent

pub mod constants;

use std::net::Ipv4Addr;

pub use constants::{PortSpec, Transport, APPLICATION_PORTS, WAKE_PORTS};

/// A single mapping attempt: which port, forwarded to whom, created or removed.
///
/// Built fresh for every call into a mapping client and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingIntent {
    pub spec: PortSpec,
    pub internal_address: Ipv4Addr,
    pub enable: bool,
    pub indefinite: bool,
}

impl MappingIntent {
    pub fn new(spec: PortSpec, internal_address: Ipv4Addr, enable: bool, indefinite: bool) -> Self {
        Self {
            spec,
            internal_address,
            enable,
            indefinite,
        }
    }
}
