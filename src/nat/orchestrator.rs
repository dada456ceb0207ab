//! Multi-hop, multi-protocol port mapping
//!
//! One [`Orchestrator::run_hop`] pass talks to a single gateway with UPnP, then
//! NAT-PMP, then PCP, skipping whatever the earlier protocols made pointless.
//! [`Orchestrator::update_port_mappings`] repeats the pass up the traceroute
//! chain for as long as the gateway's external address is itself private.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::MapperConfig;
use crate::nat::classify::{broadcast_address, is_likely_nat};
use crate::nat::error::NatResult;
use crate::nat::hops::{HopChainResolver, TracerouteResolver};
use crate::nat::interfaces::{IfAddrsPrefixResolver, OnLinkPrefixResolver};
use crate::nat::natpmp::{self, NatPmpConnector, NatPmpSession, UdpNatPmpConnector};
use crate::nat::pcp::{PcpClient, PcpMapper};
use crate::nat::report::{
    select_upstream, HopReport, ProtocolOutcome, ProtocolReport, RunReport, SkipReason,
};
use crate::nat::route::{RouteResolver, SystemRoute};
use crate::nat::upnp::{self, DiscoveredIgd, IgdDiscoverer, IgdStatus, SsdpDiscoverer};
use crate::protocol::{MappingIntent, APPLICATION_PORTS, WAKE_PORTS};

/// Gateway a hop pass talks to, and on whose behalf
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HopTarget {
    /// `None` is the default gateway
    pub target: Option<Ipv4Addr>,
    /// `None` is this host
    pub internal: Option<Ipv4Addr>,
}

impl HopTarget {
    pub fn default_gateway() -> Self {
        Self::default()
    }

    /// Hop past the default gateway, forwarding to the address the previous hop granted
    pub fn upstream(target: Ipv4Addr, internal: Ipv4Addr) -> Self {
        Self {
            target: Some(target),
            internal: Some(internal),
        }
    }

    /// Mapping on behalf of another address rather than this host
    pub fn is_override(&self) -> bool {
        self.internal.is_some()
    }
}

impl fmt::Display for HopTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(f, "{}", target)?,
            None => f.write_str("default gateway")?,
        }
        match self.internal {
            Some(internal) => write!(f, " for {}", internal),
            None => f.write_str(" for local machine"),
        }
    }
}

/// OS and network facilities the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub hops: Arc<dyn HopChainResolver>,
    pub prefixes: Arc<dyn OnLinkPrefixResolver>,
    pub routes: Arc<dyn RouteResolver>,
    pub igd: Arc<dyn IgdDiscoverer>,
    pub natpmp: Arc<dyn NatPmpConnector>,
    pub pcp: Arc<dyn PcpMapper>,
}

/// Runs mapping passes. Holds no state between runs.
pub struct Orchestrator {
    collaborators: Collaborators,
    discovery_delay: Duration,
    max_hops: usize,
    description: String,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, config: &MapperConfig, host_name: &str) -> Self {
        Self {
            collaborators,
            discovery_delay: config.discovery_delay(),
            max_hops: config.max_hops,
            description: format!("{} - {}", config.description_prefix, host_name),
        }
    }

    /// Orchestrator wired to the real network stack of this host
    pub fn system(config: &MapperConfig) -> NatResult<Self> {
        let host = host_name();
        let routes: Arc<dyn RouteResolver> = Arc::new(SystemRoute);

        let collaborators = Collaborators {
            hops: Arc::new(TracerouteResolver::new(config.traceroute_target, config.max_hops)),
            prefixes: Arc::new(IfAddrsPrefixResolver),
            routes: routes.clone(),
            igd: Arc::new(SsdpDiscoverer::new()?),
            natpmp: Arc::new(UdpNatPmpConnector::new(routes, config.natpmp_max_retries)),
            pcp: Arc::new(PcpClient::new(
                host.clone(),
                config.pcp_initial_retransmit(),
                config.pcp_max_retries,
            )),
        };

        Ok(Self::new(collaborators, config, &host))
    }

    /// UPnP mapping description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Create (or remove) the forwarding chain from the Internet to this host
    pub async fn update_port_mappings(&self, enable: bool) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("mapping_run", run_id = %run_id, enable);
        self.walk(enable).instrument(span).await
    }

    async fn walk(&self, enable: bool) -> RunReport {
        info!(
            "{} {} mapping run started at {}",
            env!("CARGO_PKG_NAME"),
            crate::VERSION,
            Utc::now().to_rfc3339()
        );
        debug!("UPnP mapping description is \"{}\"", self.description());

        info!("Finding upstream IPv4 hops via traceroute");
        let chain = match self.collaborators.hops.probe().await {
            Ok(mut chain) => {
                chain.truncate(self.max_hops);
                info!("Found {} upstream hop(s)", chain.len());
                chain
            }
            Err(e) => {
                warn!("Hop chain probe failed: {}", e);
                Vec::new()
            }
        };

        let mut report = RunReport {
            enable,
            chain: chain.clone(),
            ..RunReport::default()
        };

        let first = self.run_hop(enable, HopTarget::default_gateway()).await;
        let mut upstream = first.upstream;
        report.hops.push(first);

        // The chain already excludes the default gateway
        let mut next_hop = 0;
        while let Some(address) = upstream {
            if !is_likely_nat(address) {
                info!("Reached the Internet at hop {}", next_hop);
                break;
            }
            info!("Upstream address {} is likely a NAT", address);

            let Some(&target) = chain.get(next_hop) else {
                warn!("Traceroute did not reach past hop {}, stopping", next_hop);
                report.chain_exhausted = true;
                break;
            };

            let hop = self.run_hop(enable, HopTarget::upstream(target, address)).await;
            upstream = hop.upstream;
            report.hops.push(hop);
            next_hop += 1;
        }

        info!("Mapping run finished after {} hop(s)", report.hops.len());
        report
    }

    /// Map every port on one gateway and report the address it presents upstream
    pub async fn run_hop(&self, enable: bool, hop: HopTarget) -> HopReport {
        let span = info_span!("hop", %hop);
        self.run_hop_inner(enable, hop).instrument(span).await
    }

    async fn run_hop_inner(&self, enable: bool, hop: HopTarget) -> HopReport {
        info!("Starting port mapping update on {}", hop);

        let mut report = HopReport {
            target: hop.target,
            internal: hop.internal,
            ..HopReport::default()
        };

        // NAT-PMP gets the discovery window to answer its public address request
        let (natpmp, igd) = tokio::join!(
            self.open_natpmp(hop.target),
            self.discover_igd(hop.target)
        );

        let mut upnp_ok = false;
        if let Some(igd) = igd {
            let (ports, external) = self.map_upnp(enable, &hop, &igd).await;
            report.upnp_connected = igd.status == IgdStatus::Connected;
            if !report.upnp_connected {
                warn!("UPnP IGD is disconnected, trying NAT-PMP as well");
            }
            upnp_ok = report.upnp_connected && ports.all_ok();
            if upnp_ok {
                info!("UPnP port mapping successful");
            }
            report.upnp = ProtocolOutcome::Ran { report: ports };
            report.resolution.upnp = external;
        }

        let mut pcp_skip = None;
        if enable && upnp_ok {
            // Still tried when removing so that every protocol gets cleaned up
            pcp_skip = Some(SkipReason::UpnpSucceeded);
        }

        if let Some((mut session, public)) = natpmp {
            report.resolution.natpmp = Some(public);

            let skip = if enable && upnp_ok {
                Some(SkipReason::UpnpSucceeded)
            } else if !enable && hop.target.is_some() {
                // Nothing marks a NAT-PMP mapping as ours, another host behind us may share it
                info!("Not removing NAT-PMP mappings on a non-default gateway");
                Some(SkipReason::NoOwnershipOnUpstream)
            } else if enable && report.resolution.upnp == Some(public) {
                info!("Not using NAT-PMP or PCP against the UPnP gateway at {}", public);
                pcp_skip = Some(SkipReason::SameGateway);
                Some(SkipReason::SameGateway)
            } else {
                None
            };

            report.natpmp = match skip {
                Some(reason) => ProtocolOutcome::Skipped { reason },
                None => {
                    let ports = self.map_natpmp(enable, &hop, session.as_mut()).await;
                    if ports.all_ok() {
                        info!("NAT-PMP port mapping successful");
                        if enable {
                            pcp_skip = Some(SkipReason::NatPmpSucceeded);
                        }
                    }
                    ProtocolOutcome::Ran { report: ports }
                }
            };
        }

        report.pcp = match pcp_skip {
            Some(reason) => ProtocolOutcome::Skipped { reason },
            None => self.map_pcp(enable, &hop).await,
        };

        report.upstream = select_upstream(&report.resolution);
        match report.upstream {
            Some(address) => info!("Using upstream IPv4 address {}", address),
            None => info!("No valid upstream IPv4 address found"),
        }
        report
    }

    /// Open a NAT-PMP session and ask for its public address within the discovery window
    async fn open_natpmp(
        &self,
        target: Option<Ipv4Addr>,
    ) -> Option<(Box<dyn NatPmpSession>, Ipv4Addr)> {
        let mut session = match self.collaborators.natpmp.open(target).await {
            Ok(session) => session,
            Err(e) => {
                info!("NAT-PMP session could not be opened: {}", e);
                return None;
            }
        };

        let answer = tokio::time::timeout(self.discovery_delay, session.public_address()).await;
        match answer {
            Ok(Ok(public)) => {
                info!("NAT-PMP upstream address is {}", public);
                Some((session, public))
            }
            Ok(Err(e)) => {
                info!("NAT-PMP public address request failed: {}", e);
                None
            }
            Err(_) => {
                info!("NAT-PMP public address request timed out");
                None
            }
        }
    }

    async fn discover_igd(&self, target: Option<Ipv4Addr>) -> Option<DiscoveredIgd> {
        match self.collaborators.igd.discover(target, self.discovery_delay).await {
            Ok(Some(igd)) => Some(igd),
            Ok(None) => {
                info!("No UPnP IGD found");
                None
            }
            Err(e) => {
                warn!("UPnP discovery failed: {}", e);
                None
            }
        }
    }

    async fn map_upnp(
        &self,
        enable: bool,
        hop: &HopTarget,
        igd: &DiscoveredIgd,
    ) -> (ProtocolReport, Option<Ipv4Addr>) {
        let control = igd.control.as_ref();

        let external = match control.external_ip().await {
            Ok(address) => {
                info!("UPnP IGD WAN address is {}", address);
                Some(address)
            }
            Err(e) => {
                debug!("UPnP GetExternalIPAddress failed: {}", e);
                None
            }
        };

        let internal = hop.internal.unwrap_or(igd.local_address);
        let mut ports = ProtocolReport::default();
        for spec in APPLICATION_PORTS {
            let intent = MappingIntent::new(spec, internal, enable, false);
            let ok = upnp::map_port(control, &intent, &self.description).await;
            ports.record(spec, Some(internal), ok, false);
        }

        // Mapping to the broadcast address keeps WoL working after the router's ARP entry expires
        let wake_target = match hop.internal {
            Some(internal) => Some(internal),
            None => match self.collaborators.prefixes.prefix_length_for(igd.local_address) {
                Some(prefix_len) => Some(broadcast_address(igd.local_address, prefix_len)),
                None => {
                    warn!("No on-link prefix for {}, skipping WoL mappings", igd.local_address);
                    None
                }
            },
        };

        if let Some(wake_target) = wake_target {
            for spec in WAKE_PORTS {
                let intent = MappingIntent::new(spec, wake_target, enable, true);
                let ok = upnp::map_port(control, &intent, &self.description).await;
                ports.record(spec, Some(wake_target), ok, true);
            }
        }

        (ports, external)
    }

    async fn map_natpmp(
        &self,
        enable: bool,
        hop: &HopTarget,
        session: &mut dyn NatPmpSession,
    ) -> ProtocolReport {
        let mut ports = ProtocolReport::default();
        for spec in APPLICATION_PORTS {
            let ok = natpmp::map_port(session, spec, enable, false).await;
            ports.record(spec, hop.internal, ok, false);
        }

        // Without an override the internal client would be our unicast address, useless for WoL
        if hop.is_override() {
            for spec in WAKE_PORTS {
                let ok = natpmp::map_port(session, spec, enable, true).await;
                ports.record(spec, hop.internal, ok, true);
            }
        }

        ports
    }

    async fn map_pcp(&self, enable: bool, hop: &HopTarget) -> ProtocolOutcome {
        let (target, internal) = match (hop.target, hop.internal) {
            (Some(target), Some(internal)) => (target, internal),
            _ => match self.collaborators.routes.default_route().await {
                Ok(route) => (route.gateway, route.local_address),
                Err(e) => {
                    warn!("Cannot resolve the default route for PCP: {}", e);
                    return ProtocolOutcome::Skipped {
                        reason: SkipReason::NoDefaultRoute,
                    };
                }
            },
        };

        let pcp = &self.collaborators.pcp;
        let mut ports = ProtocolReport::default();
        for spec in APPLICATION_PORTS {
            let ok = pcp.map_port(internal, target, spec, enable, false).await;
            ports.record(spec, Some(internal), ok, false);
        }

        if hop.is_override() {
            for spec in WAKE_PORTS {
                let ok = pcp.map_port(internal, target, spec, enable, true).await;
                ports.record(spec, Some(internal), ok, true);
            }
        }

        if ports.all_ok() {
            info!("PCP port mapping successful");
        }
        ProtocolOutcome::Ran { report: ports }
    }
}

/// Host name used in mapping descriptions and PCP nonces
pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_target() {
        let gateway = HopTarget::default_gateway();
        assert!(!gateway.is_override());
        assert_eq!(gateway.to_string(), "default gateway for local machine");

        let upstream = HopTarget::upstream(Ipv4Addr::new(100, 64, 0, 1), Ipv4Addr::new(100, 64, 7, 9));
        assert!(upstream.is_override());
        assert_eq!(upstream.to_string(), "100.64.0.1 for 100.64.7.9");
    }
}
