//! Outcome records of mapping runs

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::protocol::PortSpec;

/// Outcome of one mapping attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortResult {
    #[serde(serialize_with = "serialize_spec")]
    pub spec: PortSpec,
    /// Internal client of the mapping, `None` when the gateway infers it from the request source
    pub internal: Option<Ipv4Addr>,
    pub success: bool,
    /// Wake-on-LAN ports are best effort and never count against the protocol
    pub wake: bool,
}

fn serialize_spec<S: serde::Serializer>(spec: &PortSpec, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(spec)
}

/// Per-port results of one protocol at one hop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolReport {
    pub ports: Vec<PortResult>,
}

impl ProtocolReport {
    pub fn record(&mut self, spec: PortSpec, internal: Option<Ipv4Addr>, success: bool, wake: bool) {
        self.ports.push(PortResult {
            spec,
            internal,
            success,
            wake,
        });
    }

    /// Logical AND over the application ports
    pub fn all_ok(&self) -> bool {
        self.ports.iter().filter(|p| !p.wake).all(|p| p.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PortResult> {
        self.ports.iter().filter(|p| !p.success)
    }
}

/// External addresses observed at one hop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpstreamResolution {
    pub natpmp: Option<Ipv4Addr>,
    pub upnp: Option<Ipv4Addr>,
}

/// Address the walk continues from: NAT-PMP first, then UPnP, ignoring 0.0.0.0
pub fn select_upstream(resolution: &UpstreamResolution) -> Option<Ipv4Addr> {
    [resolution.natpmp, resolution.upnp]
        .into_iter()
        .flatten()
        .find(|addr| !addr.is_unspecified())
}

/// Why a protocol did not run at a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpnpSucceeded,
    NoOwnershipOnUpstream,
    SameGateway,
    NatPmpSucceeded,
    NoDefaultRoute,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::UpnpSucceeded => "UPnP mappings succeeded",
            SkipReason::NoOwnershipOnUpstream => "NAT-PMP mappings cannot be attributed upstream",
            SkipReason::SameGateway => "NAT-PMP and UPnP gateway are the same device",
            SkipReason::NatPmpSucceeded => "NAT-PMP mappings succeeded",
            SkipReason::NoDefaultRoute => "no default route",
        };
        f.write_str(reason)
    }
}

/// How one protocol fared at one hop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProtocolOutcome {
    /// Protocol unavailable at this hop (no IGD, no session)
    #[default]
    Unavailable,
    Skipped { reason: SkipReason },
    Ran { report: ProtocolReport },
}

impl ProtocolOutcome {
    pub fn report(&self) -> Option<&ProtocolReport> {
        match self {
            ProtocolOutcome::Ran { report } => Some(report),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.report().is_some_and(ProtocolReport::all_ok)
    }
}

/// Everything that happened at one hop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HopReport {
    /// `None` is the default gateway
    pub target: Option<Ipv4Addr>,
    pub internal: Option<Ipv4Addr>,
    pub upnp: ProtocolOutcome,
    /// False when the IGD reported a disconnected WAN link
    pub upnp_connected: bool,
    pub natpmp: ProtocolOutcome,
    pub pcp: ProtocolOutcome,
    pub resolution: UpstreamResolution,
    pub upstream: Option<Ipv4Addr>,
}

impl HopReport {
    pub fn any_succeeded(&self) -> bool {
        (self.upnp.succeeded() && self.upnp_connected)
            || self.natpmp.succeeded()
            || self.pcp.succeeded()
    }
}

/// Everything that happened in one `update_port_mappings` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub enable: bool,
    pub hops: Vec<HopReport>,
    pub chain: Vec<Ipv4Addr>,
    /// The walk still saw a NAT'd upstream address when it ran out of hops
    pub chain_exhausted: bool,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} port mappings across {} hop(s)",
            if self.enable { "Enabled" } else { "Disabled" },
            self.hops.len()
        )?;

        for (index, hop) in self.hops.iter().enumerate() {
            let target = hop
                .target
                .map_or_else(|| "default gateway".to_string(), |t| t.to_string());
            writeln!(f, "  hop {} ({}):", index, target)?;

            for (name, outcome) in [("UPnP", &hop.upnp), ("NAT-PMP", &hop.natpmp), ("PCP", &hop.pcp)] {
                match outcome {
                    ProtocolOutcome::Unavailable => writeln!(f, "    {:<8} unavailable", name)?,
                    ProtocolOutcome::Skipped { reason } => {
                        writeln!(f, "    {:<8} skipped: {}", name, reason)?
                    }
                    ProtocolOutcome::Ran { report } => {
                        let failed: Vec<String> =
                            report.failed().map(|p| p.spec.to_string()).collect();
                        if failed.is_empty() {
                            writeln!(f, "    {:<8} ok", name)?;
                        } else {
                            writeln!(f, "    {:<8} failed: {}", name, failed.join(", "))?;
                        }
                    }
                }
            }

            if let Some(upstream) = hop.upstream {
                writeln!(f, "    upstream address {}", upstream)?;
            }
        }

        if self.chain_exhausted {
            writeln!(f, "  upstream is still behind NAT but no further hops are known")?;
        }
        Ok(())
    }
}
