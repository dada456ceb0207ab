/// Port tables and protocol constants shared by every mapping client

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

// Lease values (seconds)
pub const STANDARD_LEASE_SECS: u32 = 3600;
pub const INDEFINITE_LEASE_SECS: u32 = 604_800; // 1 week, WoL and "indefinite" NAT-PMP/PCP leases
pub const PERMANENT_LEASE_SECS: u32 = 0; // UPnP: permanent, NAT-PMP/PCP: delete

// Well-known ports
pub const NATPMP_SERVER_PORT: u16 = 5351;
pub const PCP_SERVER_PORT: u16 = 5351;
pub const SSDP_PORT: u16 = 1900;
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

// Timing
pub const POLLING_DELAY: Duration = Duration::from_secs(120);
pub const UPNP_DISCOVERY_DELAY: Duration = Duration::from_millis(5000);
pub const INTERFACE_SETTLE_DELAY: Duration = Duration::from_secs(10);
pub const NATPMP_INITIAL_RETRANSMIT: Duration = Duration::from_millis(250);
pub const NATPMP_MAX_RETRIES: u32 = 9;

/// Upper bound on the number of upstream hops the walk may visit
pub const MAX_HOPS: usize = 4;

/// UPnP description prefix, followed by " - <host name>"
pub const MAPPING_DESCRIPTION_PREFIX: &str = "Moonlight";

/// Transport protocol of a forwarded port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Name used by UPnP `NewProtocol` arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }

    /// NAT-PMP mapping opcode (RFC 6886 §3.3)
    pub fn natpmp_opcode(&self) -> u8 {
        match self {
            Transport::Udp => 1,
            Transport::Tcp => 2,
        }
    }

    /// IANA protocol number, used by PCP
    pub fn iana_number(&self) -> u8 {
        match self {
            Transport::Tcp => 6,
            Transport::Udp => 17,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One forwarded port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub transport: Transport,
    pub port: u16,
}

impl PortSpec {
    pub const fn tcp(port: u16) -> Self {
        Self { transport: Transport::Tcp, port }
    }

    pub const fn udp(port: u16) -> Self {
        Self { transport: Transport::Udp, port }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.port)
    }
}

/// Streaming ports: control, video, audio and input channels
pub const APPLICATION_PORTS: [PortSpec; 8] = [
    PortSpec::tcp(47984),
    PortSpec::tcp(47989),
    PortSpec::tcp(48010),
    PortSpec::udp(47998),
    PortSpec::udp(47999),
    PortSpec::udp(48000),
    PortSpec::udp(48002),
    PortSpec::udp(48010),
];

/// Wake-on-LAN ports, forwarded to a broadcast (or upstream) address
pub const WAKE_PORTS: [PortSpec; 2] = [PortSpec::udp(9), PortSpec::udp(47009)];

/// Lease requested from a UPnP IGD
pub fn upnp_lease(indefinite: bool) -> u32 {
    if indefinite {
        PERMANENT_LEASE_SECS
    } else {
        STANDARD_LEASE_SECS
    }
}

/// Lifetime requested from a NAT-PMP or PCP server
pub fn requested_lifetime(enable: bool, indefinite: bool) -> u32 {
    if !enable {
        0
    } else if indefinite {
        INDEFINITE_LEASE_SECS
    } else {
        STANDARD_LEASE_SECS
    }
}
