//! Upstream hop chain discovery
//!
//! The chain is every router past the default gateway that answered a
//! traceroute probe, in path order.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::nat::error::{NatError, NatResult};

#[async_trait]
pub trait HopChainResolver: Send + Sync {
    /// Ordered upstream addresses beyond the default gateway
    async fn probe(&self) -> NatResult<Vec<Ipv4Addr>>;
}

/// Hop chain from the system `traceroute` (or `tracert` on Windows)
#[derive(Debug, Clone)]
pub struct TracerouteResolver {
    destination: Ipv4Addr,
    max_hops: usize,
}

impl TracerouteResolver {
    pub fn new(destination: Ipv4Addr, max_hops: usize) -> Self {
        Self {
            destination,
            max_hops,
        }
    }

    fn command(&self) -> Command {
        // One extra TTL for the default gateway, which gets dropped
        let ttl = (self.max_hops + 1).to_string();

        if cfg!(windows) {
            let mut cmd = Command::new("tracert");
            cmd.args(["-d", "-h", &ttl, "-w", "1000"]);
            cmd.arg(self.destination.to_string());
            cmd
        } else {
            let mut cmd = Command::new("traceroute");
            cmd.args(["-n", "-q", "1", "-w", "1", "-m", &ttl]);
            cmd.arg(self.destination.to_string());
            cmd
        }
    }

    /// Upper bound on a full probe: one wait per TTL plus process start-up
    fn deadline(&self) -> Duration {
        Duration::from_secs(3 * (self.max_hops as u64 + 1) + 5)
    }
}

#[async_trait]
impl HopChainResolver for TracerouteResolver {
    async fn probe(&self) -> NatResult<Vec<Ipv4Addr>> {
        let deadline = self.deadline();
        let mut command = self.command();
        command.kill_on_drop(true);

        let output = tokio::time::timeout(deadline, command.output())
            .await
            .map_err(|_| NatError::Timeout(deadline))??;

        let text = String::from_utf8_lossy(&output.stdout);
        let hops = parse_hop_chain(&text, self.max_hops);

        info!("Upstream hop chain towards {}: {:?}", self.destination, hops);
        Ok(hops)
    }
}

/// Addresses of consecutive responding hops after the first.
///
/// Stops at the first hop that stayed silent, since nothing past it can be
/// addressed reliably.
pub fn parse_hop_chain(output: &str, max_hops: usize) -> Vec<Ipv4Addr> {
    let mut hops = Vec::new();

    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(Ok(ttl)) = tokens.next().map(str::parse::<u32>) else {
            continue;
        };

        match tokens.find_map(|t| t.parse::<Ipv4Addr>().ok()) {
            Some(addr) => {
                debug!("Hop {}: {}", ttl, addr);
                hops.push(addr);
            }
            None => {
                debug!("Hop {} did not respond", ttl);
                break;
            }
        }
    }

    hops.into_iter().skip(1).take(max_hops).collect()
}
