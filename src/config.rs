//! Service configuration

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::nat::error::{NatError, NatResult};
use crate::protocol::constants::{
    INTERFACE_SETTLE_DELAY, MAPPING_DESCRIPTION_PREFIX, MAX_HOPS, NATPMP_MAX_RETRIES,
    POLLING_DELAY, UPNP_DISCOVERY_DELAY,
};

const CONFIG_DIR_NAME: &str = "hopmap";
const CONFIG_FILE_NAME: &str = "config.json";

/// Tunables of the mapper and its service loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Interval between periodic refresh runs
    pub polling_delay_secs: u64,
    /// SSDP discovery window, also bounds the NAT-PMP public address wait
    pub upnp_discovery_delay_ms: u64,
    /// Quiet period after an interface change before the next run
    pub interface_settle_delay_secs: u64,
    pub interface_poll_interval_secs: u64,
    pub max_hops: usize,
    /// Destination probed to find upstream hops
    pub traceroute_target: Ipv4Addr,
    pub description_prefix: String,
    pub natpmp_max_retries: u32,
    pub pcp_initial_retransmit_ms: u64,
    pub pcp_max_retries: u32,
    /// File holding the forwarding toggle; no file configured means always enabled
    pub enable_flag: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            polling_delay_secs: POLLING_DELAY.as_secs(),
            upnp_discovery_delay_ms: UPNP_DISCOVERY_DELAY.as_millis() as u64,
            interface_settle_delay_secs: INTERFACE_SETTLE_DELAY.as_secs(),
            interface_poll_interval_secs: 5,
            max_hops: MAX_HOPS,
            traceroute_target: Ipv4Addr::new(8, 8, 8, 8),
            description_prefix: MAPPING_DESCRIPTION_PREFIX.to_string(),
            natpmp_max_retries: NATPMP_MAX_RETRIES,
            pcp_initial_retransmit_ms: 1000,
            pcp_max_retries: 3,
            enable_flag: None,
            log_file: None,
        }
    }
}

impl MapperConfig {
    /// `<config dir>/hopmap/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the default location when it exists, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let config = Self::from_file(&path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NatResult<()> {
        if self.polling_delay_secs == 0 {
            return Err(NatError::Configuration(
                "polling_delay_secs must be at least 1".to_string(),
            ));
        }

        if self.max_hops == 0 {
            return Err(NatError::Configuration("max_hops must be at least 1".to_string()));
        }

        if self.upnp_discovery_delay_ms == 0 {
            return Err(NatError::Configuration(
                "upnp_discovery_delay_ms cannot be zero".to_string(),
            ));
        }

        if self.natpmp_max_retries == 0 {
            return Err(NatError::Configuration(
                "natpmp_max_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_secs(self.polling_delay_secs)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.upnp_discovery_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.interface_settle_delay_secs)
    }

    pub fn interface_poll_interval(&self) -> Duration {
        Duration::from_secs(self.interface_poll_interval_secs.max(1))
    }

    pub fn pcp_initial_retransmit(&self) -> Duration {
        Duration::from_millis(self.pcp_initial_retransmit_ms)
    }
}
