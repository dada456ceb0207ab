//! UPnP IGD port mapping with conflict resolution
//!
//! The decision procedure in [`map_port`] only talks to an [`IgdControl`], so the
//! SOAP transport ([`SoapIgd`]) and SSDP discovery ([`SsdpDiscoverer`]) stay
//! swappable.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::nat::error::{NatResult, UpnpError, UpnpErrorCode};
use crate::protocol::constants::{upnp_lease, PERMANENT_LEASE_SECS};
use crate::protocol::{MappingIntent, PortSpec};

pub mod discovery;
pub mod soap;

pub use discovery::SsdpDiscoverer;
pub use soap::SoapIgd;

/// Existing mapping as reported by `GetSpecificPortMappingEntry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    pub internal_client: String,
    pub internal_port: u16,
    pub description: String,
    pub enabled: bool,
    pub lease_duration: u32,
}

/// Control channel of one discovered Internet Gateway Device.
///
/// External port always equals internal port; this crate never asks for
/// alternates.
#[async_trait]
pub trait IgdControl: Send + Sync {
    async fn specific_port_mapping(&self, spec: PortSpec) -> Result<PortMappingEntry, UpnpError>;

    async fn add_port_mapping(
        &self,
        spec: PortSpec,
        internal_client: Ipv4Addr,
        description: &str,
        lease_secs: u32,
    ) -> Result<(), UpnpError>;

    async fn delete_port_mapping(&self, spec: PortSpec) -> Result<(), UpnpError>;

    async fn external_ip(&self) -> Result<Ipv4Addr, UpnpError>;
}

/// WAN connection state reported by `GetStatusInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgdStatus {
    Connected,
    Disconnected,
}

/// Result of a successful discovery
pub struct DiscoveredIgd {
    pub control: Box<dyn IgdControl>,
    /// Our address on the interface facing the IGD
    pub local_address: Ipv4Addr,
    pub status: IgdStatus,
}

impl std::fmt::Debug for DiscoveredIgd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredIgd")
            .field("local_address", &self.local_address)
            .field("status", &self.status)
            .finish()
    }
}

/// Finds an IGD, either on the local segment or at a specific upstream address
#[async_trait]
pub trait IgdDiscoverer: Send + Sync {
    /// `Ok(None)` means discovery ran but nothing usable answered.
    async fn discover(
        &self,
        target: Option<Ipv4Addr>,
        window: Duration,
    ) -> NatResult<Option<DiscoveredIgd>>;
}

/// Create, refresh or delete one mapping on `control`.
///
/// Returns whether the gateway is now in the state `intent` asks for. Foreign
/// mappings are only removed when enabling, and a failure to remove one is a
/// failure of the whole attempt.
pub async fn map_port(control: &dyn IgdControl, intent: &MappingIntent, description: &str) -> bool {
    let spec = intent.spec;
    let enable = intent.enable;
    let my_addr = intent.internal_address;
    let mut indefinite = intent.indefinite;

    debug!("Checking for existing UPnP port mapping for {} -> {}", spec, my_addr);
    match control.specific_port_mapping(spec).await {
        Err(e) if e.is(UpnpErrorCode::NoSuchEntryInArray) => {
            debug!("UPnP mapping for {} not found", spec);
        }
        Err(e) if e.is(UpnpErrorCode::ActionNotAuthorized) => {
            info!("UPnP lookup of {} unauthorized", spec);
        }
        Err(e) => {
            // Strange errors usually come from old IGDv1 boxes that only cope with permanent leases
            warn!("UPnP lookup of {} failed: {}, falling back to permanent leases", spec, e);
            indefinite = true;
        }
        // Descriptions get rewritten by some routers, so ownership is the internal client only
        Ok(entry) if entry.internal_client == my_addr.to_string() => {
            if entry.lease_duration == PERMANENT_LEASE_SECS {
                debug!("UPnP mapping for {} -> {} exists (permanent)", spec, my_addr);
                if enable {
                    return true;
                }
            } else {
                debug!(
                    "UPnP mapping for {} -> {} exists ({} seconds remaining)",
                    spec, my_addr, entry.lease_duration
                );
            }

            if !enable {
                info!("Deleting UPnP mapping for {} -> {}", spec, my_addr);
                match control.delete_port_mapping(spec).await {
                    Ok(()) => debug!("Deleted UPnP mapping for {}", spec),
                    Err(e) => warn!("Failed to delete UPnP mapping for {}: {}", spec, e),
                }
                return true;
            }
        }
        Ok(entry) => {
            warn!(
                "UPnP mapping conflict for {}: owned by {} ({})",
                spec, entry.internal_client, entry.description
            );

            // Leave other hosts' mappings alone unless we need the port ourselves
            if enable {
                info!(
                    "Trying to delete conflicting UPnP mapping for {} -> {}",
                    spec, entry.internal_client
                );
                match control.delete_port_mapping(spec).await {
                    Ok(()) => debug!("Deleted conflicting UPnP mapping for {}", spec),
                    Err(e) if e.is(UpnpErrorCode::ActionNotAuthorized) => {
                        warn!("Not authorized to delete conflicting UPnP mapping for {}", spec);
                        return false;
                    }
                    Err(e) => {
                        warn!("Failed to delete conflicting UPnP mapping for {}: {}", spec, e);
                        return false;
                    }
                }
            }
        }
    }

    if !enable {
        return true;
    }

    let lease = upnp_lease(indefinite);
    info!("Updating UPnP port mapping for {} -> {} (lease {}s)", spec, my_addr, lease);
    let mut result = control.add_port_mapping(spec, my_addr, description, lease).await;
    if !indefinite {
        if let Err(e) = &result {
            if e.is(UpnpErrorCode::OnlyPermanentLeasesSupported) {
                info!("IGD only supports permanent leases, retrying {} as permanent", spec);
                result = control
                    .add_port_mapping(spec, my_addr, description, PERMANENT_LEASE_SECS)
                    .await;
            }
        }
    }

    match result {
        Ok(()) => {
            info!("UPnP port mapping for {} -> {} is in place", spec, my_addr);
            true
        }
        Err(e) => {
            warn!("Failed to add UPnP port mapping for {} -> {}: {}", spec, my_addr, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const ME: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const OTHER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Existing {
        None,
        Unauthorized,
        Broken,
        Mine { lease: u32 },
        Foreign { lease: u32 },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Delete,
        Add { lease: u32 },
    }

    struct ScriptedIgd {
        existing: Existing,
        delete_error: Option<u16>,
        add_errors: Mutex<Vec<u16>>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedIgd {
        fn new(existing: Existing) -> Self {
            Self {
                existing,
                delete_error: None,
                add_errors: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn deleted(&self) -> bool {
            self.calls().contains(&Call::Delete)
        }

        fn created(&self) -> bool {
            self.calls().iter().any(|c| matches!(c, Call::Add { .. }))
        }
    }

    fn fault(code: u16) -> UpnpError {
        UpnpError::SoapFault {
            code,
            description: String::new(),
        }
    }

    #[async_trait]
    impl IgdControl for ScriptedIgd {
        async fn specific_port_mapping(&self, spec: PortSpec) -> Result<PortMappingEntry, UpnpError> {
            let entry = |client: Ipv4Addr, lease: u32| PortMappingEntry {
                internal_client: client.to_string(),
                internal_port: spec.port,
                description: "test".to_string(),
                enabled: true,
                lease_duration: lease,
            };
            match self.existing {
                Existing::None => Err(fault(714)),
                Existing::Unauthorized => Err(fault(606)),
                Existing::Broken => Err(fault(501)),
                Existing::Mine { lease } => Ok(entry(ME, lease)),
                Existing::Foreign { lease } => Ok(entry(OTHER, lease)),
            }
        }

        async fn add_port_mapping(
            &self,
            _spec: PortSpec,
            _internal_client: Ipv4Addr,
            _description: &str,
            lease_secs: u32,
        ) -> Result<(), UpnpError> {
            self.calls.lock().push(Call::Add { lease: lease_secs });
            let mut errors = self.add_errors.lock();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(fault(errors.remove(0)))
            }
        }

        async fn delete_port_mapping(&self, _spec: PortSpec) -> Result<(), UpnpError> {
            self.calls.lock().push(Call::Delete);
            match self.delete_error {
                Some(code) => Err(fault(code)),
                None => Ok(()),
            }
        }

        async fn external_ip(&self) -> Result<Ipv4Addr, UpnpError> {
            Ok(Ipv4Addr::new(203, 0, 113, 5))
        }
    }

    fn intent(enable: bool) -> MappingIntent {
        MappingIntent::new(PortSpec::tcp(47984), ME, enable, false)
    }

    async fn run(igd: &ScriptedIgd, enable: bool) -> (bool, bool, bool) {
        let ok = map_port(igd, &intent(enable), "Moonlight - test").await;
        (igd.deleted(), igd.created(), ok)
    }

    #[tokio::test]
    async fn test_conflict_table() {
        // (existing, enable) -> (deleted, created, success)
        let table = [
            (Existing::None, true, (false, true, true)),
            (Existing::None, false, (false, false, true)),
            (Existing::Unauthorized, true, (false, true, true)),
            (Existing::Unauthorized, false, (false, false, true)),
            (Existing::Mine { lease: 0 }, true, (false, false, true)),
            (Existing::Mine { lease: 0 }, false, (true, false, true)),
            (Existing::Mine { lease: 1800 }, true, (false, true, true)),
            (Existing::Mine { lease: 1800 }, false, (true, false, true)),
            (Existing::Foreign { lease: 0 }, true, (true, true, true)),
            (Existing::Foreign { lease: 0 }, false, (false, false, true)),
            (Existing::Foreign { lease: 1800 }, true, (true, true, true)),
            (Existing::Foreign { lease: 1800 }, false, (false, false, true)),
        ];

        for (existing, enable, expected) in table {
            let igd = ScriptedIgd::new(existing);
            assert_eq!(run(&igd, enable).await, expected, "{:?} enable={}", existing, enable);
        }
    }

    #[tokio::test]
    async fn test_refresh_uses_standard_lease() {
        let igd = ScriptedIgd::new(Existing::Mine { lease: 1800 });
        assert!(map_port(&igd, &intent(true), "d").await);
        assert_eq!(igd.calls(), vec![Call::Add { lease: 3600 }]);
    }

    #[tokio::test]
    async fn test_unknown_lookup_error_forces_permanent_lease() {
        let igd = ScriptedIgd::new(Existing::Broken);
        assert!(map_port(&igd, &intent(true), "d").await);
        assert_eq!(igd.calls(), vec![Call::Add { lease: 0 }]);
    }

    #[tokio::test]
    async fn test_unknown_lookup_error_while_disabling_does_nothing() {
        let igd = ScriptedIgd::new(Existing::Broken);
        assert!(map_port(&igd, &intent(false), "d").await);
        assert!(igd.calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_delete_unauthorized_aborts() {
        let mut igd = ScriptedIgd::new(Existing::Foreign { lease: 0 });
        igd.delete_error = Some(606);
        assert!(!map_port(&igd, &intent(true), "d").await);
        assert_eq!(igd.calls(), vec![Call::Delete]);
    }

    #[tokio::test]
    async fn test_foreign_delete_other_error_aborts() {
        let mut igd = ScriptedIgd::new(Existing::Foreign { lease: 3600 });
        igd.delete_error = Some(501);
        assert!(!map_port(&igd, &intent(true), "d").await);
        assert!(!igd.created());
    }

    #[tokio::test]
    async fn test_own_delete_failure_still_reports_success() {
        let mut igd = ScriptedIgd::new(Existing::Mine { lease: 0 });
        igd.delete_error = Some(501);
        assert!(map_port(&igd, &intent(false), "d").await);
    }

    #[tokio::test]
    async fn test_only_permanent_lease_retry() {
        let igd = ScriptedIgd::new(Existing::None);
        igd.add_errors.lock().push(725);
        assert!(map_port(&igd, &intent(true), "d").await);
        assert_eq!(
            igd.calls(),
            vec![Call::Add { lease: 3600 }, Call::Add { lease: 0 }]
        );
    }

    #[tokio::test]
    async fn test_permanent_retry_failure_is_reported() {
        let igd = ScriptedIgd::new(Existing::None);
        igd.add_errors.lock().extend([725, 501]);
        assert!(!map_port(&igd, &intent(true), "d").await);
        assert_eq!(igd.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_indefinite_intent_is_not_retried_on_725() {
        let igd = ScriptedIgd::new(Existing::None);
        igd.add_errors.lock().push(725);
        let wol = MappingIntent::new(PortSpec::udp(9), ME, true, true);
        assert!(!map_port(&igd, &wol, "d").await);
        assert_eq!(igd.calls(), vec![Call::Add { lease: 0 }]);
    }

    #[tokio::test]
    async fn test_add_failure_is_reported() {
        let igd = ScriptedIgd::new(Existing::None);
        igd.add_errors.lock().push(718);
        assert!(!map_port(&igd, &intent(true), "d").await);
    }
}
