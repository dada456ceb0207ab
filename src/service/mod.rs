//! Trigger-driven service loop
//!
//! Trigger sources run as independent tasks and only ever send a [`Trigger`].
//! The single consumer in [`PortMapService::serve`] owns every mapping run, so
//! runs never overlap and triggers that pile up during a run collapse into one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::MapperConfig;
use crate::nat::interfaces::InterfaceSnapshot;
use crate::nat::Orchestrator;

const TRIGGER_QUEUE: usize = 16;

/// Reason to wake the service loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Periodic,
    InterfaceChange,
    /// The forwarding toggle now reads as the given value
    ToggleChanged(bool),
    /// Remove every mapping and stop
    Shutdown,
}

/// Forwarding on/off switch backed by an optional file
#[derive(Debug, Clone, Default)]
pub struct ForwardingFlag {
    path: Option<PathBuf>,
}

impl ForwardingFlag {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Always enabled without a file; a configured but missing file means disabled
    pub fn is_enabled(&self) -> bool {
        match &self.path {
            None => true,
            Some(path) => read_flag(path),
        }
    }
}

fn read_flag(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_flag(&contents),
        Err(e) => {
            debug!("Forwarding flag {} unreadable: {}", path.display(), e);
            false
        }
    }
}

fn parse_flag(contents: &str) -> bool {
    matches!(
        contents.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Keeps mappings up to date until told to shut down
pub struct PortMapService {
    orchestrator: Arc<Orchestrator>,
    flag: ForwardingFlag,
    polling_delay: Duration,
    settle_delay: Duration,
    poll_interval: Duration,
}

impl PortMapService {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &MapperConfig) -> Self {
        Self {
            orchestrator,
            flag: ForwardingFlag::new(config.enable_flag.clone()),
            polling_delay: config.polling_delay(),
            settle_delay: config.settle_delay(),
            poll_interval: config.interface_poll_interval(),
        }
    }

    /// Run with the host's trigger sources until Ctrl-C
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("{}", crate::system_info());

        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        let sources = self.spawn_sources(tx);

        let runs = self.serve(rx).await;
        info!("Service stopped after {} mapping run(s)", runs);

        for source in sources {
            source.abort();
        }
        Ok(())
    }

    fn spawn_sources(&self, tx: mpsc::Sender<Trigger>) -> Vec<JoinHandle<()>> {
        // Baselines are taken here so changes made before a watcher first runs still count
        let interfaces = InterfaceSnapshot::capture().unwrap_or_default();
        let mut sources = vec![
            tokio::spawn(watch_interfaces(tx.clone(), self.poll_interval, interfaces)),
            tokio::spawn(watch_ctrl_c(tx.clone())),
        ];
        if self.flag.path.is_some() {
            let enabled = self.flag.is_enabled();
            sources.push(tokio::spawn(watch_flag(
                tx,
                self.flag.clone(),
                self.poll_interval,
                enabled,
            )));
        }
        sources
    }

    /// Consume triggers until shutdown, returning the number of mapping runs made.
    ///
    /// The periodic refresh is the receive timeout. A closed channel counts as shutdown.
    pub async fn serve(&self, mut triggers: mpsc::Receiver<Trigger>) -> u64 {
        let mut runs = 0;

        loop {
            // Anything queued before this run is answered by it
            let mut shutdown = false;
            while let Ok(trigger) = triggers.try_recv() {
                debug!("Coalescing queued trigger {:?}", trigger);
                shutdown |= trigger == Trigger::Shutdown;
            }
            if shutdown {
                break;
            }

            let enabled = self.flag.is_enabled();
            let report = self.orchestrator.update_port_mappings(enabled).await;
            runs += 1;
            info!("{}", report);

            info!("Going to sleep");
            let slept = Instant::now();
            let trigger = match timeout(self.polling_delay, triggers.recv()).await {
                Ok(Some(trigger)) => trigger,
                Ok(None) => Trigger::Shutdown,
                Err(_) => Trigger::Periodic,
            };

            match trigger {
                Trigger::Periodic => info!("Woke up for periodic refresh"),
                Trigger::InterfaceChange => {
                    info!(
                        "Woke up for interface change after {} seconds",
                        slept.elapsed().as_secs()
                    );
                    // Let DHCP and router advertisements settle
                    sleep(self.settle_delay).await;
                }
                Trigger::ToggleChanged(enabled) => info!(
                    "Woke up for forwarding toggle ({}) after {} seconds",
                    if enabled { "on" } else { "off" },
                    slept.elapsed().as_secs()
                ),
                Trigger::Shutdown => break,
            }
        }

        info!("Removing UPnP/NAT-PMP/PCP rules after stop request");
        let report = self.orchestrator.update_port_mappings(false).await;
        info!("{}", report);
        runs + 1
    }
}

async fn watch_interfaces(
    tx: mpsc::Sender<Trigger>,
    interval: Duration,
    mut last: InterfaceSnapshot,
) {
    loop {
        sleep(interval).await;
        let current = match InterfaceSnapshot::capture() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to enumerate interfaces: {}", e);
                continue;
            }
        };
        if current != last {
            debug!("Interface addresses changed: {:?}", current.addresses());
            last = current;
            if tx.send(Trigger::InterfaceChange).await.is_err() {
                return;
            }
        }
    }
}

async fn watch_flag(
    tx: mpsc::Sender<Trigger>,
    flag: ForwardingFlag,
    interval: Duration,
    mut last: bool,
) {
    loop {
        sleep(interval).await;
        let current = flag.is_enabled();
        if current != last {
            last = current;
            if tx.send(Trigger::ToggleChanged(current)).await.is_err() {
                return;
            }
        }
    }
}

async fn watch_ctrl_c(tx: mpsc::Sender<Trigger>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Stop requested");
            let _ = tx.send(Trigger::Shutdown).await;
        }
        Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
    }
}
