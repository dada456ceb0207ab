//! hopmap (lib.rs)
//!
//! Keeps a fixed set of application ports reachable from the Internet by
//! negotiating port forwarding with every NAT layer between this host and the
//! public network, over UPnP IGD, NAT-PMP and PCP.

#![warn(clippy::all)]

pub mod config;
pub mod nat;
pub mod protocol;
pub mod service;

pub use config::MapperConfig;
pub use nat::error::{NatError, NatResult};
pub use nat::{HopReport, HopTarget, Orchestrator, RunReport};
pub use protocol::constants::*;
pub use service::{PortMapService, Trigger};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const NOISY_DEPENDENCIES: [&str; 4] = ["tokio=warn", "runtime=warn", "hyper=warn", "reqwest=warn"];

/// Initialize logging to stderr
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error), `RUST_LOG` takes precedence
///
/// # Example
/// ```
/// hopmap::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    // A second call (tests, embedding) keeps the first subscriber
    let _ = init_logging_to(level, None);
}

/// Initialize logging to stderr and, optionally, appended to `log_file`
pub fn init_logging_to(level: &str, log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    for directive in NOISY_DEPENDENCIES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .with(filter)
        .try_init()?;

    Ok(())
}

/// Host and interface summary logged when the service starts
///
/// # Returns
/// A formatted string containing host and network information
pub fn system_info() -> String {
    use sysinfo::System;

    let mut info = format!(
        "hopmap v{}\n\
         ════════════════════════════════════════\n\
         Host: {}\n\
         OS: {} {}",
        VERSION,
        System::host_name().unwrap_or_else(|| "Unknown".to_string()),
        System::name().unwrap_or_else(|| "Unknown".to_string()),
        System::os_version().unwrap_or_else(|| "Unknown".to_string()),
    );

    info.push_str("\n\nIPv4 Interfaces:");
    match nat::interfaces::InterfaceSnapshot::capture() {
        Ok(snapshot) if !snapshot.addresses().is_empty() => {
            for iface in snapshot.addresses() {
                info.push_str(&format!(
                    "\n  {}: {}/{}{}",
                    iface.name,
                    iface.address,
                    iface.prefix_len,
                    if nat::classify::is_likely_nat(iface.address) { " (private)" } else { "" }
                ));
            }
        }
        Ok(_) => info.push_str("\n  No active network interfaces found"),
        Err(_) => info.push_str("\n  Failed to enumerate network interfaces"),
    }

    info.push_str("\n════════════════════════════════════════");
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_system_info() {
        let info = system_info();
        assert!(info.contains("hopmap"));
        assert!(info.contains("Host:"));
        assert!(info.contains("IPv4 Interfaces:"));
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("debug");
        init_logging("info");
        assert!(init_logging_to("info", None).is_err());
    }
}
