use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hopmap::nat::{is_likely_nat, HopChainResolver, TracerouteResolver};
use hopmap::{init_logging_to, MapperConfig, Orchestrator, PortMapService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-hop UPnP / NAT-PMP / PCP port mapper", long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Override the forwarding toggle file
    #[arg(long, global = true)]
    enable_flag: Option<PathBuf>,

    /// Override the maximum number of upstream hops
    #[arg(long, global = true)]
    max_hops: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep mappings up to date until Ctrl-C, then remove them
    Run,
    /// Create the mappings once
    Enable {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove the mappings once
    Disable {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the upstream hop chain
    Hops,
    /// Tell whether an address is likely behind NAT
    Classify { address: Ipv4Addr },
}

fn load_config(args: &Args) -> Result<MapperConfig> {
    let mut config = MapperConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
    }
    if let Some(path) = &args.enable_flag {
        config.enable_flag = Some(path.clone());
    }
    if let Some(max_hops) = args.max_hops {
        config.max_hops = max_hops;
    }
    config.validate()?;
    Ok(config)
}

async fn run_once(config: &MapperConfig, enable: bool, json: bool) -> Result<()> {
    let orchestrator = Orchestrator::system(config)?;
    let report = orchestrator.update_port_mappings(enable).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::Classify { address } = args.command {
        println!(
            "{} is {}",
            address,
            if is_likely_nat(address) { "likely behind NAT" } else { "public" }
        );
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging_to(&args.log_level, config.log_file.as_deref())?;

    match args.command {
        Command::Run => {
            let orchestrator = Arc::new(Orchestrator::system(&config)?);
            PortMapService::new(orchestrator, &config).run().await
        }
        Command::Enable { json } => run_once(&config, true, json).await,
        Command::Disable { json } => run_once(&config, false, json).await,
        Command::Hops => {
            let resolver = TracerouteResolver::new(config.traceroute_target, config.max_hops);
            let hops = resolver.probe().await?;
            if hops.is_empty() {
                println!("No upstream hops beyond the default gateway");
            }
            for (index, hop) in hops.iter().enumerate() {
                println!(
                    "{:>2}  {}{}",
                    index + 1,
                    hop,
                    if is_likely_nat(*hop) { "  (NAT)" } else { "" }
                );
            }
            Ok(())
        }
        Command::Classify { .. } => Ok(()),
    }
}
