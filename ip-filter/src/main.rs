use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use ip_filter_common::{Decision, Outcome, POLICY_MAP_ENTRIES, PolicyLookup, SliceFrame, inspect};
use ipnet::Ipv4Net;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod ebpf_loader;
mod iface;
mod model;
mod sources;
mod store;

use config::{DEFAULT_REPORT_INTERVAL_SECS, DEFAULT_UPDATE_PERIOD_SECS, FilterConfig, FilterMode};
use ebpf_loader::{AttachOptions, DEFAULT_POLICY_MAP_PIN, KernelPolicyTable, XdpMode};
use model::{decode_hex_frame, load_rules, parse_policy, synthetic_frame};
use sources::{DEFAULT_ZONE_URL, ZoneSource};
use store::{MemoryPolicyTable, PolicyTable};

#[derive(Parser)]
#[command(name = "ip-filter")]
#[command(about = "XDP source-address filter driven by per-country prefix lists", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and attach the filter, keep the policy map in sync with the zone lists
    Run(RunCommand),
    /// Add or overwrite one prefix in the pinned policy map
    Insert(InsertCommand),
    /// Remove one prefix from the pinned policy map
    Remove(RemoveCommand),
    /// Print every entry of the pinned policy map
    List(ListCommand),
    /// Evaluate the decision for an address or a raw frame without attaching
    Check(CheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// Interface to attach to; defaults to the first up, non-loopback IPv4 interface
    #[arg(long, value_name = "IFACE")]
    iface: Option<String>,
    /// Allow only the listed countries
    #[arg(long)]
    allow: bool,
    /// Deny the listed countries
    #[arg(long)]
    deny: bool,
    /// Comma-separated country codes
    #[arg(long, value_name = "CC[,CC..]", default_value = "")]
    countries: String,
    /// Seconds between zone list refreshes
    #[arg(long, default_value_t = DEFAULT_UPDATE_PERIOD_SECS)]
    update_period_secs: u64,
    /// Seconds between table reports
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    report_interval_secs: u64,
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
    /// Capacity of the policy map
    #[arg(long, default_value_t = POLICY_MAP_ENTRIES)]
    map_entries: u32,
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_MAP_PIN)]
    pin_path: PathBuf,
    /// Read `{cc}-aggregated.zone` files from this directory instead of downloading
    #[arg(long, value_name = "DIR", conflicts_with = "zone_url_template")]
    zone_dir: Option<PathBuf>,
    /// Download URL, `{cc}` is replaced by the country code
    #[arg(long, value_name = "URL", default_value = DEFAULT_ZONE_URL)]
    zone_url_template: String,
    /// Compiled bpf object to load instead of the embedded one
    #[arg(long, value_name = "PATH")]
    object: Option<PathBuf>,
}

#[derive(Args)]
struct InsertCommand {
    /// Prefix in CIDR notation; a bare address means /32
    #[arg(value_parser = model::parse_network)]
    network: Ipv4Net,
    /// allow, deny, or a raw policy byte (0 drops, anything else passes)
    #[arg(long, default_value = "deny", value_parser = parse_policy)]
    policy: u8,
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_MAP_PIN)]
    pin_path: PathBuf,
}

#[derive(Args)]
struct RemoveCommand {
    #[arg(value_parser = model::parse_network)]
    network: Ipv4Net,
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_MAP_PIN)]
    pin_path: PathBuf,
}

#[derive(Args)]
struct ListCommand {
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_MAP_PIN)]
    pin_path: PathBuf,
    /// Emit a JSON array instead of one entry per line
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CheckCommand {
    /// Rules file (`CIDR [policy]` per line); the pinned map is used otherwise
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_MAP_PIN)]
    pin_path: PathBuf,
    /// Source address to wrap in a minimal Ethernet/IPv4 frame
    #[arg(long, conflicts_with = "frame", required_unless_present = "frame")]
    address: Option<Ipv4Addr>,
    /// Full frame as hex, starting at the Ethernet header
    #[arg(long, value_name = "HEX")]
    frame: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!("ip-filter error: {err:#}");
        exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ip_filter=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let mode = FilterMode::from_flags(cmd.allow, cmd.deny)?;
            let filter = FilterConfig::new(
                mode,
                &cmd.countries,
                Duration::from_secs(cmd.update_period_secs),
                Duration::from_secs(cmd.report_interval_secs),
            )?;
            let source = match cmd.zone_dir {
                Some(dir) => ZoneSource::dir(dir),
                None => ZoneSource::http(&cmd.zone_url_template)?,
            };
            let opts = AttachOptions {
                iface: cmd.iface,
                object: cmd.object,
                pin_path: cmd.pin_path,
                xdp_mode: cmd.xdp_mode,
                map_entries: cmd.map_entries,
                filter,
                source,
            };
            ebpf_loader::run_filter(opts).await?;
        }
        Some(Commands::Insert(cmd)) => {
            let table = KernelPolicyTable::from_pin(&cmd.pin_path)?;
            table.insert(cmd.network, cmd.policy)?;
            println!("{} -> {}", cmd.network, cmd.policy);
        }
        Some(Commands::Remove(cmd)) => {
            let table = KernelPolicyTable::from_pin(&cmd.pin_path)?;
            table.remove(cmd.network)?;
            println!("removed {}", cmd.network);
        }
        Some(Commands::List(cmd)) => {
            let table = KernelPolicyTable::from_pin(&cmd.pin_path)?;
            let entries = table.list()?;
            if cmd.json {
                let out = serde_json::to_string_pretty(&entries)
                    .context("failed to encode entries")?;
                println!("{out}");
            } else {
                for entry in &entries {
                    println!("{entry}");
                }
                println!("{} entries", entries.len());
            }
        }
        Some(Commands::Check(cmd)) => {
            let frame = match (cmd.address, cmd.frame.as_deref()) {
                (Some(addr), _) => synthetic_frame(addr).to_vec(),
                (None, Some(hex)) => decode_hex_frame(hex)?,
                (None, None) => return Err(anyhow!("pass --address or --frame")),
            };
            let outcome = match cmd.rules {
                Some(path) => {
                    let table = MemoryPolicyTable::from_entries(load_rules(&path)?)?;
                    evaluate(&frame, &table)
                }
                None => evaluate(&frame, &KernelPolicyTable::from_pin(&cmd.pin_path)?),
            };
            println!("{}", describe(&outcome));
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn evaluate<T: PolicyLookup>(frame: &[u8], table: &T) -> Outcome {
    inspect(&SliceFrame::new(frame), table)
}

fn describe(outcome: &Outcome) -> String {
    let verdict = match outcome.decision() {
        Decision::Pass => "PASS",
        Decision::Drop => "DROP",
    };
    let reason = match outcome {
        Outcome::Incomplete => "frame too short for its headers".to_string(),
        Outcome::UnsupportedProtocol(ether_type) => {
            format!("ethertype {ether_type:#06x} is not IPv4")
        }
        Outcome::NoPolicyMatch(source) => format!("no prefix covers {source}"),
        Outcome::Matched { source, policy } => format!("{source} matched policy {policy}"),
    };
    format!("{verdict}: {reason}")
}
