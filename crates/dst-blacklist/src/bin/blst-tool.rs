//! blst-tool - exercise a destination blacklist from the command line
//!
//! Loads a blacklist configuration, records a batch of simulated failing
//! destinations and runs operator commands against the result.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rvoip_dst_blacklist::logging::parse_log_level;
use rvoip_dst_blacklist::{
    BlacklistConfig, BlacklistFlags, BlacklistRpc, DstBlacklist, LoggingConfig, Protocol,
    setup_logging,
};

#[derive(Parser, Debug)]
#[command(name = "blst-tool")]
#[command(about = "Inspect and exercise a SIP destination blacklist")]
pub struct Args {
    /// Blacklist configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Include file and line information in logs
    #[arg(long)]
    pub file_info: bool,

    /// Number of failing destinations to simulate
    #[arg(short, long, default_value = "16")]
    pub simulate: u16,

    /// Every n-th simulated destination is IPv6
    #[arg(long, default_value = "4")]
    pub ipv6_every: u16,

    /// TTL for simulated entries in seconds; the configured default when absent
    #[arg(short, long)]
    pub ttl: Option<u64>,

    /// Operator commands to run afterwards
    #[arg(short = 'x', long = "rpc", default_values = ["dst_blacklist.mem_info", "dst_blacklist.debug"])]
    pub commands: Vec<String>,

    /// Positional JSON parameters passed to every command
    #[arg(long, default_value = "[]")]
    pub params: String,

    /// List the available operator commands and exit
    #[arg(long)]
    pub list: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list {
        for (name, doc) in BlacklistRpc::list_methods() {
            println!("{:<28} {}", name, doc);
        }
        return Ok(());
    }

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?);
    if args.json_logs {
        logging = logging.with_json();
    }
    if args.file_info {
        logging = logging.with_file_info();
    }
    setup_logging(logging)?;

    let config = match &args.config {
        Some(path) => BlacklistConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BlacklistConfig::default(),
    };
    info!("blacklist config: {:?}", config);

    let blacklist = DstBlacklist::init(config).context("initializing dst blacklist")?;
    simulate(&blacklist, &args)?;

    let rpc = BlacklistRpc::new(blacklist.clone());
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("parsing --params")?;
    for command in &args.commands {
        match rpc.handle(command, &params) {
            Ok(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
            Err(fault) => warn!("{} failed: {}", command, fault),
        }
    }

    blacklist.destroy();
    Ok(())
}

fn simulate(blacklist: &DstBlacklist, args: &Args) -> Result<()> {
    const PROTOCOLS: [Protocol; 4] = [Protocol::Udp, Protocol::Tcp, Protocol::Tls, Protocol::Sctp];
    const REASONS: [BlacklistFlags; 5] = [
        BlacklistFlags::SEND_ERROR,
        BlacklistFlags::CONNECT_ERROR,
        BlacklistFlags::ICMP_RECEIVED,
        BlacklistFlags::TIMEOUT,
        BlacklistFlags::ERROR_503,
    ];

    for i in 0..args.simulate {
        let addr = if args.ipv6_every > 0 && i % args.ipv6_every == 0 {
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i))
        } else {
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, (i % 254) as u8 + 1))
        };
        let protocol = PROTOCOLS[usize::from(i) % PROTOCOLS.len()];
        let flags = REASONS[usize::from(i) % REASONS.len()];
        let port = 5060 + i / 254;

        let added = match args.ttl {
            Some(secs) => {
                blacklist.blacklist_with_ttl(protocol, addr, port, flags, Duration::from_secs(secs))
            }
            None => blacklist.blacklist(protocol, addr, port, flags),
        };
        match added {
            Ok(outcome) => info!("{}:{}:{} {} -> {:?}", protocol, addr, port, flags, outcome),
            Err(e) if e.is_soft() => warn!("not blacklisting {}:{}: {}", addr, port, e),
            Err(e) => return Err(e).context("simulating failures"),
        }
    }

    let mem = blacklist.stats();
    info!("{} of {} bytes in use", mem.used, mem.budget);
    Ok(())
}
