use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use peerprobe_lib::{Config, TransportKind, WireFormatKind};

/// Discover peers on the local network and exchange messages over several
/// transports.
#[derive(Debug, Parser)]
#[command(name = "peerprobe", version, about)]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name advertised to other peers.
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Transports to start, in routing priority order.
    #[arg(short, long, value_delimiter = ',')]
    transports: Option<Vec<TransportKind>>,

    #[arg(short, long)]
    format: Option<WireFormatKind>,

    #[arg(long)]
    bind: Option<IpAddr>,

    #[arg(long)]
    broadcast_addr: Option<IpAddr>,

    #[arg(long)]
    broadcast_port: Option<u16>,

    #[arg(long)]
    direct_port: Option<u16>,

    #[arg(long)]
    discovery_port: Option<u16>,

    #[arg(long)]
    service_port: Option<u16>,

    /// Seconds between discovery announcements.
    #[arg(long)]
    interval: Option<u64>,

    /// Seconds of silence before a peer is forgotten.
    #[arg(long)]
    peer_timeout: Option<u64>,

    /// Log filter, e.g. `debug` or `peerprobe_lib=trace`. RUST_LOG wins.
    #[arg(long)]
    log: Option<String>,

    /// Also write daily rolling log files here.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(name) = self.name {
            config.display_name = Some(name);
        }
        if let Some(transports) = self.transports {
            config.transports = transports;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(addr) = self.broadcast_addr {
            config.broadcast_addr = addr;
        }
        if let Some(port) = self.broadcast_port {
            config.broadcast_port = port;
        }
        if let Some(port) = self.direct_port {
            config.direct_port = port;
        }
        if let Some(port) = self.discovery_port {
            config.direct_discovery_port = port;
        }
        if let Some(port) = self.service_port {
            config.service_port = port;
        }
        if let Some(secs) = self.interval {
            config.discovery_interval_ms = secs * 1000;
        }
        if let Some(secs) = self.peer_timeout {
            config.peer_timeout_ms = secs * 1000;
        }
        if let Some(filter) = self.log {
            config.log_filter = filter;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    let _guard = peerprobe_lib::logging::init(&config.log_filter, config.log_dir.as_deref());
    peerprobe_lib::run(config).await
}
