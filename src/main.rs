use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use herdkv::config::{DEFAULT_PORT, DispatchStrategy, MAX_CONNECTIONS, MAX_EVENTS, ServerConfig};
use herdkv::handler::NotFound;
use herdkv::metrics;
use herdkv::server::{self, Server};

#[derive(Parser)]
#[command(about = "Epoll key-value front-end with selectable dispatch strategies")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// How connection readiness is distributed across workers
    #[arg(short, long, value_enum, default_value_t = DispatchStrategy::PortSharing)]
    strategy: DispatchStrategy,

    /// Worker threads (default: one per CPU in the affinity mask)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Events returned per epoll_wait
    #[arg(long, default_value_t = MAX_EVENTS)]
    max_events: usize,

    /// Connection limit per table
    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_thread_names(true).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = ServerConfig {
        addr: SocketAddr::new(args.bind, args.port),
        strategy: args.strategy,
        workers: args.workers.unwrap_or_else(server::default_workers),
        max_events: args.max_events,
        max_connections: args.max_connections,
    };

    let server = Server::bind(config, Arc::new(NotFound)).context("server startup")?;
    metrics::spawn_reporter();
    let handle = server.spawn().context("starting workers")?;
    info!(addr = %handle.local_addr(), workers = handle.workers(), "ready");

    handle.join().context("worker exited")?;
    Ok(())
}
