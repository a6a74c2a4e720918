use gossip_membership::membership::config::GossipConfig;
use gossip_membership::membership::service::GossipService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_PORT: u16 = 9090;
const DEFAULT_DEMO_DURATION: Duration = Duration::from_secs(6);
const STATS_INTERVAL: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--seed <addr:port>]", args[0]);
        eprintln!(
            "       {} --demo <nodes> [--base-port <port>] [--duration-secs <secs>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:9090", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:9091 --seed 127.0.0.1:9090",
            args[0]
        );
        eprintln!("Example: {} --demo 11", args[0]);

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed: Option<SocketAddr> = None;
    let mut demo_nodes: Option<usize> = None;
    let mut base_port = DEFAULT_BASE_PORT;
    let mut duration = DEFAULT_DEMO_DURATION;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(v)) => {
                bind_addr = Some(v.parse()?);
                i += 2;
            }
            ("--seed", Some(v)) => {
                seed = Some(v.parse()?);
                i += 2;
            }
            ("--demo", Some(v)) => {
                demo_nodes = Some(v.parse()?);
                i += 2;
            }
            ("--base-port", Some(v)) => {
                base_port = v.parse()?;
                i += 2;
            }
            ("--duration-secs", Some(v)) => {
                duration = Duration::from_secs(v.parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let config = GossipConfig::from_env();
    tracing::info!("Gossip config: {:?}", config);

    match (demo_nodes, bind_addr) {
        (Some(nodes), _) => run_demo(nodes, base_port, duration, config).await,
        (None, Some(bind_addr)) => run_node(bind_addr, seed, config).await,
        (None, None) => anyhow::bail!("either --bind or --demo is required"),
    }
}

/// Runs a single node until Ctrl+C.
async fn run_node(
    bind_addr: SocketAddr,
    seed: Option<SocketAddr>,
    config: GossipConfig,
) -> anyhow::Result<()> {
    tracing::info!("Starting node on {}", bind_addr);
    match seed {
        Some(seed) => tracing::info!("Seed node: {}", seed),
        None => tracing::info!("Starting as seed node (founder)"),
    }

    let service = GossipService::new(bind_addr, seed, config).await?;
    register_logging_handlers(&service);
    service.clone().start().await;

    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);

        loop {
            interval.tick().await;
            if stats_service.is_stopped() {
                break;
            }
            log_view(&stats_service);
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    service.stop();
    Ok(())
}

/// Starts `nodes` nodes on consecutive local ports, each seeded with its predecessor,
/// lets them gossip for `duration` and prints every node's view before stopping.
async fn run_demo(
    nodes: usize,
    base_port: u16,
    duration: Duration,
    config: GossipConfig,
) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "--demo needs at least one node");
    anyhow::ensure!(
        usize::from(base_port) + nodes <= usize::from(u16::MAX),
        "port range starting at {} is too small for {} nodes",
        base_port,
        nodes
    );

    let mut services: Vec<Arc<GossipService>> = Vec::with_capacity(nodes);

    for i in 0..nodes {
        let port = base_port + i as u16;
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let seed = services.last().map(|previous| previous.local_addr);

        let service = GossipService::new(bind_addr, seed, config).await?;
        register_logging_handlers(&service);
        service.clone().start().await;
        services.push(service);
    }

    tracing::info!("Started {} nodes, gossiping for {:?}", nodes, duration);
    tokio::time::sleep(duration).await;

    for service in &services {
        log_view(service);
    }

    for service in &services {
        service.stop();
    }

    Ok(())
}

fn register_logging_handlers(service: &GossipService) {
    let local = service.local_addr;

    service.on_new_member(move |addr| {
        tracing::info!("[{}] Connected to {}", local, addr);
    });
    service.on_failed_member(move |addr| {
        tracing::warn!("[{}] Node {} failed", local, addr);
    });
    service.on_removed_member(move |addr| {
        tracing::info!("[{}] Node {} removed", local, addr);
    });
    service.on_revived_member(move |addr| {
        tracing::info!("[{}] Node {} revived", local, addr);
    });
}

fn log_view(service: &GossipService) {
    let alive = service.get_alive_members();
    let failed = service.get_failed_members();

    tracing::info!(
        "Health status {}: {} alive, {} failed",
        service.local_addr,
        alive.len(),
        failed.len()
    );

    for record in service.members.snapshot() {
        tracing::info!(
            "  - {} heartbeat={} failed={}",
            record.address,
            record.heartbeat,
            record.failed
        );
    }
}
