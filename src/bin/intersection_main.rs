use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use traffic_network::config::Topology;
use traffic_network::engine::intersection_node::IntersectionNode;
use traffic_network::monitoring::telemetry::telemetry_for;

/// Runs one intersection of the network until Ctrl-C.
#[derive(Parser)]
#[command(name = "intersection")]
struct Cli {
    /// Topology file shared by every node
    #[arg(long, default_value = "config/topology.json")]
    topology: String,

    /// Intersection id, e.g. Cr1
    #[arg(long)]
    node: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let topology = Topology::from_file(&cli.topology)
        .with_context(|| format!("loading topology {}", cli.topology))?;
    let config = topology.node_config(&cli.node)?;
    let telemetry = telemetry_for(topology.telemetry_addr.as_deref());

    let mut node = IntersectionNode::new(config, telemetry)?;
    let addr = node
        .start()
        .await
        .with_context(|| format!("starting intersection {}", cli.node))?;
    info!("intersection {} up on {}, Ctrl-C to stop", cli.node, addr);

    tokio::signal::ctrl_c().await?;
    node.stop().await;
    Ok(())
}
