use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use traffic_network::communication::listener::{bind, run_listener};
use traffic_network::config::Topology;
use traffic_network::engine::exit_sink::ExitSink;
use traffic_network::engine::intersection_node::IntersectionNode;
use traffic_network::monitoring::telemetry::telemetry_for;
use traffic_network::monitoring::traffic_monitoring_system::{prepare_out_dir, TelemetryCollector};
use traffic_network::simulation_engine::vehicle_generator::VehicleGenerator;

/// Runs a whole topology in one process: collector, sink, every
/// intersection and every entry generator.
#[derive(Parser)]
#[command(name = "traffic_network")]
#[command(about = "Distributed intersection network, all nodes in one process")]
struct Cli {
    #[arg(long, default_value = "config/topology.json")]
    topology: String,

    /// Do not start the CSV collector even if telemetryAddr is set
    #[arg(long)]
    no_collector: bool,

    /// Directory for the collector's CSV files
    #[arg(long, default_value = ".")]
    out_dir: String,

    /// Stop each entry after this many vehicles
    #[arg(long)]
    count: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let topology = Topology::from_file(&cli.topology)
        .with_context(|| format!("loading topology {}", cli.topology))?;
    let (stop_tx, stop_rx) = watch::channel(false);

    // Collector first so the first STATs have somewhere to go.
    let collector = match (&topology.telemetry_addr, cli.no_collector) {
        (Some(addr), false) => {
            let collector = Arc::new(TelemetryCollector::new(&cli.out_dir));
            prepare_out_dir(&collector)?;
            let listener = bind(addr).await?;
            tokio::spawn(run_listener(listener, collector.clone(), stop_rx.clone()));
            Some(collector)
        }
        _ => None,
    };
    let telemetry = telemetry_for(topology.telemetry_addr.as_deref());

    let mut sink = ExitSink::new(topology.sink_config(), telemetry.clone());
    sink.start().await.context("starting exit sink")?;

    let mut nodes = Vec::new();
    for spec in &topology.intersections {
        let mut node = IntersectionNode::new(topology.node_config(&spec.id)?, telemetry.clone())?;
        node.start()
            .await
            .with_context(|| format!("starting intersection {}", spec.id))?;
        nodes.push(node);
    }

    let mut generators = JoinSet::new();
    for entry in &topology.entries {
        let mut config = topology.entry_config(&entry.id)?;
        if cli.count.is_some() {
            config.count = cli.count;
        }
        let generator = VehicleGenerator::new(config, telemetry.clone());
        generators.spawn(generator.run(stop_rx.clone()));
    }
    info!(
        "network up: {} intersections, {} entries; Ctrl-C to stop",
        nodes.len(),
        topology.entries.len()
    );

    tokio::signal::ctrl_c().await?;
    stop_tx.send_replace(true);
    while let Some(joined) = generators.join_next().await {
        if let Err(e) = joined {
            warn!("generator task failed: {}", e);
        }
    }
    for node in &mut nodes {
        node.stop().await;
    }
    sink.stop().await;

    let stats = sink.stats();
    println!(
        "Delivered {} vehicles, average time in network {} ms",
        stats.delivered(),
        stats.avg_dwell_ms()
    );
    if let Some(collector) = collector {
        let summary = collector.summary()?;
        println!(
            "Recorded {} queue samples, {} delivery samples, {} events under {}",
            summary.queue_samples,
            summary.delivery_samples,
            summary.events,
            collector.out_dir().display()
        );
    }
    Ok(())
}
