use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::watch;
use traffic_network::config::Topology;
use traffic_network::monitoring::telemetry::telemetry_for;
use traffic_network::simulation_engine::vehicle_generator::VehicleGenerator;

/// Injects vehicles at one entry point.
#[derive(Parser)]
#[command(name = "entry_generator")]
struct Cli {
    #[arg(long, default_value = "config/topology.json")]
    topology: String,

    /// Entry id, e.g. E1
    #[arg(long)]
    entry: String,

    /// Stop after this many vehicles (overrides the topology)
    #[arg(long)]
    count: Option<u64>,

    /// Milliseconds between vehicles (overrides the topology)
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let topology = Topology::from_file(&cli.topology)
        .with_context(|| format!("loading topology {}", cli.topology))?;
    let mut config = topology.entry_config(&cli.entry)?;
    if let Some(count) = cli.count {
        config.count = Some(count);
    }
    if let Some(interval_ms) = cli.interval_ms {
        anyhow::ensure!(interval_ms > 0, "--interval-ms must be positive");
        config.interval = Duration::from_millis(interval_ms);
    }
    let telemetry = telemetry_for(topology.telemetry_addr.as_deref());

    let (stop_tx, stop_rx) = watch::channel(false);
    let generator = tokio::spawn(VehicleGenerator::new(config, telemetry).run(stop_rx));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => { stop_tx.send_replace(true); }
        _ = stop_tx.closed() => {}
    }
    let report = generator.await?;
    println!(
        "{}: spawned {}, sent {}, failed {}",
        cli.entry, report.spawned, report.sent, report.failed
    );
    Ok(())
}
