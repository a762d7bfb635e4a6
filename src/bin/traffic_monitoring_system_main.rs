use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use traffic_network::communication::listener::{bind, run_listener};
use traffic_network::config::Topology;
use traffic_network::monitoring::traffic_monitoring_system::{prepare_out_dir, TelemetryCollector};

/// Records STAT and LOG envelopes from every node into CSV files.
#[derive(Parser)]
#[command(name = "traffic_monitoring_system")]
struct Cli {
    #[arg(long, default_value = "config/topology.json")]
    topology: String,

    /// Listen address; defaults to the topology's telemetryAddr
    #[arg(long)]
    listen: Option<String>,

    /// Directory for the CSV files
    #[arg(long, default_value = ".")]
    out_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let listen = match cli.listen {
        Some(addr) => addr,
        None => Topology::from_file(&cli.topology)
            .with_context(|| format!("loading topology {}", cli.topology))?
            .telemetry_addr
            .context("topology has no telemetryAddr and --listen was not given")?,
    };
    let collector = Arc::new(TelemetryCollector::new(&cli.out_dir));
    prepare_out_dir(&collector).with_context(|| format!("creating {}", cli.out_dir))?;

    let listener = bind(&listen).await?;
    println!("Collecting telemetry on {}", listen);
    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(run_listener(listener, collector.clone(), stop_rx));

    tokio::signal::ctrl_c().await?;
    stop_tx.send_replace(true);
    server.await?;

    let summary = collector.summary()?;
    println!(
        "Recorded {} queue samples, {} delivery samples, {} events",
        summary.queue_samples, summary.delivery_samples, summary.events
    );
    Ok(())
}
