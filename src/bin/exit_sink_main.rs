use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use traffic_network::config::Topology;
use traffic_network::engine::exit_sink::ExitSink;
use traffic_network::monitoring::telemetry::telemetry_for;

/// Runs the terminal sink that every route ends at.
#[derive(Parser)]
#[command(name = "exit_sink")]
struct Cli {
    #[arg(long, default_value = "config/topology.json")]
    topology: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let topology = Topology::from_file(&cli.topology)
        .with_context(|| format!("loading topology {}", cli.topology))?;
    let telemetry = telemetry_for(topology.telemetry_addr.as_deref());

    let mut sink = ExitSink::new(topology.sink_config(), telemetry);
    let addr = sink.start().await.context("starting exit sink")?;
    info!("sink up on {}, Ctrl-C to stop", addr);

    tokio::signal::ctrl_c().await?;
    sink.stop().await;
    let stats = sink.stats();
    println!(
        "Delivered {} vehicles, average time in network {} ms",
        stats.delivered(),
        stats.avg_dwell_ms()
    );
    Ok(())
}
