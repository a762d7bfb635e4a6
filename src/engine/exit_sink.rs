use log::{error, info};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::communication::listener::{self, Arrival, ArrivalHandler, EnvelopeHandler, VehicleIntake};
use crate::config::SinkConfig;
use crate::engine::report_drop;
use crate::error::NodeError;
use crate::models::vehicle::Vehicle;
use crate::monitoring::stats_publisher::StatsPublisher;
use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::{current_timestamp, LogLevel, StatPayload};

/// Running totals of vehicles that completed their route.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    total_dwell_ms: AtomicU64,
}

impl DeliveryStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn avg_dwell_ms(&self) -> u64 {
        match self.delivered() {
            0 => 0,
            n => self.total_dwell_ms.load(Ordering::Relaxed) / n,
        }
    }

    fn record(&self, dwell_ms: u64) {
        self.total_dwell_ms.fetch_add(dwell_ms, Ordering::Relaxed);
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload(&self) -> StatPayload {
        StatPayload {
            delivered: Some(self.delivered()),
            avg_dwell_ms: Some(self.avg_dwell_ms()),
            ..StatPayload::default()
        }
    }
}

struct SinkArrivals {
    node_id: String,
    stats: Arc<DeliveryStats>,
    observer: Mutex<Option<mpsc::UnboundedSender<Vehicle>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ArrivalHandler for SinkArrivals {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn route_incoming(&self, mut vehicle: Vehicle, origin: &str) -> Arrival {
        if let Some(stop) = vehicle.current_stop() {
            if stop != self.node_id {
                let message = format!("dropping {}: route expects {} next", vehicle.id(), stop);
                report_drop(self.telemetry.as_ref(), &self.node_id, message);
                return Arrival::Dropped;
            }
            vehicle.advance();
        }
        if vehicle.route().is_empty() {
            let message = format!("dropping {}: empty route", vehicle.id());
            report_drop(self.telemetry.as_ref(), &self.node_id, message);
            return Arrival::Dropped;
        }

        vehicle.mark_exited(current_timestamp());
        let dwell_ms = vehicle.dwell_ms().unwrap_or(0);
        self.stats.record(dwell_ms);
        let message = format!(
            "{} ({}) exited via {} after {} ms, route {}",
            vehicle.id(),
            vehicle.kind(),
            origin,
            dwell_ms,
            vehicle.route().join(" -> ")
        );
        info!("[{}] {}", self.node_id, message);
        self.telemetry.publish_log(&self.node_id, LogLevel::Info, message);

        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = observer.as_ref() {
            if tx.send(vehicle).is_err() {
                *observer = None;
            }
        }
        Arrival::Accepted
    }
}

struct RunningSink {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Final hop of every route. Accepts any vehicle whose route ends here,
/// stamps its exit time and keeps delivery totals.
pub struct ExitSink {
    config: SinkConfig,
    stats: Arc<DeliveryStats>,
    arrivals: Arc<SinkArrivals>,
    telemetry: Arc<dyn TelemetrySink>,
    running: Option<RunningSink>,
}

impl ExitSink {
    pub fn new(config: SinkConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let stats = Arc::new(DeliveryStats::default());
        let arrivals = Arc::new(SinkArrivals {
            node_id: config.node_id.clone(),
            stats: Arc::clone(&stats),
            observer: Mutex::new(None),
            telemetry: Arc::clone(&telemetry),
        });
        Self {
            config,
            stats,
            arrivals,
            telemetry,
            running: None,
        }
    }

    /// Every delivered vehicle is also sent to the returned receiver.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<Vehicle> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.arrivals.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        Arc::clone(&self.stats)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub async fn start(&mut self) -> Result<SocketAddr, NodeError> {
        if self.running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        let tcp = listener::bind(&self.config.listen_addr).await?;
        let local_addr = tcp.local_addr().map_err(|source| NodeError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        })?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let intake: Arc<dyn EnvelopeHandler> = Arc::new(VehicleIntake(Arc::clone(&self.arrivals)));
        let listener_task = tokio::spawn(listener::run_listener(tcp, intake, stop_rx.clone()));

        let publisher = StatsPublisher::new(
            &self.config.node_id,
            self.config.stat_interval,
            Arc::clone(&self.telemetry),
        );
        let stats = Arc::clone(&self.stats);
        let publisher_task = tokio::spawn(publisher.run(move || stats.payload(), stop_rx));

        info!("[{}] sink listening on {}", self.config.node_id, local_addr);
        self.running = Some(RunningSink {
            local_addr,
            stop_tx,
            tasks: vec![listener_task, publisher_task],
        });
        Ok(local_addr)
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop_tx.send_replace(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                error!("[{}] task ended abnormally: {}", self.config.node_id, e);
            }
        }
        info!(
            "[{}] stopped after {} deliveries",
            self.config.node_id,
            self.stats.delivered()
        );
    }
}

impl Drop for ExitSink {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop_tx.send_replace(true);
        }
    }
}
