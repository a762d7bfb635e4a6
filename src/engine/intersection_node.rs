use log::{debug, error, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::communication::forwarder::{Forwarder, Outbound};
use crate::communication::listener::{self, Arrival, ArrivalHandler, EnvelopeHandler, VehicleIntake};
use crate::config::NodeConfig;
use crate::control_system::directional_queue::DirectionalQueue;
use crate::control_system::traffic_light_controller::{SchedulerPhase, TrafficLightController};
use crate::engine::report_drop;
use crate::error::NodeError;
use crate::models::vehicle::Vehicle;
use crate::monitoring::stats_publisher::{queue_stats, StatsPublisher};
use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::{LogLevel, StatPayload};

/// Puts arriving vehicles into the queue for their incoming direction.
pub struct InboundRouter {
    node_id: String,
    queues: Vec<Arc<DirectionalQueue>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl InboundRouter {
    fn queue_for(&self, direction: &str) -> Option<&DirectionalQueue> {
        self.queues
            .iter()
            .find(|q| q.direction() == direction)
            .map(Arc::as_ref)
    }
}

impl ArrivalHandler for InboundRouter {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn route_incoming(&self, vehicle: Vehicle, origin: &str) -> Arrival {
        match vehicle.current_stop() {
            Some(stop) if stop == self.node_id => {}
            Some(stop) => {
                let message = format!("dropping {}: route expects {} next", vehicle.id(), stop);
                report_drop(self.telemetry.as_ref(), &self.node_id, message);
                return Arrival::Dropped;
            }
            None => {
                let message = format!("dropping {}: route already complete", vehicle.id());
                report_drop(self.telemetry.as_ref(), &self.node_id, message);
                return Arrival::Dropped;
            }
        }
        let Some(queue) = self.queue_for(origin) else {
            let message = format!("dropping {}: no queue for direction {}", vehicle.id(), origin);
            report_drop(self.telemetry.as_ref(), &self.node_id, message);
            return Arrival::Dropped;
        };

        let id = vehicle.id().to_string();
        match queue.enqueue(vehicle) {
            Ok(()) => {
                debug!("[{}] {} queued at {}", self.node_id, id, origin);
                Arrival::Accepted
            }
            Err(full) => {
                let message = format!("{full}, closing connection from {origin}");
                report_drop(self.telemetry.as_ref(), &self.node_id, message);
                Arrival::Rejected
            }
        }
    }

    fn discard(&self, vehicle: Vehicle, origin: &str) {
        let message = format!(
            "dropping {}: sent behind a rejected vehicle on the closed connection from {}",
            vehicle.id(),
            origin
        );
        report_drop(self.telemetry.as_ref(), &self.node_id, message);
    }
}

/// Hands crossed vehicles to the forwarder for their next node.
pub struct OutboundRouter {
    node_id: String,
    sink_id: String,
    peers: HashMap<String, mpsc::Sender<Outbound>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl OutboundRouter {
    /// Advances the route by one hop and queues the vehicle for sending.
    /// Never blocks: a forwarder whose backlog is full drops the vehicle.
    pub fn route_outgoing(&self, mut vehicle: Vehicle) {
        vehicle.advance();
        let next = vehicle.current_stop().unwrap_or(&self.sink_id).to_string();
        let Some(peer) = self.peers.get(&next) else {
            let message = format!("dropping {}: no link to {}", vehicle.id(), next);
            report_drop(self.telemetry.as_ref(), &self.node_id, message);
            return;
        };
        let message = match peer.try_send(Outbound { to: next, vehicle }) {
            Ok(()) => return,
            Err(TrySendError::Full(outbound)) => format!(
                "dropping {}: forwarder to {} is backed up",
                outbound.vehicle.id(),
                outbound.to
            ),
            Err(TrySendError::Closed(outbound)) => format!(
                "dropping {}: forwarder to {} has stopped",
                outbound.vehicle.id(),
                outbound.to
            ),
        };
        report_drop(self.telemetry.as_ref(), &self.node_id, message);
    }
}

struct RunningNode {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// One intersection: queues per incoming direction, a light controller that
/// drains them, a listener that fills them, forwarders toward the next nodes
/// and a periodic stats publisher.
pub struct IntersectionNode {
    config: NodeConfig,
    queues: Vec<Arc<DirectionalQueue>>,
    inbound: Arc<InboundRouter>,
    telemetry: Arc<dyn TelemetrySink>,
    phase: Option<watch::Receiver<SchedulerPhase>>,
    running: Option<RunningNode>,
}

impl IntersectionNode {
    pub fn new(config: NodeConfig, telemetry: Arc<dyn TelemetrySink>) -> Result<Self, NodeError> {
        config.validate()?;
        let queues: Vec<Arc<DirectionalQueue>> = config
            .queues
            .iter()
            .map(|q| Arc::new(DirectionalQueue::new(&config.node_id, &q.direction, q.capacity)))
            .collect();
        let inbound = Arc::new(InboundRouter {
            node_id: config.node_id.clone(),
            queues: queues.clone(),
            telemetry: Arc::clone(&telemetry),
        });
        Ok(Self {
            config,
            queues,
            inbound,
            telemetry,
            phase: None,
            running: None,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Binds the listener, then spawns forwarders, light controller, listener
    /// and stats publisher. Nothing is spawned when binding fails.
    pub async fn start(&mut self) -> Result<SocketAddr, NodeError> {
        if self.running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        let node_id = self.config.node_id.clone();
        let tcp = listener::bind(&self.config.listen_addr).await?;
        let local_addr = tcp.local_addr().map_err(|source| NodeError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        })?;
        let controller = TrafficLightController::new(&node_id, self.queues.clone(), self.config.timings)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // One forwarder per distinct address, shared by every next node on it.
        let mut by_addr: HashMap<&str, mpsc::Sender<Outbound>> = HashMap::new();
        let mut peers = HashMap::new();
        for (next, addr) in &self.config.downstream {
            let sender = by_addr.entry(addr.as_str()).or_insert_with(|| {
                let forwarder = Forwarder::new(&node_id, addr, self.config.retry);
                let (sender, task) = forwarder.spawn(
                    self.config.forward_backlog,
                    Arc::clone(&self.telemetry),
                    stop_rx.clone(),
                );
                tasks.push(task);
                sender
            });
            peers.insert(next.clone(), sender.clone());
        }
        let outbound = OutboundRouter {
            node_id: node_id.clone(),
            sink_id: self.config.sink_id.clone(),
            peers,
            telemetry: Arc::clone(&self.telemetry),
        };

        let phase = controller.subscribe();
        self.phase = Some(phase.clone());
        tasks.push(tokio::spawn(controller.run(
            move |vehicle| outbound.route_outgoing(vehicle),
            stop_rx.clone(),
        )));

        let intake: Arc<dyn EnvelopeHandler> = Arc::new(VehicleIntake(Arc::clone(&self.inbound)));
        tasks.push(tokio::spawn(listener::run_listener(tcp, intake, stop_rx.clone())));

        let publisher = StatsPublisher::new(&node_id, self.config.stat_interval, Arc::clone(&self.telemetry));
        let queues = self.queues.clone();
        tasks.push(tokio::spawn(publisher.run(
            move || queue_stats(&queues, *phase.borrow()),
            stop_rx,
        )));

        info!(
            "[{}] listening on {} with {} queues and {} downstream links",
            node_id,
            local_addr,
            self.queues.len(),
            self.config.downstream.len()
        );
        self.telemetry
            .publish_log(&node_id, LogLevel::Info, format!("started on {local_addr}"));
        self.running = Some(RunningNode {
            local_addr,
            stop_tx,
            tasks,
        });
        Ok(local_addr)
    }

    /// Signals every task to stop and waits for them. Vehicles still queued
    /// or in flight are discarded.
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
        info!("[{}] stopped", self.config.node_id);
    }

    /// Current queue lengths, lights and counters. All lights read closed
    /// while the node is not running.
    pub fn snapshot(&self) -> StatPayload {
        let phase = match (&self.running, &self.phase) {
            (Some(_), Some(phase)) => *phase.borrow(),
            _ => SchedulerPhase::AllRed,
        };
        queue_stats(&self.queues, phase)
    }

    /// Hands a vehicle to this node as if it arrived over the network.
    pub fn inject(&self, vehicle: Vehicle, origin: &str) -> Arrival {
        self.inbound.route_incoming(vehicle, origin)
    }
}

impl Drop for IntersectionNode {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop_tx.send_replace(true);
        }
    }
}
