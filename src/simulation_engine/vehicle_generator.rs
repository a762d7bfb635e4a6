use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::forwarder::Forwarder;
use crate::communication::stop_requested;
use crate::config::EntryConfig;
use crate::models::vehicle::{Vehicle, VehicleKind};
use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::LogLevel;

/// Totals reported when a generator finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub spawned: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Picks a vehicle kind: 50% light, 35% medium, 15% heavy.
pub fn random_kind<R: Rng>(rng: &mut R) -> VehicleKind {
    let rand_val: f64 = rng.random_range(0.0..1.0);
    if rand_val < 0.50 {
        VehicleKind::Light
    } else if rand_val < 0.85 {
        VehicleKind::Medium
    } else {
        VehicleKind::Heavy
    }
}

/// Creates vehicles at one entry point and pushes them into the network.
pub struct VehicleGenerator {
    config: EntryConfig,
    telemetry: Arc<dyn TelemetrySink>,
    next_seq: u64,
}

impl VehicleGenerator {
    pub fn new(config: EntryConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            telemetry,
            next_seq: 1,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.config.entry_id
    }

    /// Builds the next vehicle: id `<entry>-<seq>`, random kind and one of
    /// the configured routes chosen uniformly.
    pub fn next_vehicle<R: Rng>(&mut self, rng: &mut R) -> Vehicle {
        let id = format!("{}-{:03}", self.config.entry_id, self.next_seq);
        self.next_seq += 1;
        let kind = random_kind(rng);
        let route = if self.config.routes.is_empty() {
            Vec::new()
        } else {
            self.config.routes[rng.random_range(0..self.config.routes.len())].clone()
        };
        Vehicle::new(id, kind, route)
    }

    /// Spawns a vehicle every interval until `count` is reached or the stop
    /// flag is raised. Sends are sequential, so a dead first hop slows the
    /// generator down instead of piling up vehicles.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> GeneratorReport {
        let mut rng = SmallRng::from_os_rng();
        let mut forwarders: HashMap<String, Forwarder> = self
            .config
            .downstream
            .iter()
            .map(|(node, addr)| {
                let forwarder = Forwarder::new(&self.config.entry_id, addr, self.config.retry);
                (node.clone(), forwarder)
            })
            .collect();
        let mut report = GeneratorReport::default();
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "[{}] generating every {:?} over {} routes",
            self.config.entry_id,
            self.config.interval,
            self.config.routes.len()
        );
        while self.config.count.map_or(true, |count| report.spawned < count) {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            let vehicle = self.next_vehicle(&mut rng);
            report.spawned += 1;
            let id = vehicle.id().to_string();

            let Some(first) = vehicle.current_stop().map(str::to_string) else {
                warn!("[{}] {} has an empty route", self.config.entry_id, id);
                report.failed += 1;
                continue;
            };
            let Some(forwarder) = forwarders.get_mut(&first) else {
                warn!("[{}] no link to {} for {}", self.config.entry_id, first, id);
                report.failed += 1;
                continue;
            };
            debug!("[{}] spawned {} ({}) toward {}", self.config.entry_id, id, vehicle.kind(), first);
            match forwarder.send(vehicle, &first).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    let message = format!("dropping {id}: {e}");
                    warn!("[{}] {}", self.config.entry_id, message);
                    self.telemetry
                        .publish_log(&self.config.entry_id, LogLevel::Warn, message);
                }
            }
        }
        info!(
            "[{}] generator finished: {} spawned, {} sent, {} failed",
            self.config.entry_id, report.spawned, report.sent, report.failed
        );
        report
    }
}
