use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::stop_requested;
use crate::control_system::directional_queue::DirectionalQueue;
use crate::control_system::traffic_light_controller::SchedulerPhase;
use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::{QueueStat, StatPayload};

/// Samples a node on a fixed interval and publishes each sample as a STAT.
pub struct StatsPublisher {
    node_id: String,
    interval: Duration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl StatsPublisher {
    pub fn new(node_id: impl Into<String>, interval: Duration, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            node_id: node_id.into(),
            interval,
            telemetry,
        }
    }

    /// Publishes `sample()` immediately and then once per interval until the
    /// stop flag is raised. Sampling only reads the node.
    pub async fn run<F>(self, mut sample: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> StatPayload,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => self.telemetry.publish_stat(&self.node_id, sample()),
            }
        }
        debug!("[{}] stats publisher stopped", self.node_id);
    }
}

/// Per-queue statistics for an intersection in the given phase.
pub fn queue_stats(queues: &[Arc<DirectionalQueue>], phase: SchedulerPhase) -> StatPayload {
    let queues = queues
        .iter()
        .enumerate()
        .map(|(index, queue)| {
            let snapshot = queue.snapshot();
            QueueStat {
                direction: queue.direction().to_string(),
                length: snapshot.length,
                max: snapshot.max,
                avg_wait_ms: snapshot.avg_wait.as_millis() as u64,
                light_open: phase.light_for(index).is_open(),
                capacity: snapshot.capacity,
                drained: snapshot.drained,
                rejected: snapshot.rejected,
            }
        })
        .collect();
    StatPayload {
        queues,
        ..StatPayload::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vehicle::{Vehicle, VehicleKind};
    use crate::monitoring::telemetry::MemoryTelemetrySink;

    fn queues() -> Vec<Arc<DirectionalQueue>> {
        let e1 = Arc::new(DirectionalQueue::new("Cr1", "E1", 5));
        let cr2 = Arc::new(DirectionalQueue::new("Cr1", "Cr2", 5));
        for id in ["a", "b"] {
            e1.enqueue(Vehicle::new(id, VehicleKind::Light, vec!["Cr1".to_string()]))
                .unwrap();
        }
        vec![e1, cr2]
    }

    #[test]
    fn queue_stats_reflect_lights_and_lengths() {
        let stat = queue_stats(&queues(), SchedulerPhase::Open(1));
        assert_eq!(stat.queues.len(), 2);
        assert_eq!(stat.queues[0].direction, "E1");
        assert_eq!(stat.queues[0].length, 2);
        assert!(!stat.queues[0].light_open);
        assert!(stat.queues[1].light_open);
        assert!(stat.delivered.is_none());

        let all_red = queue_stats(&queues(), SchedulerPhase::AllRed);
        assert!(all_red.queues.iter().all(|q| !q.light_open));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_once_per_interval() {
        let telemetry = Arc::new(MemoryTelemetrySink::default());
        let publisher = StatsPublisher::new("Cr1", Duration::from_millis(1000), telemetry.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let queues = queues();
        let task = tokio::spawn(publisher.run(
            move || queue_stats(&queues, SchedulerPhase::AllRed),
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop_tx.send_replace(true);
        task.await.unwrap();

        // Ticks at 0, 1000, 2000 and 3000 ms.
        assert_eq!(telemetry.stats_from("Cr1").len(), 4);
    }
}
