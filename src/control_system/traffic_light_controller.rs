use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::communication::stop_requested;
use crate::control_system::directional_queue::DirectionalQueue;
use crate::error::SchedulerError;
use crate::models::vehicle::Vehicle;

/// Light of a single approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightState {
    Open,
    Closed,
}

impl LightState {
    pub fn is_open(self) -> bool {
        self == LightState::Open
    }
}

/// Phase of a whole intersection. Holding at most one open index is what
/// keeps two approaches from ever being green together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    AllRed,
    Open(usize),
}

impl SchedulerPhase {
    pub fn light_for(self, queue_index: usize) -> LightState {
        match self {
            SchedulerPhase::Open(open) if open == queue_index => LightState::Open,
            _ => LightState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightTimings {
    /// Longest time a single approach stays open.
    pub green: Duration,
    /// Gap with every light closed between two open phases.
    pub all_red: Duration,
    /// Retry interval while the open queue is empty.
    pub poll_interval: Duration,
    /// Crossing time of a medium vehicle.
    pub base_crossing: Duration,
}

impl LightTimings {
    pub fn from_millis(green: u64, all_red: u64, poll_interval: u64, base_crossing: u64) -> Self {
        Self {
            green: Duration::from_millis(green),
            all_red: Duration::from_millis(all_red),
            poll_interval: Duration::from_millis(poll_interval),
            base_crossing: Duration::from_millis(base_crossing),
        }
    }

    pub fn crossing_time(&self, vehicle: &Vehicle) -> Duration {
        vehicle.kind().crossing_time(self.base_crossing)
    }
}

/// Round-robin bookkeeping, separate from any timing.
///
/// AllRed -> Open(0) -> AllRed -> Open(1) -> ... -> Open(n-1) -> AllRed -> Open(0)
#[derive(Debug, Clone)]
pub struct PhaseCycle {
    queue_count: usize,
    next: usize,
    phase: SchedulerPhase,
}

impl PhaseCycle {
    pub fn new(queue_count: usize) -> Result<Self, SchedulerError> {
        if queue_count == 0 {
            return Err(SchedulerError::NoQueues);
        }
        Ok(Self {
            queue_count,
            next: 0,
            phase: SchedulerPhase::AllRed,
        })
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn advance(&mut self) -> SchedulerPhase {
        self.phase = match self.phase {
            SchedulerPhase::AllRed => SchedulerPhase::Open(self.next),
            SchedulerPhase::Open(current) => {
                self.next = (current + 1) % self.queue_count;
                SchedulerPhase::AllRed
            }
        };
        self.phase
    }
}

/// Drives the lights of one intersection.
///
/// Opens one queue at a time in a fixed rotation, drains it for at most
/// `green`, then closes everything for `all_red` before the next queue. Every
/// vehicle that finishes crossing is handed to `on_exit`; the controller
/// itself does no I/O.
pub struct TrafficLightController {
    node_id: String,
    queues: Vec<Arc<DirectionalQueue>>,
    timings: LightTimings,
    cycle: PhaseCycle,
    phase_tx: watch::Sender<SchedulerPhase>,
}

impl TrafficLightController {
    pub fn new(
        node_id: impl Into<String>,
        queues: Vec<Arc<DirectionalQueue>>,
        timings: LightTimings,
    ) -> Result<Self, SchedulerError> {
        let cycle = PhaseCycle::new(queues.len())?;
        let (phase_tx, _) = watch::channel(cycle.phase());
        Ok(Self {
            node_id: node_id.into(),
            queues,
            timings,
            cycle,
            phase_tx,
        })
    }

    /// Receiver that observes every phase change.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase_tx.subscribe()
    }

    /// Runs until `shutdown` turns true. The flag is checked between phases
    /// and between vehicles, never in the middle of a crossing.
    pub async fn run<F>(mut self, mut on_exit: F, shutdown: watch::Receiver<bool>)
    where
        F: FnMut(Vehicle),
    {
        debug!(
            "[{}] light controller started with {} queues",
            self.node_id,
            self.queues.len()
        );
        while !stop_signalled(&shutdown) {
            match self.cycle.phase() {
                SchedulerPhase::AllRed => idle(self.timings.all_red, &shutdown).await,
                SchedulerPhase::Open(index) => self.drain(index, &mut on_exit, &shutdown).await,
            }
            if stop_signalled(&shutdown) {
                break;
            }
            let phase = self.cycle.advance();
            self.announce(phase);
        }
        self.announce(SchedulerPhase::AllRed);
        debug!("[{}] light controller stopped", self.node_id);
    }

    fn announce(&self, phase: SchedulerPhase) {
        match phase {
            SchedulerPhase::Open(index) => debug!(
                "[{}] green for {}",
                self.node_id,
                self.queues[index].direction()
            ),
            SchedulerPhase::AllRed => debug!("[{}] all red", self.node_id),
        }
        self.phase_tx.send_replace(phase);
    }

    /// Lets vehicles of one queue cross until its green time runs out.
    async fn drain<F>(&self, index: usize, on_exit: &mut F, shutdown: &watch::Receiver<bool>)
    where
        F: FnMut(Vehicle),
    {
        let queue = &self.queues[index];
        let deadline = Instant::now() + self.timings.green;
        loop {
            if stop_signalled(shutdown) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let timings = self.timings;
            match queue.try_dequeue_if(|v| timings.crossing_time(v) <= remaining) {
                Some(vehicle) => {
                    sleep(timings.crossing_time(&vehicle)).await;
                    debug!(
                        "[{}] {} crossed from {}",
                        self.node_id,
                        vehicle.id(),
                        queue.direction()
                    );
                    on_exit(vehicle);
                }
                // Only this task dequeues, so a non-empty queue here means
                // either the head is too slow for the time left or it just
                // arrived.
                None => {
                    let head = queue.peek_kind();
                    match head.map(|kind| kind.crossing_time(timings.base_crossing)) {
                        Some(crossing) if crossing > remaining => {
                            idle(remaining, shutdown).await;
                            return;
                        }
                        Some(_) => continue,
                        None => idle(timings.poll_interval.min(remaining), shutdown).await,
                    }
                }
            }
        }
    }
}

/// A dropped sender counts as a stop request.
fn stop_signalled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleeps, waking early if a stop is requested.
async fn idle(duration: Duration, shutdown: &watch::Receiver<bool>) {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = sleep(duration) => {}
        _ = stop_requested(&mut shutdown) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vehicle::VehicleKind;
    use tokio::sync::mpsc;

    fn queues(n: usize, capacity: usize) -> Vec<Arc<DirectionalQueue>> {
        (0..n)
            .map(|i| Arc::new(DirectionalQueue::new("Cr1", format!("D{i}"), capacity)))
            .collect()
    }

    fn vehicle(id: &str, kind: VehicleKind) -> Vehicle {
        Vehicle::new(id, kind, vec!["Cr1".to_string(), "S".to_string()])
    }

    fn assert_near(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    /// Records (phase, time since start) until `count` changes are seen.
    async fn record_phases(
        mut phases: watch::Receiver<SchedulerPhase>,
        start: Instant,
        count: usize,
    ) -> Vec<(SchedulerPhase, Duration)> {
        let mut seen = Vec::new();
        while seen.len() < count {
            phases.changed().await.unwrap();
            let phase = *phases.borrow_and_update();
            seen.push((phase, start.elapsed()));
        }
        seen
    }

    #[test]
    fn zero_queues_fail_at_construction() {
        let timings = LightTimings::from_millis(100, 20, 10, 10);
        let result = TrafficLightController::new("Cr1", Vec::new(), timings);
        assert_eq!(result.err(), Some(SchedulerError::NoQueues));
    }

    #[test]
    fn phase_cycle_rotates_through_all_red() {
        let mut cycle = PhaseCycle::new(3).unwrap();
        let phases: Vec<_> = (0..7).map(|_| cycle.advance()).collect();
        assert_eq!(
            phases,
            vec![
                SchedulerPhase::Open(0),
                SchedulerPhase::AllRed,
                SchedulerPhase::Open(1),
                SchedulerPhase::AllRed,
                SchedulerPhase::Open(2),
                SchedulerPhase::AllRed,
                SchedulerPhase::Open(0),
            ]
        );
    }

    #[test]
    fn only_the_open_index_is_green() {
        let phase = SchedulerPhase::Open(1);
        assert_eq!(phase.light_for(0), LightState::Closed);
        assert_eq!(phase.light_for(1), LightState::Open);
        assert_eq!(SchedulerPhase::AllRed.light_for(1), LightState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn two_queues_alternate_with_safety_gap() {
        let timings = LightTimings::from_millis(100, 20, 10, 10);
        let controller = TrafficLightController::new("Cr1", queues(2, 4), timings).unwrap();
        let phases = controller.subscribe();
        assert_eq!(*phases.borrow(), SchedulerPhase::AllRed);

        let (stop_tx, stop_rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(controller.run(|_| {}, stop_rx));

        let seen = record_phases(phases, start, 4).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(seen[0].0, SchedulerPhase::Open(0));
        assert_near(seen[0].1, 20);
        assert_eq!(seen[1].0, SchedulerPhase::AllRed);
        assert_near(seen[1].1, 120);
        assert_eq!(seen[2].0, SchedulerPhase::Open(1));
        assert_near(seen[2].1, 140);
        assert_eq!(seen[3].0, SchedulerPhase::AllRed);
        assert_near(seen[3].1, 240);
    }

    #[tokio::test(start_paused = true)]
    async fn every_open_phase_follows_a_full_all_red_gap() {
        let timings = LightTimings::from_millis(50, 15, 5, 10);
        let all_queues = queues(3, 8);
        for (i, queue) in all_queues.iter().enumerate() {
            for j in 0..3 {
                queue.enqueue(vehicle(&format!("q{i}-{j}"), VehicleKind::Light)).unwrap();
            }
        }
        let controller = TrafficLightController::new("Cr1", all_queues, timings).unwrap();
        let phases = controller.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(controller.run(|_| {}, stop_rx));

        let seen = record_phases(phases, start, 12).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let mut last_all_red = Duration::ZERO;
        let mut open = None;
        for (phase, at) in seen {
            match phase {
                SchedulerPhase::AllRed => {
                    assert!(open.is_some(), "all red without a preceding open phase");
                    open = None;
                    last_all_red = at;
                }
                SchedulerPhase::Open(index) => {
                    assert!(open.is_none(), "queue {index} opened while another was open");
                    assert!(at - last_all_red >= timings.all_red);
                    open = Some(index);
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_queue_opens_within_one_cycle() {
        let timings = LightTimings::from_millis(40, 10, 5, 10);
        let n = 4;
        let controller = TrafficLightController::new("Cr1", queues(n, 2), timings).unwrap();
        let phases = controller.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(controller.run(|_| {}, stop_rx));

        let seen = record_phases(phases, start, 2 * n).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let bound = (timings.green + timings.all_red) * n as u32;
        for index in 0..n {
            let first_open = seen
                .iter()
                .find(|(phase, _)| *phase == SchedulerPhase::Open(index))
                .map(|(_, at)| *at)
                .expect("queue never opened");
            assert!(first_open <= bound, "queue {index} first opened at {first_open:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_in_fifo_order_with_crossing_time() {
        let timings = LightTimings::from_millis(100, 20, 10, 10);
        let all_queues = queues(1, 8);
        for id in ["A", "B", "C"] {
            all_queues[0].enqueue(vehicle(id, VehicleKind::Medium)).unwrap();
        }
        let controller =
            TrafficLightController::new("Cr1", all_queues.clone(), timings).unwrap();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(controller.run(
            move |v: Vehicle| {
                let _ = exit_tx.send((v.id().to_string(), start.elapsed()));
            },
            stop_rx,
        ));

        let mut exits = Vec::new();
        for _ in 0..3 {
            exits.push(exit_rx.recv().await.unwrap());
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let ids: Vec<&str> = exits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_near(exits[0].1, 30);
        assert_near(exits[1].1, 40);
        assert_near(exits[2].1, 50);
        assert_eq!(all_queues[0].snapshot().drained, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicle_that_cannot_finish_waits_for_next_turn() {
        // Heavy crossing is 80ms, so only one fits in a 100ms green.
        let timings = LightTimings::from_millis(100, 20, 10, 40);
        let all_queues = queues(1, 4);
        all_queues[0].enqueue(vehicle("H1", VehicleKind::Heavy)).unwrap();
        all_queues[0].enqueue(vehicle("H2", VehicleKind::Heavy)).unwrap();

        let controller = TrafficLightController::new("Cr1", all_queues, timings).unwrap();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(controller.run(
            move |v: Vehicle| {
                let _ = exit_tx.send((v.id().to_string(), start.elapsed()));
            },
            stop_rx,
        ));

        let first = exit_rx.recv().await.unwrap();
        let second = exit_rx.recv().await.unwrap();
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(first.0, "H1");
        assert_near(first.1, 100);
        // Phase ends at 120, next opens at 140, crossing takes 80.
        assert_eq!(second.0, "H2");
        assert_near(second.1, 220);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_every_light() {
        let timings = LightTimings::from_millis(1000, 20, 10, 10);
        let controller = TrafficLightController::new("Cr1", queues(2, 2), timings).unwrap();
        let mut phases = controller.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(|_| {}, stop_rx));

        phases.changed().await.unwrap();
        assert_eq!(*phases.borrow_and_update(), SchedulerPhase::Open(0));
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(*phases.borrow(), SchedulerPhase::AllRed);
    }
}
