use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CapacityExceeded;
use crate::models::vehicle::{Vehicle, VehicleKind};

/// Point-in-time view of a queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub length: usize,
    pub max: usize,
    pub capacity: usize,
    pub avg_wait: Duration,
    pub drained: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    vehicles: VecDeque<Vehicle>,
    max_length: usize,
    total_wait: Duration,
    drained: u64,
    rejected: u64,
}

/// Bounded FIFO of vehicles waiting on one approach of an intersection.
///
/// Shared between the inbound listener (enqueue) and the light controller
/// (dequeue). Every operation takes the internal lock once and never awaits
/// while holding it.
#[derive(Debug)]
pub struct DirectionalQueue {
    node_id: String,
    direction: String,
    capacity: usize,
    state: Mutex<QueueState>,
}

impl DirectionalQueue {
    pub fn new(node_id: impl Into<String>, direction: impl Into<String>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            direction: direction.into(),
            capacity,
            state: Mutex::new(QueueState {
                vehicles: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn direction(&self) -> &str {
        &self.direction
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic elsewhere cannot leave the counters half-updated, so a
    // poisoned lock is still safe to use.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a vehicle at the tail. A full queue hands the vehicle back
    /// inside the error instead of blocking.
    pub fn enqueue(&self, mut vehicle: Vehicle) -> Result<(), CapacityExceeded> {
        let mut state = self.state();
        if state.vehicles.len() >= self.capacity {
            state.rejected += 1;
            return Err(CapacityExceeded {
                direction: self.direction.clone(),
                capacity: self.capacity,
                vehicle,
            });
        }
        vehicle.set_enqueued_at(Instant::now());
        state.vehicles.push_back(vehicle);
        state.max_length = state.max_length.max(state.vehicles.len());
        Ok(())
    }

    /// Removes the head vehicle, if any.
    pub fn try_dequeue(&self) -> Option<Vehicle> {
        self.try_dequeue_if(|_| true)
    }

    /// Removes the head vehicle only when `accept` approves it. The head is
    /// never skipped, so FIFO order holds either way.
    pub fn try_dequeue_if<F>(&self, accept: F) -> Option<Vehicle>
    where
        F: FnOnce(&Vehicle) -> bool,
    {
        let mut state = self.state();
        if !accept(state.vehicles.front()?) {
            return None;
        }
        let mut vehicle = state.vehicles.pop_front()?;
        if let Some(enqueued_at) = vehicle.take_enqueued_at() {
            state.total_wait += enqueued_at.elapsed();
        }
        state.drained += 1;
        Some(vehicle)
    }

    /// Kind of the vehicle at the head, without removing it.
    pub fn peek_kind(&self) -> Option<VehicleKind> {
        self.state().vehicles.front().map(Vehicle::kind)
    }

    pub fn len(&self) -> usize {
        self.state().vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        let avg_wait = average_wait(state.total_wait, state.drained);
        QueueSnapshot {
            length: state.vehicles.len(),
            max: state.max_length,
            capacity: self.capacity,
            avg_wait,
            drained: state.drained,
            rejected: state.rejected,
        }
    }
}

fn average_wait(total: Duration, drained: u64) -> Duration {
    if drained == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(drained);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn vehicle(id: &str) -> Vehicle {
        Vehicle::new(id, VehicleKind::Medium, vec!["Cr1".to_string(), "S".to_string()])
    }

    #[test]
    fn rejects_beyond_capacity_and_keeps_fifo_order() {
        let queue = DirectionalQueue::new("Cr1", "E1", 2);
        assert!(queue.enqueue(vehicle("V1")).is_ok());
        assert!(queue.enqueue(vehicle("V2")).is_ok());

        let rejected = queue.enqueue(vehicle("V3")).unwrap_err();
        assert_eq!(rejected.vehicle.id(), "V3");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_dequeue().unwrap().id(), "V1");
        assert_eq!(queue.try_dequeue().unwrap().id(), "V2");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn snapshot_tracks_max_and_counts() {
        let queue = DirectionalQueue::new("Cr1", "E1", 3);
        for id in ["A", "B", "C"] {
            queue.enqueue(vehicle(id)).unwrap();
        }
        let _ = queue.enqueue(vehicle("D"));
        queue.try_dequeue();
        queue.try_dequeue();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.length, 1);
        assert_eq!(snapshot.max, 3);
        assert_eq!(snapshot.capacity, 3);
        assert_eq!(snapshot.drained, 2);
        assert_eq!(snapshot.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn average_wait_uses_enqueue_time() {
        let queue = DirectionalQueue::new("Cr1", "E1", 4);
        queue.enqueue(vehicle("A")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.enqueue(vehicle("B")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        queue.try_dequeue().unwrap();
        queue.try_dequeue().unwrap();

        // A waited 300ms, B waited 100ms
        assert_eq!(queue.snapshot().avg_wait, Duration::from_millis(200));
    }

    #[test]
    fn conditional_dequeue_never_skips_the_head() {
        let queue = DirectionalQueue::new("Cr1", "E1", 4);
        queue
            .enqueue(Vehicle::new("heavy", VehicleKind::Heavy, vec!["S".to_string()]))
            .unwrap();
        queue
            .enqueue(Vehicle::new("light", VehicleKind::Light, vec!["S".to_string()]))
            .unwrap();

        let light_only = |v: &Vehicle| v.kind() == VehicleKind::Light;
        assert!(queue.try_dequeue_if(light_only).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue().unwrap().id(), "heavy");
        assert_eq!(queue.try_dequeue_if(light_only).unwrap().id(), "light");
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(DirectionalQueue::new("Cr1", "E1", 16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut accepted = 0;
                    for i in 0..20 {
                        if queue.enqueue(vehicle(&format!("T{t}-{i}"))).is_ok() {
                            accepted += 1;
                        }
                        assert!(queue.len() <= queue.capacity());
                    }
                    accepted
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 16);
        assert_eq!(queue.snapshot().rejected, 64);
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let queue = DirectionalQueue::new("Cr1", "E1", 100);
        for i in 0..50 {
            queue.enqueue(vehicle(&format!("V{i:02}"))).unwrap();
        }
        let drained: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|v| v.id().to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| format!("V{i:02}")).collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn average_wait_survives_huge_drain_counts() {
        assert_eq!(average_wait(Duration::from_secs(5), 0), Duration::ZERO);
        assert_eq!(average_wait(Duration::from_secs(6), 3), Duration::from_secs(2));

        // 2^32 drains would truncate to a zero divisor as u32.
        let drained = 1u64 << 32;
        let avg = average_wait(Duration::from_secs(drained), drained);
        assert_eq!(avg, Duration::from_secs(1));
    }
}
