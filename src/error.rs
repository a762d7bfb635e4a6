//! Error types shared across the node, transport and configuration layers.

use std::io;
use thiserror::Error;

use crate::models::vehicle::Vehicle;

/// Returned by `DirectionalQueue::enqueue` when the queue is at capacity.
/// The rejected vehicle travels back to the caller inside the error.
#[derive(Error, Debug)]
#[error("queue {direction} at capacity ({capacity} vehicles), rejected {}", .vehicle.id())]
pub struct CapacityExceeded {
    pub direction: String,
    pub capacity: usize,
    pub vehicle: Vehicle,
}

impl CapacityExceeded {
    pub fn into_vehicle(self) -> Vehicle {
        self.vehicle
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A forwarder gave up on a peer after exhausting its retry budget.
#[derive(Error, Debug)]
#[error("Delivery to {peer} failed after {attempts} attempts: {source}")]
pub struct DeliveryFailed {
    pub peer: String,
    pub attempts: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("A traffic light controller needs at least one queue")]
    NoQueues,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read topology file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid topology file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node id {0} is declared more than once")]
    DuplicateNode(String),

    #[error("Intersection {node} has no queues")]
    NoQueues { node: String },

    #[error("Intersection {node} declares direction {direction} twice")]
    DuplicateDirection { node: String, direction: String },

    #[error("Queue {direction} at {node} has zero capacity")]
    ZeroCapacity { node: String, direction: String },

    #[error("Intersection {node} has a zero forward backlog")]
    ZeroBacklog { node: String },

    #[error("Invalid timing for {node}: {reason}")]
    InvalidTiming { node: String, reason: String },

    #[error("{node} links to unknown node {peer}")]
    UnknownPeer { node: String, peer: String },

    #[error("Invalid route for entry {entry}: {reason}")]
    InvalidRoute { entry: String, reason: String },
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Node is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
