use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::shared_data::current_timestamp;

/// Vehicle classes. The wire names are the ones the dashboard already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleKind {
    #[serde(rename = "MOTA", alias = "LIGHT")]
    Light,
    #[serde(rename = "CARRO", alias = "MEDIUM")]
    Medium,
    #[serde(rename = "CAMIAO", alias = "HEAVY")]
    Heavy,
}

impl VehicleKind {
    pub const ALL: [VehicleKind; 3] = [VehicleKind::Light, VehicleKind::Medium, VehicleKind::Heavy];

    /// Multiplier applied to the base crossing time.
    pub fn crossing_factor(self) -> f64 {
        match self {
            VehicleKind::Light => 0.5,
            VehicleKind::Medium => 1.0,
            VehicleKind::Heavy => 2.0,
        }
    }

    pub fn crossing_time(self, base: Duration) -> Duration {
        base.mul_f64(self.crossing_factor())
    }

    /// Largest factor of any kind; used to check that a crossing fits in a green phase.
    pub fn max_crossing_factor() -> f64 {
        Self::ALL
            .iter()
            .map(|kind| kind.crossing_factor())
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleKind::Light => write!(f, "Light"),
            VehicleKind::Medium => write!(f, "Medium"),
            VehicleKind::Heavy => write!(f, "Heavy"),
        }
    }
}

/// A vehicle travelling through the network.
///
/// Identity, kind and route never change once created. The only thing a hop
/// changes is `route_cursor`, which points at the node currently responsible
/// for the vehicle. `route_cursor == route.len()` means the terminal sink has
/// taken it. Vehicles are moved between owners, never cloned.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "VehicleRecord")]
pub struct Vehicle {
    id: String,
    #[serde(rename = "vehicleKind")]
    kind: VehicleKind,
    route: Vec<String>,
    route_cursor: usize,
    created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exited_at: Option<u64>,
    #[serde(skip)]
    enqueued_at: Option<Instant>,
}

/// Unvalidated wire form of a vehicle.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VehicleRecord {
    id: String,
    vehicle_kind: VehicleKind,
    route: Vec<String>,
    #[serde(default)]
    route_cursor: usize,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    exited_at: Option<u64>,
}

impl TryFrom<VehicleRecord> for Vehicle {
    type Error = String;

    fn try_from(record: VehicleRecord) -> Result<Self, Self::Error> {
        if record.id.is_empty() {
            return Err("vehicle id is empty".to_string());
        }
        if record.route_cursor > record.route.len() {
            return Err(format!(
                "route cursor {} is past the end of a {}-stop route",
                record.route_cursor,
                record.route.len()
            ));
        }
        Ok(Self {
            id: record.id,
            kind: record.vehicle_kind,
            route: record.route,
            route_cursor: record.route_cursor,
            created_at: record.created_at,
            exited_at: record.exited_at,
            enqueued_at: None,
        })
    }
}

impl Vehicle {
    /// Creates a vehicle at the start of its route, stamped with the current time.
    pub fn new(id: impl Into<String>, kind: VehicleKind, route: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            route,
            route_cursor: 0,
            created_at: current_timestamp(),
            exited_at: None,
            enqueued_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> VehicleKind {
        self.kind
    }

    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn route_cursor(&self) -> usize {
        self.route_cursor
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn exited_at(&self) -> Option<u64> {
        self.exited_at
    }

    /// The node the cursor points at, or `None` once the route is complete.
    pub fn current_stop(&self) -> Option<&str> {
        self.route.get(self.route_cursor).map(String::as_str)
    }

    pub fn is_delivered(&self) -> bool {
        self.route_cursor == self.route.len()
    }

    /// Moves the cursor one stop forward. Returns `false` when the route is
    /// already complete; the cursor never passes `route.len()`.
    pub fn advance(&mut self) -> bool {
        if self.route_cursor < self.route.len() {
            self.route_cursor += 1;
            true
        } else {
            false
        }
    }

    /// Records the exit time. Only the first call has any effect.
    pub fn mark_exited(&mut self, at_ms: u64) -> bool {
        if self.exited_at.is_some() {
            return false;
        }
        self.exited_at = Some(at_ms);
        true
    }

    /// Time spent in the network, once the vehicle has exited.
    pub fn dwell_ms(&self) -> Option<u64> {
        self.exited_at
            .map(|exited| exited.saturating_sub(self.created_at))
    }

    pub(crate) fn set_enqueued_at(&mut self, at: Instant) {
        self.enqueued_at = Some(at);
    }

    pub(crate) fn take_enqueued_at(&mut self) -> Option<Instant> {
        self.enqueued_at.take()
    }
}
