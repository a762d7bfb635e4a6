//! Topology file loading and per-node resolution.
//!
//! A topology is one JSON document describing every node of the network.
//! Each process loads the same file and resolves its own role from it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::communication::forwarder::RetryPolicy;
use crate::control_system::traffic_light_controller::LightTimings;
use crate::error::ConfigError;
use crate::global_variables::*;
use crate::models::vehicle::VehicleKind;

fn default_sink_id() -> String {
    DEFAULT_SINK_ID.to_string()
}
fn default_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_green_ms() -> u64 {
    DEFAULT_GREEN_DURATION_MS
}
fn default_all_red_ms() -> u64 {
    DEFAULT_ALL_RED_DURATION_MS
}
fn default_poll_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_base_crossing_ms() -> u64 {
    DEFAULT_BASE_CROSSING_MS
}
fn default_stat_interval_ms() -> u64 {
    DEFAULT_STAT_INTERVAL_MS
}
fn default_spawn_interval_ms() -> u64 {
    DEFAULT_SPAWN_INTERVAL_MS
}
fn default_forward_backlog() -> usize {
    DEFAULT_FORWARD_BACKLOG
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Collector address for STAT/LOG envelopes; log-only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_addr: Option<String>,
    #[serde(default)]
    pub retry: RetrySpec,
    pub sink: SinkSpec,
    pub intersections: Vec<IntersectionSpec>,
    #[serde(default)]
    pub entries: Vec<EntrySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl RetrySpec {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkSpec {
    #[serde(default = "default_sink_id")]
    pub id: String,
    pub listen_addr: String,
    #[serde(default = "default_stat_interval_ms")]
    pub stat_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    /// Id of the upstream node whose vehicles wait in this queue.
    pub direction: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectionSpec {
    pub id: String,
    pub listen_addr: String,
    pub queues: Vec<QueueSpec>,
    /// Ids of the nodes this intersection can send vehicles to.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default = "default_green_ms")]
    pub green_duration_ms: u64,
    #[serde(default = "default_all_red_ms")]
    pub all_red_duration_ms: u64,
    #[serde(default = "default_base_crossing_ms")]
    pub base_crossing_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stat_interval_ms")]
    pub stat_interval_ms: u64,
    /// Crossed vehicles each forwarder may hold before it drops new ones.
    #[serde(default = "default_forward_backlog")]
    pub forward_backlog: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySpec {
    pub id: String,
    pub routes: Vec<Vec<String>>,
    #[serde(default = "default_spawn_interval_ms")]
    pub interval_ms: u64,
    /// Stop after this many vehicles; run until stopped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Everything one intersection needs, with node ids resolved to addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_addr: String,
    pub queues: Vec<QueueSpec>,
    /// Next node id to the address of its listener.
    pub downstream: BTreeMap<String, String>,
    pub sink_id: String,
    pub timings: LightTimings,
    pub stat_interval: Duration,
    pub retry: RetryPolicy,
    pub forward_backlog: usize,
}

impl NodeConfig {
    /// Checks the node on its own; cross-node references are the topology's
    /// business.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let node = &self.node_id;
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues { node: node.clone() });
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if !seen.insert(queue.direction.as_str()) {
                return Err(ConfigError::DuplicateDirection {
                    node: node.clone(),
                    direction: queue.direction.clone(),
                });
            }
            if queue.capacity == 0 {
                return Err(ConfigError::ZeroCapacity {
                    node: node.clone(),
                    direction: queue.direction.clone(),
                });
            }
        }

        if self.forward_backlog == 0 {
            return Err(ConfigError::ZeroBacklog { node: node.clone() });
        }

        let timings = &self.timings;
        let invalid = |reason: &str| ConfigError::InvalidTiming {
            node: node.clone(),
            reason: reason.to_string(),
        };
        if timings.green.is_zero() {
            return Err(invalid("green duration must be positive"));
        }
        if timings.all_red.is_zero() {
            return Err(invalid("all-red duration must be positive"));
        }
        if timings.poll_interval.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }
        if timings.base_crossing.is_zero() {
            return Err(invalid("base crossing time must be positive"));
        }
        if timings.base_crossing.mul_f64(VehicleKind::max_crossing_factor()) > timings.green {
            return Err(invalid("slowest vehicle does not fit in one green phase"));
        }
        if self.stat_interval.is_zero() {
            return Err(invalid("stat interval must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub node_id: String,
    pub listen_addr: String,
    pub stat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryConfig {
    pub entry_id: String,
    pub routes: Vec<Vec<String>>,
    pub interval: Duration,
    pub count: Option<u64>,
    /// First hop of each route to its address.
    pub downstream: BTreeMap<String, String>,
    pub retry: RetryPolicy,
}

impl Topology {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses and validates a topology document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let topology: Topology = serde_json::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn intersection(&self, id: &str) -> Option<&IntersectionSpec> {
        self.intersections.iter().find(|i| i.id == id)
    }

    pub fn entry(&self, id: &str) -> Option<&EntrySpec> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Listening address of an intersection or the sink.
    pub fn address_of(&self, id: &str) -> Option<&str> {
        if self.sink.id == id {
            return Some(&self.sink.listen_addr);
        }
        self.intersection(id).map(|i| i.listen_addr.as_str())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let all_ids = std::iter::once(self.sink.id.as_str())
            .chain(self.intersections.iter().map(|i| i.id.as_str()))
            .chain(self.entries.iter().map(|e| e.id.as_str()));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(ConfigError::DuplicateNode(id.to_string()));
            }
        }

        for intersection in &self.intersections {
            self.resolve_node(intersection)?.validate()?;
            for queue in &intersection.queues {
                if !ids.contains(queue.direction.as_str()) {
                    return Err(ConfigError::UnknownPeer {
                        node: intersection.id.clone(),
                        peer: queue.direction.clone(),
                    });
                }
            }
        }

        let links: HashMap<&str, &[String]> = self
            .intersections
            .iter()
            .map(|i| (i.id.as_str(), i.links.as_slice()))
            .collect();
        for entry in &self.entries {
            self.validate_routes(entry, &links)?;
        }
        Ok(())
    }

    fn validate_routes(&self, entry: &EntrySpec, links: &HashMap<&str, &[String]>) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRoute {
            entry: entry.id.clone(),
            reason,
        };
        if entry.routes.is_empty() {
            return Err(invalid("no routes".to_string()));
        }
        if entry.interval_ms == 0 {
            return Err(invalid("spawn interval must be positive".to_string()));
        }
        for route in &entry.routes {
            let (last, hops) = match route.split_last() {
                Some(split) => split,
                None => return Err(invalid("empty route".to_string())),
            };
            if *last != self.sink.id {
                return Err(invalid(format!("{route:?} does not end at {}", self.sink.id)));
            }
            if hops.is_empty() {
                return Err(invalid(format!("{route:?} skips every intersection")));
            }

            let mut previous = entry.id.as_str();
            for hop in route {
                if hop != &self.sink.id {
                    let intersection = self
                        .intersection(hop)
                        .ok_or_else(|| invalid(format!("unknown intersection {hop}")))?;
                    if !intersection.queues.iter().any(|q| q.direction == previous) {
                        return Err(invalid(format!("{hop} has no queue for arrivals from {previous}")));
                    }
                }
                if previous != entry.id {
                    let reachable = links.get(previous).copied().unwrap_or_default();
                    if !reachable.contains(hop) {
                        return Err(invalid(format!("{previous} has no link to {hop}")));
                    }
                }
                previous = hop;
            }
        }
        Ok(())
    }

    fn resolve_node(&self, spec: &IntersectionSpec) -> Result<NodeConfig, ConfigError> {
        let mut downstream = BTreeMap::new();
        for link in &spec.links {
            let addr = self.address_of(link).ok_or_else(|| ConfigError::UnknownPeer {
                node: spec.id.clone(),
                peer: link.clone(),
            })?;
            downstream.insert(link.clone(), addr.to_string());
        }
        Ok(NodeConfig {
            node_id: spec.id.clone(),
            listen_addr: spec.listen_addr.clone(),
            queues: spec.queues.clone(),
            downstream,
            sink_id: self.sink.id.clone(),
            timings: LightTimings::from_millis(
                spec.green_duration_ms,
                spec.all_red_duration_ms,
                spec.poll_interval_ms,
                spec.base_crossing_ms,
            ),
            stat_interval: Duration::from_millis(spec.stat_interval_ms),
            retry: self.retry.policy(),
            forward_backlog: spec.forward_backlog,
        })
    }

    pub fn node_config(&self, id: &str) -> Result<NodeConfig, ConfigError> {
        let spec = self
            .intersection(id)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))?;
        self.resolve_node(spec)
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            node_id: self.sink.id.clone(),
            listen_addr: self.sink.listen_addr.clone(),
            stat_interval: Duration::from_millis(self.sink.stat_interval_ms),
        }
    }

    pub fn entry_config(&self, id: &str) -> Result<EntryConfig, ConfigError> {
        let spec = self
            .entry(id)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))?;
        let mut downstream = BTreeMap::new();
        for first in spec.routes.iter().filter_map(|r| r.first()) {
            let addr = self.address_of(first).ok_or_else(|| ConfigError::UnknownPeer {
                node: spec.id.clone(),
                peer: first.clone(),
            })?;
            downstream.insert(first.clone(), addr.to_string());
        }
        Ok(EntryConfig {
            entry_id: spec.id.clone(),
            routes: spec.routes.clone(),
            interval: Duration::from_millis(spec.interval_ms),
            count: spec.count,
            downstream,
            retry: self.retry.policy(),
        })
    }
}
