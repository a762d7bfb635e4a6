// Envelope kinds on the wire
pub const KIND_VEHICLE: &str = "VEHICLE";
pub const KIND_STAT: &str = "STAT";
pub const KIND_LOG: &str = "LOG";

// Node id of the terminal sink when the topology does not name one
pub const DEFAULT_SINK_ID: &str = "S";

// Light timings (milliseconds)
pub const DEFAULT_GREEN_DURATION_MS: u64 = 5000;
pub const DEFAULT_ALL_RED_DURATION_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

// A medium vehicle takes this long to cross; light and heavy ones scale it
pub const DEFAULT_BASE_CROSSING_MS: u64 = 1000;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_STAT_INTERVAL_MS: u64 = 1000;

// Forwarder reconnect policy: one attempt plus this many retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

// Vehicles a forwarder holds while its peer is slow; further ones are dropped
pub const DEFAULT_FORWARD_BACKLOG: usize = 10;

// Telemetry events waiting for the collector; newer ones are dropped past this
pub const DEFAULT_TELEMETRY_BACKLOG: usize = 1024;

// Entry generators
pub const DEFAULT_SPAWN_INTERVAL_MS: u64 = 1500;

// Telemetry collector output files
pub const QUEUE_STATS_CSV: &str = "queue_stats.csv";
pub const EVENTS_CSV: &str = "events.csv";
pub const DELIVERY_STATS_CSV: &str = "delivery_stats.csv";
