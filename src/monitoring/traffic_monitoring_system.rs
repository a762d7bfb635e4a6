//! Headless telemetry collector.
//!
//! Accepts connections from every node, decodes their STAT and LOG
//! envelopes and appends one CSV row per queue sample or event.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::communication::listener::{EnvelopeHandler, Flow};
use crate::communication::messages::{Envelope, Payload};
use crate::global_variables::{DELIVERY_STATS_CSV, EVENTS_CSV, QUEUE_STATS_CSV};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatRecord {
    pub timestamp: u64,
    pub node: String,
    pub direction: String,
    pub length: usize,
    pub max: usize,
    pub avg_wait_ms: u64,
    pub light_open: bool,
    pub capacity: usize,
    pub drained: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatRecord {
    pub timestamp: u64,
    pub node: String,
    pub delivered: u64,
    pub avg_dwell_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: u64,
    pub node: String,
    pub level: String,
    pub message: String,
}

/// Appends one record, writing the header only when the file is new.
fn log_to_csv<T: Serialize>(path: &Path, record: &T) -> Result<(), csv::Error> {
    let file_exists = path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    wtr.serialize(record)?;
    wtr.flush()?;
    Ok(())
}

/// Number of data rows in a CSV file written by the collector.
pub fn count_csv_records(path: &Path) -> Result<usize, csv::Error> {
    if !path.exists() {
        return Ok(0);
    }
    let mut rdr = csv::Reader::from_path(path)?;
    let mut count = 0;
    for record in rdr.records() {
        record?;
        count += 1;
    }
    Ok(count)
}

/// Writes telemetry envelopes into CSV files under one directory.
#[derive(Debug)]
pub struct TelemetryCollector {
    out_dir: PathBuf,
    // Rows from concurrent connections must not interleave in a file.
    write_lock: Mutex<()>,
}

impl TelemetryCollector {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn queue_stats_path(&self) -> PathBuf {
        self.out_dir.join(QUEUE_STATS_CSV)
    }

    pub fn delivery_stats_path(&self) -> PathBuf {
        self.out_dir.join(DELIVERY_STATS_CSV)
    }

    pub fn events_path(&self) -> PathBuf {
        self.out_dir.join(EVENTS_CSV)
    }

    /// Records one envelope and returns how many rows it produced. Vehicle
    /// envelopes are not telemetry and produce none.
    pub fn record(&self, envelope: &Envelope) -> Result<usize, csv::Error> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match &envelope.payload {
            Payload::Stat(stat) => {
                let path = self.queue_stats_path();
                for queue in &stat.queues {
                    let record = QueueStatRecord {
                        timestamp: envelope.timestamp,
                        node: envelope.from.clone(),
                        direction: queue.direction.clone(),
                        length: queue.length,
                        max: queue.max,
                        avg_wait_ms: queue.avg_wait_ms,
                        light_open: queue.light_open,
                        capacity: queue.capacity,
                        drained: queue.drained,
                        rejected: queue.rejected,
                    };
                    log_to_csv(&path, &record)?;
                }
                let mut rows = stat.queues.len();
                if let Some(delivered) = stat.delivered {
                    let record = DeliveryStatRecord {
                        timestamp: envelope.timestamp,
                        node: envelope.from.clone(),
                        delivered,
                        avg_dwell_ms: stat.avg_dwell_ms.unwrap_or(0),
                    };
                    log_to_csv(&self.delivery_stats_path(), &record)?;
                    rows += 1;
                }
                Ok(rows)
            }
            Payload::Log(log) => {
                let record = EventRecord {
                    timestamp: envelope.timestamp,
                    node: envelope.from.clone(),
                    level: log.level.to_string(),
                    message: log.message.clone(),
                };
                log_to_csv(&self.events_path(), &record)?;
                Ok(1)
            }
            Payload::Vehicle(_) => Ok(0),
        }
    }

    /// Row counts per output file, for a shutdown summary.
    pub fn summary(&self) -> Result<CollectorSummary, csv::Error> {
        Ok(CollectorSummary {
            queue_samples: count_csv_records(&self.queue_stats_path())?,
            delivery_samples: count_csv_records(&self.delivery_stats_path())?,
            events: count_csv_records(&self.events_path())?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub queue_samples: usize,
    pub delivery_samples: usize,
    pub events: usize,
}

impl EnvelopeHandler for TelemetryCollector {
    fn name(&self) -> &str {
        "collector"
    }

    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Flow {
        match self.record(&envelope) {
            Ok(0) => debug!("ignoring {} from {}", envelope.kind().as_str(), peer),
            Ok(rows) => debug!("{} rows from {}", rows, envelope.from),
            Err(e) => error!("cannot record telemetry from {}: {}", envelope.from, e),
        }
        Flow::Continue
    }
}

/// Creates the output directory and logs where rows will go.
pub fn prepare_out_dir(collector: &TelemetryCollector) -> std::io::Result<()> {
    std::fs::create_dir_all(collector.out_dir())?;
    info!("recording telemetry under {}", collector.out_dir().display());
    Ok(())
}
