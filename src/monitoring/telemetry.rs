use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::communication::forwarder::{PeerLink, RetryPolicy};
use crate::communication::messages::{Envelope, Payload};
use crate::global_variables::DEFAULT_TELEMETRY_BACKLOG;
use crate::shared_data::{LogLevel, LogPayload, StatPayload};

/// Where nodes report STAT snapshots and LOG events.
///
/// Publishing never blocks and never fails from the caller's point of view;
/// telemetry is best effort.
pub trait TelemetrySink: Send + Sync {
    fn publish_stat(&self, from: &str, stat: StatPayload);

    fn publish_log(&self, from: &str, level: LogLevel, message: String);
}

/// Writes telemetry to the local log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn publish_stat(&self, from: &str, stat: StatPayload) {
        let queues: Vec<String> = stat
            .queues
            .iter()
            .map(|q| {
                let light = if q.light_open { "G" } else { "R" };
                format!("{}={}/{}[{}]", q.direction, q.length, q.capacity, light)
            })
            .collect();
        match stat.delivered {
            Some(delivered) => info!(
                "[{}] delivered={} avgDwellMs={}",
                from,
                delivered,
                stat.avg_dwell_ms.unwrap_or(0)
            ),
            None => info!("[{}] {}", from, queues.join(" ")),
        }
    }

    fn publish_log(&self, from: &str, level: LogLevel, message: String) {
        debug!("[{}] {} {}", from, level, message);
    }
}

/// Streams telemetry as envelopes to a remote collector.
///
/// A background task owns the connection. If the collector is down, events
/// are dropped after one attempt; nodes keep running regardless. Events
/// published while the backlog is full are dropped and counted. The task
/// ends once every clone of the sink is gone.
#[derive(Debug, Clone)]
pub struct TcpTelemetrySink {
    tx: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

impl TcpTelemetrySink {
    /// Must be called inside a tokio runtime.
    pub fn spawn(addr: impl Into<String>) -> (Self, JoinHandle<()>) {
        Self::spawn_with_backlog(addr, DEFAULT_TELEMETRY_BACKLOG)
    }

    pub fn spawn_with_backlog(addr: impl Into<String>, backlog: usize) -> (Self, JoinHandle<()>) {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let link = PeerLink::new(addr, policy);
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let task = tokio::spawn(Self::run(link, rx));
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, task)
    }

    /// Events discarded because the backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run(mut link: PeerLink, mut rx: mpsc::Receiver<Envelope>) {
        let mut reachable = true;
        while let Some(envelope) = rx.recv().await {
            match link.send_envelope(&envelope).await {
                Ok(()) => {
                    if !reachable {
                        info!("telemetry collector at {} is reachable again", link.addr());
                        reachable = true;
                    }
                }
                Err(e) => {
                    // Warn once per outage rather than once per event.
                    if reachable {
                        warn!("telemetry unavailable: {}", e);
                        reachable = false;
                    }
                }
            }
        }
    }

    fn push(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("telemetry backlog full, {} events dropped so far", dropped);
                }
            }
            Err(TrySendError::Closed(_)) => debug!("telemetry task has stopped, event discarded"),
        }
    }
}

impl TelemetrySink for TcpTelemetrySink {
    fn publish_stat(&self, from: &str, stat: StatPayload) {
        self.push(Envelope::stat(from, stat));
    }

    fn publish_log(&self, from: &str, level: LogLevel, message: String) {
        self.push(Envelope::log(from, level, message));
    }
}

/// Keeps every published event in memory. Handy when embedding nodes in
/// another program or asserting on their reports.
#[derive(Debug, Default)]
pub struct MemoryTelemetrySink {
    events: Mutex<Vec<Envelope>>,
}

impl MemoryTelemetrySink {
    pub fn events(&self) -> std::sync::MutexGuard<'_, Vec<Envelope>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn logs(&self) -> Vec<LogPayload> {
        self.events()
            .iter()
            .filter_map(|e| match &e.payload {
                Payload::Log(log) => Some(log.clone()),
                _ => None,
            })
            .collect()
    }

    /// STAT payloads published by `node`, oldest first.
    pub fn stats_from(&self, node: &str) -> Vec<StatPayload> {
        self.events()
            .iter()
            .filter(|e| e.from == node)
            .filter_map(|e| match &e.payload {
                Payload::Stat(stat) => Some(stat.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn publish_stat(&self, from: &str, stat: StatPayload) {
        self.events().push(Envelope::stat(from, stat));
    }

    fn publish_log(&self, from: &str, level: LogLevel, message: String) {
        self.events().push(Envelope::log(from, level, message));
    }
}

/// Remote sink when a collector address is configured, local log otherwise.
pub fn telemetry_for(addr: Option<&str>) -> Arc<dyn TelemetrySink> {
    match addr {
        Some(addr) => {
            let (sink, _task) = TcpTelemetrySink::spawn(addr);
            Arc::new(sink)
        }
        None => Arc::new(LogTelemetrySink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::messages::decode;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn memory_sink_separates_stats_and_logs() {
        let sink = MemoryTelemetrySink::default();
        sink.publish_stat("Cr1", StatPayload::default());
        sink.publish_log("Cr1", LogLevel::Warn, "queue E1 full".to_string());
        sink.publish_stat("Cr2", StatPayload::default());

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.stats_from("Cr1").len(), 1);
        let logs = sink.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "queue E1 full");
    }

    #[tokio::test]
    async fn tcp_sink_streams_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (sink, _task) = TcpTelemetrySink::spawn(addr);

        sink.publish_log("Cr3", LogLevel::Info, "started".to_string());
        sink.publish_stat(
            "Cr3",
            StatPayload {
                delivered: Some(2),
                ..StatPayload::default()
            },
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let first = decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second = decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first.payload, Payload::Log(_)));
        assert_eq!(second.from, "Cr3");
        assert!(matches!(second.payload, Payload::Stat(ref s) if s.delivered == Some(2)));
    }

    #[tokio::test]
    async fn tcp_sink_drops_events_past_its_backlog() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (sink, _task) = TcpTelemetrySink::spawn_with_backlog(addr, 2);

        // No await in between, so the sending task cannot drain anything yet.
        for i in 0..10 {
            sink.publish_log("Cr1", LogLevel::Info, format!("event {i}"));
        }
        assert_eq!(sink.dropped(), 8);

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        for expected in ["event 0", "event 1"] {
            let envelope = decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert!(matches!(envelope.payload, Payload::Log(ref l) if l.message == expected));
        }
    }

    #[tokio::test]
    async fn tcp_sink_survives_missing_collector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (sink, task) = TcpTelemetrySink::spawn(addr);
        sink.publish_log("Cr1", LogLevel::Info, "nobody listening".to_string());
        drop(sink);
        task.await.unwrap();
    }
}
