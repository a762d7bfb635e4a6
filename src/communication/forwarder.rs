use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::communication::messages::{encode, Envelope};
use crate::communication::stop_requested;
use crate::error::DeliveryFailed;
use crate::global_variables::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS,
};
use crate::models::vehicle::Vehicle;
use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::LogLevel;

/// How hard a link tries before giving up on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause before every retry.
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// A reusable outbound connection to one peer address.
///
/// The stream is opened on first use and kept for later sends. A failed
/// write, or a peer that closed its end, drops the stream so that the next
/// attempt reconnects.
#[derive(Debug)]
pub struct PeerLink {
    addr: String,
    policy: RetryPolicy,
    stream: Option<TcpStream>,
}

impl PeerLink {
    pub fn new(addr: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            addr: addr.into(),
            policy,
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Writes one envelope, reconnecting as needed. Gives up after
    /// `1 + max_retries` attempts, sleeping `backoff` before each retry.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), DeliveryFailed> {
        let line = encode(envelope).map_err(|e| DeliveryFailed {
            peer: self.addr.clone(),
            attempts: 0,
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_write(line.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(source) => {
                    self.stream = None;
                    if attempts > self.policy.max_retries {
                        return Err(DeliveryFailed {
                            peer: self.addr.clone(),
                            attempts,
                            source,
                        });
                    }
                    debug!(
                        "attempt {} to {} failed ({}), retrying in {:?}",
                        attempts, self.addr, source, self.policy.backoff
                    );
                    sleep(self.policy.backoff).await;
                }
            }
        }
    }

    async fn try_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.stream.as_ref().is_some_and(peer_has_closed) {
            // The receiver hangs up when its queue is full.
            self.stream = None;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer closed the connection",
            ));
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = self.connect().await?;
                self.stream.insert(stream)
            }
        };
        stream.write_all(bytes).await
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = timeout(self.policy.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        debug!("connected to {}", self.addr);
        Ok(stream)
    }
}

/// Peers never write to us, so readable-with-EOF means they hung up.
fn peer_has_closed(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

/// A vehicle waiting to be written to a downstream peer.
#[derive(Debug)]
pub struct Outbound {
    /// Node the vehicle is heading to; advisory `to` on the wire.
    pub to: String,
    pub vehicle: Vehicle,
}

/// Sends vehicles from one node to one downstream address.
pub struct Forwarder {
    node_id: String,
    link: PeerLink,
}

impl Forwarder {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            node_id: node_id.into(),
            link: PeerLink::new(addr, policy),
        }
    }

    pub fn addr(&self) -> &str {
        self.link.addr()
    }

    /// Sends one vehicle. On error the vehicle is gone; the caller logs it.
    pub async fn send(&mut self, vehicle: Vehicle, to: &str) -> Result<(), DeliveryFailed> {
        let envelope = Envelope::vehicle(&self.node_id, to, vehicle);
        self.link.send_envelope(&envelope).await
    }

    /// Moves the forwarder onto its own task. Vehicles pushed into the
    /// returned sender are sent in order; a delivery failure drops the vehicle
    /// and is reported to `telemetry`. At most `backlog` vehicles wait behind
    /// the one being sent.
    pub fn spawn(
        self,
        backlog: usize,
        telemetry: Arc<dyn TelemetrySink>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Sender<Outbound>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let task = tokio::spawn(self.run(rx, telemetry, shutdown));
        (tx, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Outbound>,
        telemetry: Arc<dyn TelemetrySink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                next = rx.recv() => next,
            };
            let Some(Outbound { to, vehicle }) = next else {
                break;
            };
            let id = vehicle.id().to_string();
            tokio::select! {
                result = self.send(vehicle, &to) => match result {
                    Ok(()) => debug!("[{}] {} sent to {} at {}", self.node_id, id, to, self.addr()),
                    Err(e) => {
                        let message = format!("dropping {id} bound for {to}: {e}");
                        warn!("[{}] {}", self.node_id, message);
                        telemetry.publish_log(&self.node_id, LogLevel::Warn, message);
                    }
                },
                _ = stop_requested(&mut shutdown) => {
                    warn!("[{}] node stopping, {} to {} abandoned", self.node_id, id, to);
                    break;
                }
            }
        }
        let abandoned = std::iter::from_fn(|| rx.try_recv().ok()).count();
        if abandoned > 0 {
            warn!(
                "[{}] forwarder to {} stopped with {} vehicles unsent",
                self.node_id,
                self.addr(),
                abandoned
            );
        }
    }
}
