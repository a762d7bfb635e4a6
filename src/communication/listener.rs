use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::communication::messages::{decode, Envelope, Payload};
use crate::communication::stop_requested;
use crate::error::NodeError;
use crate::models::vehicle::Vehicle;

// Bytes read off a closing connection to report what it still carried.
const MAX_DISCARD_SCAN: usize = 64 * 1024;

/// What became of a vehicle handed to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Queued, or for the sink, recorded as exited.
    Accepted,
    /// The target queue was full. The sender's connection gets closed.
    Rejected,
    /// Not routable here; logged and discarded.
    Dropped,
}

/// Whether the listener keeps reading from a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Receives every decoded envelope from a node's inbound connections.
pub trait EnvelopeHandler: Send + Sync {
    /// Label used in log lines.
    fn name(&self) -> &str;

    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Flow;

    /// Called for envelopes already received on a connection that is being
    /// closed, which are never handled.
    fn discarded(&self, envelope: Envelope, peer: SocketAddr) {
        warn!(
            "[{}] discarding {} from {} on closed connection",
            self.name(),
            envelope.payload.kind().as_str(),
            peer
        );
    }
}

/// Node-side routing of vehicles that arrive over the network.
pub trait ArrivalHandler: Send + Sync {
    fn node_id(&self) -> &str;

    /// `origin` is the id of the sending node, i.e. the arrival direction.
    fn route_incoming(&self, vehicle: Vehicle, origin: &str) -> Arrival;

    /// A vehicle that arrived behind a rejected one and will not be routed.
    fn discard(&self, vehicle: Vehicle, origin: &str) {
        warn!(
            "[{}] dropping {} from {}: connection closed",
            self.node_id(),
            vehicle.id(),
            origin
        );
    }
}

/// Feeds VEHICLE envelopes to an [`ArrivalHandler`] and ignores the rest.
pub struct VehicleIntake<H: ?Sized>(pub Arc<H>);

impl<H: ArrivalHandler + ?Sized> EnvelopeHandler for VehicleIntake<H> {
    fn name(&self) -> &str {
        self.0.node_id()
    }

    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Flow {
        match envelope.payload {
            Payload::Vehicle(p) => match self.0.route_incoming(p.vehicle, &p.origin) {
                Arrival::Rejected => Flow::Close,
                Arrival::Accepted | Arrival::Dropped => Flow::Continue,
            },
            other => {
                debug!(
                    "[{}] ignoring {} from {}",
                    self.name(),
                    other.kind().as_str(),
                    peer
                );
                Flow::Continue
            }
        }
    }

    fn discarded(&self, envelope: Envelope, _peer: SocketAddr) {
        if let Payload::Vehicle(p) = envelope.payload {
            self.0.discard(p.vehicle, &p.origin);
        }
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener, NodeError> {
    TcpListener::bind(addr).await.map_err(|source| NodeError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Accepts connections until the stop flag is raised, serving each on its
/// own task. The listening socket closes when this returns.
pub async fn run_listener(
    listener: TcpListener,
    handler: Arc<dyn EnvelopeHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("[{}] accepted connection from {}", handler.name(), peer);
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("[{}] accept failed: {}", handler.name(), e),
            }
        }
    }
    info!("[{}] listener stopped", handler.name());
}

/// Reads newline-delimited envelopes from one peer. Bad lines are logged and
/// skipped; the connection ends on EOF, read error, stop, or `Flow::Close`.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn EnvelopeHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("[{}] {} disconnected", handler.name(), peer);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[{}] read from {} failed: {}", handler.name(), peer, e);
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => line,
            Err(e) => {
                warn!("[{}] dropping non-UTF-8 line from {}: {}", handler.name(), peer, e);
                continue;
            }
        };
        let envelope = match decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[{}] dropping malformed line from {}: {}", handler.name(), peer, e);
                continue;
            }
        };
        if handler.handle(envelope, peer) == Flow::Close {
            info!("[{}] closing connection from {}", handler.name(), peer);
            discard_pending(reader, peer, handler.as_ref());
            break;
        }
    }
}

/// Reports every complete envelope the peer has already sent on a connection
/// that is about to close: the buffered ones and those waiting in the socket.
fn discard_pending(reader: BufReader<TcpStream>, peer: SocketAddr, handler: &dyn EnvelopeHandler) {
    let mut pending = reader.buffer().to_vec();
    let stream = reader.into_inner();
    let mut chunk = [0u8; 4096];
    while pending.len() < MAX_DISCARD_SCAN {
        match stream.try_read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }

    let mut lines = pending.split(|b| *b == b'\n').peekable();
    while let Some(line) = lines.next() {
        if lines.peek().is_none() {
            if !line.is_empty() {
                warn!(
                    "[{}] discarding {} bytes of a partial line from {}",
                    handler.name(),
                    line.len(),
                    peer
                );
            }
            break;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        match decode(text) {
            Ok(envelope) => handler.discarded(envelope, peer),
            Err(e) => debug!("[{}] unreadable line from {}: {}", handler.name(), peer, e),
        }
    }
}
