//! Line-delimited JSON envelopes exchanged between nodes.
//!
//! Every message on a connection is one JSON object followed by `\n`:
//! `{"kind":..,"from":..,"to":..,"timestamp":..,"payload":{..}}`. The `kind`
//! tag selects which payload shape to expect.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::global_variables::{KIND_LOG, KIND_STAT, KIND_VEHICLE};
use crate::models::vehicle::Vehicle;
use crate::shared_data::{current_timestamp, LogLevel, LogPayload, StatPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Vehicle,
    Stat,
    Log,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Vehicle => KIND_VEHICLE,
            MessageKind::Stat => KIND_STAT,
            MessageKind::Log => KIND_LOG,
        }
    }
}

/// A vehicle in transit plus the node that sent it. The receiver uses
/// `origin` to pick the incoming direction.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct VehiclePayload {
    #[serde(flatten)]
    pub vehicle: Vehicle,
    pub origin: String,
}

#[derive(Debug, PartialEq)]
pub enum Payload {
    Vehicle(VehiclePayload),
    Stat(StatPayload),
    Log(LogPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Vehicle(_) => MessageKind::Vehicle,
            Payload::Stat(_) => MessageKind::Stat,
            Payload::Log(_) => MessageKind::Log,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Envelope {
    pub from: String,
    /// Advisory only; delivery is decided by the TCP destination.
    pub to: Option<String>,
    pub timestamp: u64,
    pub payload: Payload,
}

/// The envelope as it appears on the wire, before the payload is typed.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    kind: MessageKind,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    timestamp: u64,
    payload: serde_json::Value,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: Option<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            to,
            timestamp: current_timestamp(),
            payload,
        }
    }

    pub fn vehicle(from: &str, to: &str, vehicle: Vehicle) -> Self {
        let payload = VehiclePayload {
            vehicle,
            origin: from.to_string(),
        };
        Self::new(from, Some(to.to_string()), Payload::Vehicle(payload))
    }

    pub fn stat(from: &str, stat: StatPayload) -> Self {
        Self::new(from, None, Payload::Stat(stat))
    }

    pub fn log(from: &str, level: LogLevel, message: impl Into<String>) -> Self {
        let payload = LogPayload {
            level,
            message: message.into(),
        };
        Self::new(from, None, Payload::Log(payload))
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Serializes an envelope as one newline-terminated line.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let payload = match &envelope.payload {
        Payload::Vehicle(p) => serde_json::to_value(p)?,
        Payload::Stat(p) => serde_json::to_value(p)?,
        Payload::Log(p) => serde_json::to_value(p)?,
    };
    let wire = WireEnvelope {
        kind: envelope.kind(),
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        timestamp: envelope.timestamp,
        payload,
    };
    let mut line = serde_json::to_string(&wire)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line (with or without its trailing newline).
pub fn decode(line: &str) -> Result<Envelope, ProtocolError> {
    let wire: WireEnvelope = serde_json::from_str(line.trim_end())?;
    let kind = wire.kind;
    let typed = |source| ProtocolError::Payload {
        kind: kind.as_str(),
        source,
    };
    let payload = match kind {
        MessageKind::Vehicle => Payload::Vehicle(serde_json::from_value(wire.payload).map_err(typed)?),
        MessageKind::Stat => Payload::Stat(serde_json::from_value(wire.payload).map_err(typed)?),
        MessageKind::Log => Payload::Log(serde_json::from_value(wire.payload).map_err(typed)?),
    };
    Ok(Envelope {
        from: wire.from,
        to: wire.to,
        timestamp: wire.timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vehicle::VehicleKind;
    use crate::shared_data::QueueStat;

    fn sample_vehicle() -> Vehicle {
        Vehicle::new(
            "E1-003",
            VehicleKind::Medium,
            ["Cr1", "Cr4", "Cr5", "S"].iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn vehicle_envelope_round_trips() {
        let envelope = Envelope::vehicle("E1", "Cr1", sample_vehicle());
        let line = encode(&envelope).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let decoded = decode(&line).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn stat_envelope_round_trips() {
        let stat = StatPayload {
            queues: vec![QueueStat {
                direction: "E3".to_string(),
                length: 4,
                max: 9,
                avg_wait_ms: 1200,
                light_open: false,
                capacity: 10,
                drained: 12,
                rejected: 1,
            }],
            ..StatPayload::default()
        };
        let envelope = Envelope::stat("Cr3", stat);
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.to.is_none());
    }

    #[test]
    fn vehicle_payload_is_flat_on_the_wire() {
        let envelope = Envelope::vehicle("E1", "Cr1", sample_vehicle());
        let json: serde_json::Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(json["kind"], "VEHICLE");
        assert_eq!(json["to"], "Cr1");
        assert_eq!(json["payload"]["origin"], "E1");
        assert_eq!(json["payload"]["vehicleKind"], "CARRO");
        assert_eq!(json["payload"]["route"][3], "S");
    }

    #[test]
    fn decodes_hand_written_vehicle_line() {
        let line = r#"{"kind":"VEHICLE","from":"E1","to":"Cr1","timestamp":1700000000000,"payload":{"id":"E1-003","vehicleKind":"CARRO","route":["Cr1","Cr4","Cr5","S"],"routeCursor":0,"createdAt":1700000000000,"origin":"E1"}}"#;
        match decode(line).unwrap().payload {
            Payload::Vehicle(p) => {
                assert_eq!(p.origin, "E1");
                assert_eq!(p.vehicle.id(), "E1-003");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_errors_not_panics() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"kind":"TELEPORT","from":"x","payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"kind":"VEHICLE","from":"x","payload":{"id":"v"}}"#),
            Err(ProtocolError::Payload { kind: "VEHICLE", .. })
        ));
    }

    #[test]
    fn log_envelope_carries_level() {
        let envelope = Envelope::log("Cr2", LogLevel::Warn, "peer Cr5 unreachable");
        let line = encode(&envelope).unwrap();
        assert!(line.contains(r#""kind":"LOG""#));
        assert_eq!(decode(&line).unwrap(), envelope);
    }
}
