//! Supervisor ⇄ worker control channel.
//!
//! Every message is one flat JSON envelope on its own line:
//!
//! ```json
//! {"msg_type":"heartbeat","exchange":"binance","timestamp":1718000000.25,"data":{},"seq":17}
//! ```
//!
//! | kind              | direction          | `data`                          |
//! |-------------------|--------------------|---------------------------------|
//! | `heartbeat`       | worker → supervisor| `{}` or uptime info             |
//! | `health`          | worker → supervisor| per-market symbol sync states   |
//! | `metrics`         | worker → supervisor| metrics registry snapshot       |
//! | `log`             | worker → supervisor| `{"level": .., "message": ..}`  |
//! | `control_stop`    | supervisor → worker| `{"params": {..}}`              |
//! | `control_restart` | supervisor → worker| `{"params": {..}}`              |
//! | `control_reload`  | supervisor → worker| `{"params": {..}}`              |
//! | `ack`             | either             | `{"ack_type": .., "ack_seq": ..}` |
//!
//! Receivers must call [`ControlMessage::validate`] before acting on a
//! message and must ignore unknown fields, so payloads can grow without a
//! protocol bump.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BookfeedError;
use crate::time_util;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Known message kinds. The wire carries the kind as a free-form string so an
/// unknown kind still parses and can be logged before being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Metrics,
    Health,
    Heartbeat,
    Log,
    ControlStop,
    ControlRestart,
    ControlReload,
    Ack,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Health => "health",
            Self::Heartbeat => "heartbeat",
            Self::Log => "log",
            Self::ControlStop => "control_stop",
            Self::ControlRestart => "control_restart",
            Self::ControlReload => "control_reload",
            Self::Ack => "ack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "metrics" => Self::Metrics,
            "health" => Self::Health,
            "heartbeat" => Self::Heartbeat,
            "log" => Self::Log,
            "control_stop" => Self::ControlStop,
            "control_restart" => Self::ControlRestart,
            "control_reload" => Self::ControlReload,
            "ack" => Self::Ack,
            _ => return None,
        })
    }

    /// `control_*` kinds flow supervisor → worker and carry `data.params`.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::ControlStop | Self::ControlRestart | Self::ControlReload)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity carried by `log` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// A control channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Message kind (`heartbeat`, `control_stop`, ...).
    #[serde(rename = "msg_type", default)]
    pub kind: String,
    /// Owner id: the exchange id of the worker this message concerns.
    #[serde(rename = "exchange", default)]
    pub owner_id: String,
    /// Seconds since Unix epoch.
    #[serde(default)]
    pub timestamp: f64,
    /// Payload object; missing payloads deserialize as `null` and fail validation.
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(default)]
    pub seq: Option<u64>,
}

impl ControlMessage {
    /// Build a message stamped with the current time.
    pub fn new(kind: MessageKind, owner_id: &str, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            owner_id: owner_id.to_string(),
            timestamp: time_util::now_secs_f64(),
            payload,
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Parsed kind, or `None` for kinds this build does not know.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// A message is valid iff `kind` and `owner_id` are non-empty,
    /// `timestamp > 0` and the payload is an object (possibly empty).
    pub fn validate(&self) -> Result<(), BookfeedError> {
        if self.kind.is_empty() {
            return Err(BookfeedError::Protocol("empty msg_type".into()));
        }
        if self.owner_id.is_empty() {
            return Err(BookfeedError::Protocol("empty exchange".into()));
        }
        if !(self.timestamp > 0.0) {
            return Err(BookfeedError::Protocol(format!("bad timestamp {}", self.timestamp)));
        }
        if !self.payload.is_object() {
            return Err(BookfeedError::Protocol("data must be an object".into()));
        }
        Ok(())
    }

    /// `data.params` of a control message (empty object if absent).
    pub fn params(&self) -> Value {
        self.payload.get("params").cloned().unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Serialize to a single line (no trailing newline).
    pub fn encode(&self) -> Result<String, BookfeedError> {
        serde_json::to_string(self).map_err(|e| BookfeedError::Protocol(e.to_string()))
    }

    /// Parse and validate one line.
    pub fn decode(line: &str) -> Result<Self, BookfeedError> {
        let msg: Self =
            serde_json::from_str(line).map_err(|e| BookfeedError::Protocol(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

pub fn create_heartbeat_message(owner_id: &str, uptime_secs: f64) -> ControlMessage {
    ControlMessage::new(MessageKind::Heartbeat, owner_id, json!({ "uptime_secs": uptime_secs }))
}

pub fn create_health_message(owner_id: &str, health: Value) -> ControlMessage {
    ControlMessage::new(MessageKind::Health, owner_id, object_or_wrap(health, "health"))
}

pub fn create_metrics_message(owner_id: &str, metrics: Value) -> ControlMessage {
    ControlMessage::new(MessageKind::Metrics, owner_id, object_or_wrap(metrics, "metrics"))
}

pub fn create_log_message(owner_id: &str, level: LogLevel, message: &str) -> ControlMessage {
    ControlMessage::new(MessageKind::Log, owner_id, json!({ "level": level, "message": message }))
}

/// Build a `control_*` message. Non-control kinds are rejected.
pub fn create_control_message(
    kind: MessageKind,
    owner_id: &str,
    params: Value,
) -> Result<ControlMessage, BookfeedError> {
    if !kind.is_control() {
        return Err(BookfeedError::Protocol(format!("{kind} is not a control kind")));
    }
    Ok(ControlMessage::new(kind, owner_id, json!({ "params": object_or_wrap(params, "value") })))
}

pub fn create_ack_message(owner_id: &str, acked: &ControlMessage) -> ControlMessage {
    ControlMessage::new(
        MessageKind::Ack,
        owner_id,
        json!({ "ack_type": acked.kind, "ack_seq": acked.seq }),
    )
}

fn object_or_wrap(v: Value, key: &str) -> Value {
    match v {
        Value::Object(_) => v,
        Value::Null => Value::Object(Map::new()),
        other => json!({ key: other }),
    }
}

// ---------------------------------------------------------------------------
// ControlChannel: one endpoint of a line-oriented bidirectional channel
// ---------------------------------------------------------------------------

/// One endpoint of a control channel. Each item is one encoded envelope.
///
/// The channel moves raw lines; parsing and validation happen at the
/// receiving side so malformed input can be logged and dropped there.
pub struct ControlChannel {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    next_seq: u64,
}

impl ControlChannel {
    /// Create two connected in-memory endpoints.
    pub fn pair() -> (ControlChannel, ControlChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            ControlChannel { tx: a_tx, rx: a_rx, next_seq: 1 },
            ControlChannel { tx: b_tx, rx: b_rx, next_seq: 1 },
        )
    }

    /// Bridge an endpoint onto an async reader/writer pair, one JSON line per
    /// message (child stdout/stdin on the supervisor side, process stdio on the
    /// worker side).
    ///
    /// Returns the endpoint plus the two pump tasks.
    pub fn bridge<R, W>(
        reader: R,
        mut writer: W,
        label: &str,
    ) -> (ControlChannel, [tokio::task::JoinHandle<()>; 2])
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (local, remote) = ControlChannel::pair();
        let ControlChannel { tx: remote_tx, rx: mut remote_rx, .. } = remote;

        let read_label = label.to_string();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if remote_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("[ctl {read_label}] reader reached EOF");
                        break;
                    }
                    Err(e) => {
                        warn!("[ctl {read_label}] read error: {e}");
                        break;
                    }
                }
            }
        });

        let write_label = label.to_string();
        let writer_task = tokio::spawn(async move {
            while let Some(mut line) = remote_rx.recv().await {
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("[ctl {write_label}] write error: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!("[ctl {write_label}] flush error: {e}");
                    break;
                }
            }
        });

        (local, [reader_task, writer_task])
    }

    /// Bridge onto the current process's stdin/stdout (worker side).
    pub fn from_stdio(label: &str) -> (ControlChannel, [tokio::task::JoinHandle<()>; 2]) {
        Self::bridge(tokio::io::stdin(), tokio::io::stdout(), label)
    }

    /// Encode and send a message. Messages sent through the same endpoint
    /// without an explicit `seq` get a monotonically increasing one.
    pub fn send(&mut self, mut msg: ControlMessage) -> Result<(), BookfeedError> {
        if msg.seq.is_none() {
            msg.seq = Some(self.next_seq);
            self.next_seq += 1;
        }
        let line = msg.encode()?;
        self.tx
            .send(line)
            .map_err(|_| BookfeedError::Protocol("control channel closed".into()))
    }

    /// Send a raw line as-is.
    pub fn send_raw(&self, line: String) -> Result<(), BookfeedError> {
        self.tx.send(line).map_err(|_| BookfeedError::Protocol("control channel closed".into()))
    }

    /// Await the next raw line. `None` once the peer is gone.
    pub async fn recv_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive used by polling loops.
    pub fn try_recv_line(&mut self) -> Result<String, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Returns `true` once the peer's receiving half is gone, so nothing sent
    /// from here will be read.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Decode a received line, logging and discarding anything malformed.
pub fn decode_or_warn(line: &str, label: &str) -> Option<ControlMessage> {
    match ControlMessage::decode(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("[ctl {label}] dropping malformed message: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &ControlMessage) -> ControlMessage {
        let line = msg.encode().unwrap();
        ControlMessage::decode(&line).unwrap()
    }

    #[test]
    fn helpers_round_trip_and_validate() {
        let stop = create_control_message(MessageKind::ControlStop, "binance", json!({"reason": "shutdown"}))
            .unwrap()
            .with_seq(3);
        let msgs = vec![
            create_heartbeat_message("binance", 12.5),
            create_health_message("binance", json!({"spot": {"BTCUSDT": {"successes": 3}}})),
            create_metrics_message("binance", json!({"counters": []})),
            create_log_message("binance", LogLevel::Warn, "slow exchange"),
            create_ack_message("binance", &stop),
            stop,
        ];
        for msg in &msgs {
            msg.validate().unwrap();
            assert_eq!(&round_trip(msg), msg);
        }
    }

    #[test]
    fn control_messages_carry_params() {
        let msg = create_control_message(MessageKind::ControlReload, "okx", json!({"path": "/etc/b.json"}))
            .unwrap();
        assert_eq!(msg.message_kind(), Some(MessageKind::ControlReload));
        assert_eq!(msg.params()["path"], "/etc/b.json");
        assert!(create_control_message(MessageKind::Heartbeat, "okx", Value::Null).is_err());
    }

    #[test]
    fn validation_rejects_malformed() {
        let mut msg = create_heartbeat_message("bybit", 1.0);
        msg.kind.clear();
        assert!(msg.validate().is_err());

        let mut msg = create_heartbeat_message("bybit", 1.0);
        msg.owner_id.clear();
        assert!(msg.validate().is_err());

        let mut msg = create_heartbeat_message("bybit", 1.0);
        msg.timestamp = 0.0;
        assert!(msg.validate().is_err());

        assert!(ControlMessage::decode(r#"{"msg_type":"heartbeat","exchange":"bybit","timestamp":1.0}"#).is_err());
        assert!(ControlMessage::decode("not json").is_err());
    }

    #[test]
    fn unknown_fields_and_kinds_are_tolerated() {
        let line = r#"{"msg_type":"telemetry_v9","exchange":"okx","timestamp":5.5,"data":{},"seq":null,"extra":1}"#;
        let msg = ControlMessage::decode(line).unwrap();
        assert_eq!(msg.message_kind(), None);
        assert_eq!(msg.seq, None);
    }

    #[tokio::test]
    async fn pair_delivers_in_order_with_sequence_numbers() {
        let (mut sup, mut worker) = ControlChannel::pair();
        for kind in [MessageKind::ControlReload, MessageKind::ControlStop] {
            sup.send(create_control_message(kind, "deribit", Value::Null).unwrap()).unwrap();
        }
        let first = ControlMessage::decode(&worker.recv_line().await.unwrap()).unwrap();
        let second = ControlMessage::decode(&worker.recv_line().await.unwrap()).unwrap();
        assert_eq!(first.message_kind(), Some(MessageKind::ControlReload));
        assert_eq!((first.seq, second.seq), (Some(1), Some(2)));
    }

    #[test]
    fn closed_once_the_peer_stops_receiving() {
        let (a, b) = ControlChannel::pair();
        assert!(!a.is_closed());
        drop(b);
        assert!(a.is_closed());
        assert!(a.send_raw("{}".into()).is_err());
    }

    #[tokio::test]
    async fn bridge_moves_lines_over_io() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let (mut a, _tasks_a) = ControlChannel::bridge(server_read, server_write, "a");
        let (mut b, _tasks_b) = ControlChannel::bridge(client_read, client_write, "b");

        a.send(create_heartbeat_message("binance", 1.0)).unwrap();
        b.send_raw("garbage".into()).unwrap();

        let got = b.recv_line().await.unwrap();
        assert_eq!(ControlMessage::decode(&got).unwrap().message_kind(), Some(MessageKind::Heartbeat));
        let bad = a.recv_line().await.unwrap();
        assert!(decode_or_warn(&bad, "a").is_none());
    }
}
