//! Records exchanged with the in-sandbox helper.
//!
//! Every record is one JSON object followed by a newline. The forward direction
//! carries [`Command`]s; the rewind direction carries [`Envelope`]s that decode
//! into the closed [`Rewind`] sum type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A command forwarded to a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Command name, e.g. `core.ping`.
    pub command: String,
    /// Typed arguments, passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
    /// Serialization queue inside the helper.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue: String,
    /// Seconds between stats samples, 0 disables.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stats_interval: u32,
    /// Seconds before the job is killed, 0 means unlimited.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_time: u32,
    /// Restarts allowed after failure.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_restart: u32,
    /// Seconds between recurring runs.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub recurring_period: u32,
    /// Stream output as log lines.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    /// Log levels to capture.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_levels: Vec<u16>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Command {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Finished successfully.
    Success,
    /// Finished with an error.
    #[default]
    Error,
    /// Hit its time limit.
    Timeout,
    /// Was killed.
    Killed,
    /// The helper does not know the command.
    UnknownCmd,
    /// The id was already in use.
    #[serde(alias = "DUPILICATE_ID")]
    DuplicateId,
}

/// Result of a job, routed to the broker by correlation id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResult {
    /// Correlation id.
    pub id: String,
    /// Command name.
    pub command: String,
    /// Result payload, usually JSON text.
    pub data: String,
    /// Captured `[stdout, stderr]`.
    pub streams: Vec<String>,
    /// Critical error text.
    pub critical: String,
    /// Level of `data`.
    pub level: u16,
    /// Terminal state.
    pub state: JobState,
    /// Exit code.
    pub code: u32,
    /// Start time in milliseconds since the epoch.
    pub starttime: i64,
    /// Run time in milliseconds.
    pub time: i64,
    /// Tags copied from the command.
    pub tags: Vec<String>,
    /// Id of the container that produced the result.
    pub container: u64,
}

impl JobResult {
    /// Captured stdout.
    #[must_use]
    pub fn stdout(&self) -> &str {
        self.streams.first().map_or("", String::as_str)
    }

    /// Captured stderr.
    #[must_use]
    pub fn stderr(&self) -> &str {
        self.streams.get(1).map_or("", String::as_str)
    }
}

/// A log line produced inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMessage {
    /// Text of the line.
    pub message: String,
    /// Timestamp in nanoseconds since the epoch.
    pub epoch: i64,
    /// Packed `code << 32 | level << 16 | flags`.
    pub meta: u64,
}

impl LogMessage {
    /// Severity / stream level.
    #[must_use]
    pub fn level(&self) -> u16 {
        ((self.meta >> 16) & 0xffff) as u16
    }
}

/// A metric tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// A metric sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatSample {
    /// Aggregation operation (`A` average, `D` differential, ...).
    pub operation: String,
    /// Metric key, not yet namespaced by container.
    pub key: String,
    /// Sample value.
    pub value: f64,
    /// Optional tags.
    #[serde(default)]
    pub tags: Vec<StatTag>,
}

/// Discriminant of a rewind envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Terminal job result.
    Result,
    /// Log line.
    Log,
    /// Metric sample.
    Stats,
}

/// Raw rewind record: `{type, command, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlation id of the command the message belongs to.
    #[serde(default)]
    pub command: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// A decoded rewind message.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewind {
    /// Terminal job result.
    Result(JobResult),
    /// Log line for `command`.
    Log {
        /// Correlation id.
        command: String,
        /// The line.
        message: LogMessage,
    },
    /// Metric sample.
    Stats(StatSample),
}

impl Rewind {
    /// Decodes the payload selected by the envelope's discriminant.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Decode` if the payload does not match its kind.
    pub fn decode(envelope: Envelope) -> Result<Self, RelayError> {
        let Envelope {
            kind,
            command,
            payload,
        } = envelope;
        match kind {
            MessageKind::Result => serde_json::from_value(payload)
                .map(Self::Result)
                .map_err(RelayError::Decode),
            MessageKind::Log => serde_json::from_value(payload)
                .map(|message| Self::Log { command, message })
                .map_err(RelayError::Decode),
            MessageKind::Stats => serde_json::from_value(payload)
                .map(Self::Stats)
                .map_err(RelayError::Decode),
        }
    }

    /// Builds the envelope the helper writes for this message.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Encode` if the payload cannot be serialized.
    pub fn envelope(&self) -> Result<Envelope, RelayError> {
        let (kind, command, payload) = match self {
            Self::Result(result) => (
                MessageKind::Result,
                result.id.clone(),
                serde_json::to_value(result),
            ),
            Self::Log { command, message } => {
                (MessageKind::Log, command.clone(), serde_json::to_value(message))
            }
            Self::Stats(sample) => (MessageKind::Stats, String::new(), serde_json::to_value(sample)),
        };
        Ok(Envelope {
            kind,
            command,
            payload: payload.map_err(RelayError::Encode)?,
        })
    }
}

/// Encodes one record as a newline-terminated JSON line.
///
/// # Errors
///
/// Returns `RelayError::Encode` if serialization fails.
pub fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>, RelayError> {
    let mut line = serde_json::to_vec(record).map_err(RelayError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_skips_defaults() {
        let cmd = Command::new("core.ping").with_id("abc");
        let json = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(json, json!({"id": "abc", "command": "core.ping"}));
    }

    #[test]
    fn test_decode_result_envelope() {
        let line = r#"{"type":"result","command":"abc","payload":{"id":"abc","command":"core.ping","data":"\"pong\"","state":"SUCCESS","code":0}}"#;
        let envelope: Envelope = serde_json::from_str(line).expect("envelope");
        let Rewind::Result(result) = Rewind::decode(envelope).expect("decode") else {
            panic!("expected a result");
        };
        assert_eq!(result.id, "abc");
        assert_eq!(result.state, JobState::Success);
        assert_eq!(result.data, "\"pong\"");
    }

    #[test]
    fn test_decode_log_keeps_command() {
        let envelope = Envelope {
            kind: MessageKind::Log,
            command: "job-1".into(),
            payload: json!({"message": "hello", "epoch": 1, "meta": 2u64 << 16}),
        };
        match Rewind::decode(envelope).expect("decode") {
            Rewind::Log { command, message } => {
                assert_eq!(command, "job-1");
                assert_eq!(message.level(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let line = r#"{"type":"bogus","command":"","payload":{}}"#;
        assert!(serde_json::from_str::<Envelope>(line).is_err());
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let envelope = Envelope {
            kind: MessageKind::Stats,
            command: String::new(),
            payload: json!({"operation": "A"}),
        };
        assert!(matches!(
            Rewind::decode(envelope),
            Err(RelayError::Decode(_))
        ));
    }

    #[test]
    fn test_legacy_duplicate_state() {
        let state: JobState = serde_json::from_str("\"DUPILICATE_ID\"").expect("alias");
        assert_eq!(state, JobState::DuplicateId);
    }
}
