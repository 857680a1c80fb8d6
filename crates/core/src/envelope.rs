//! Tagged wire message shared by the render RPC and the client status channel.
//!
//! On the wire an envelope is `{"type": KIND, "message": TEXT, "data": {...}}`.
//! Decoding is closed: a `type` outside [`MessageKind`] is rejected, never
//! defaulted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Ping,
    Pong,
    Running,
    FullJob,
    Terminate,
    Error,
    Complete,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Running,
        MessageKind::FullJob,
        MessageKind::Terminate,
        MessageKind::Error,
        MessageKind::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Running => "RUNNING",
            MessageKind::FullJob => "FULL_JOB",
            MessageKind::Terminate => "TERMINATE",
            MessageKind::Error => "ERROR",
            MessageKind::Complete => "COMPLETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope kind: {0:?}")]
    UnknownKind(String),
    #[error("envelope field `data.{field}` has the wrong type for {kind}")]
    InvalidField { kind: MessageKind, field: &'static str },
}

/// One message. Each variant carries only the payload its kind allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub enum Envelope {
    Ping {
        text: String,
        echo: Option<i64>,
    },
    Pong {
        text: String,
    },
    Running {
        text: String,
        job_id: Option<String>,
        queue_position: Option<usize>,
    },
    FullJob {
        text: String,
    },
    Terminate {
        text: String,
    },
    Error {
        text: String,
    },
    Complete {
        text: String,
        artifact_path: Option<String>,
    },
}

const DATA_ECHO: &str = "echo";
const DATA_JOB_ID: &str = "job_id";
const DATA_QUEUE_POSITION: &str = "queue_position";
const DATA_FILE_PATH: &str = "file_path";

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn ping() -> Self {
        Self::Ping {
            text: String::new(),
            echo: None,
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            text: String::new(),
        }
    }

    pub fn running(text: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Running {
            text: text.into(),
            job_id,
            queue_position: None,
        }
    }

    pub fn full_job(text: impl Into<String>) -> Self {
        Self::FullJob { text: text.into() }
    }

    pub fn terminate(text: impl Into<String>) -> Self {
        Self::Terminate { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn complete(text: impl Into<String>, artifact_path: Option<String>) -> Self {
        Self::Complete {
            text: text.into(),
            artifact_path,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Ping { .. } => MessageKind::Ping,
            Envelope::Pong { .. } => MessageKind::Pong,
            Envelope::Running { .. } => MessageKind::Running,
            Envelope::FullJob { .. } => MessageKind::FullJob,
            Envelope::Terminate { .. } => MessageKind::Terminate,
            Envelope::Error { .. } => MessageKind::Error,
            Envelope::Complete { .. } => MessageKind::Complete,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Envelope::Ping { text, .. }
            | Envelope::Pong { text }
            | Envelope::Running { text, .. }
            | Envelope::FullJob { text }
            | Envelope::Terminate { text }
            | Envelope::Error { text }
            | Envelope::Complete { text, .. } => text,
        }
    }

    /// `COMPLETE`, `ERROR` and `FULL_JOB` end a status session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Envelope::Complete { .. } | Envelope::Error { .. } | Envelope::FullJob { .. }
        )
    }

    pub fn encode(&self) -> String {
        let wire = WireEnvelope::from(self.clone());
        // A map of strings and numbers always serializes.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        Self::decode_slice(raw.as_bytes())
    }

    pub fn decode_slice(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(raw)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        Self::try_from(wire)
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind().as_str().to_string();
        let mut data = Map::new();
        let text = match envelope {
            Envelope::Ping { text, echo } => {
                if let Some(echo) = echo {
                    data.insert(DATA_ECHO.to_string(), Value::from(echo));
                }
                text
            }
            Envelope::Running {
                text,
                job_id,
                queue_position,
            } => {
                if let Some(job_id) = job_id {
                    data.insert(DATA_JOB_ID.to_string(), Value::from(job_id));
                }
                if let Some(position) = queue_position {
                    data.insert(DATA_QUEUE_POSITION.to_string(), Value::from(position));
                }
                text
            }
            Envelope::Complete {
                text,
                artifact_path,
            } => {
                if let Some(path) = artifact_path {
                    data.insert(DATA_FILE_PATH.to_string(), Value::from(path));
                }
                text
            }
            Envelope::Pong { text }
            | Envelope::FullJob { text }
            | Envelope::Terminate { text }
            | Envelope::Error { text } => text,
        };

        WireEnvelope {
            kind,
            message: Some(text),
            data: Some(data),
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, EnvelopeError> {
        let kind = MessageKind::parse(&wire.kind)
            .ok_or_else(|| EnvelopeError::UnknownKind(wire.kind.clone()))?;
        let text = wire.message.unwrap_or_default();
        let data = wire.data.unwrap_or_default();

        let envelope = match kind {
            MessageKind::Ping => Envelope::Ping {
                text,
                echo: optional_field(&data, kind, DATA_ECHO, Value::as_i64)?,
            },
            MessageKind::Pong => Envelope::Pong { text },
            MessageKind::Running => Envelope::Running {
                text,
                job_id: optional_field(&data, kind, DATA_JOB_ID, |v| {
                    v.as_str().map(ToString::to_string)
                })?,
                queue_position: optional_field(&data, kind, DATA_QUEUE_POSITION, |v| {
                    v.as_u64().and_then(|n| usize::try_from(n).ok())
                })?,
            },
            MessageKind::FullJob => Envelope::FullJob { text },
            MessageKind::Terminate => Envelope::Terminate { text },
            MessageKind::Error => Envelope::Error { text },
            MessageKind::Complete => Envelope::Complete {
                text,
                artifact_path: optional_field(&data, kind, DATA_FILE_PATH, |v| {
                    v.as_str().map(ToString::to_string)
                })?,
            },
        };

        Ok(envelope)
    }
}

fn optional_field<T>(
    data: &Map<String, Value>,
    kind: MessageKind,
    field: &'static str,
    extract: impl Fn(&Value) -> Option<T>,
) -> Result<Option<T>, EnvelopeError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => extract(value)
            .map(Some)
            .ok_or(EnvelopeError::InvalidField { kind, field }),
    }
}
