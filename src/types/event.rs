use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminants accepted in the `type` field of a wire event.
pub const EVENT_KINDS: [&str; 4] = ["delta", "tool", "error", "done"];

const MAX_ERROR_CODE_CHARS: usize = 100;

/// One line of the NDJSON chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text fragment.
    Delta { token: String },
    /// Request for a side action, e.g. flashcard generation.
    Tool {
        name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Terminal marker. Any extra fields ride along untouched.
    Done {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventSchemaError {
    #[error("missing or unknown event type")]
    InvalidType,
    #[error("invalid event format: {0}")]
    InvalidShape(String),
}

impl StreamEvent {
    pub fn delta(token: impl Into<String>) -> Self {
        Self::Delta {
            token: token.into(),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn done() -> Self {
        Self::Done { extra: Map::new() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Tool { .. } => "tool",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Checks a parsed JSON value against the wire schema.
    ///
    /// The discriminant is checked first so callers can tell an unknown kind
    /// apart from a known kind with a bad payload.
    pub fn from_value(value: Value) -> Result<Self, EventSchemaError> {
        let kind_is_known = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| EVENT_KINDS.contains(&kind));
        if !kind_is_known {
            return Err(EventSchemaError::InvalidType);
        }

        let event: Self = serde_json::from_value(value)
            .map_err(|error| EventSchemaError::InvalidShape(error.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), EventSchemaError> {
        match self {
            Self::Delta { token } if token.is_empty() => Err(EventSchemaError::InvalidShape(
                "token must not be empty".to_string(),
            )),
            Self::Tool { name, .. } if name.trim().is_empty() => Err(
                EventSchemaError::InvalidShape("tool name must not be empty".to_string()),
            ),
            Self::Error { message, .. } if message.is_empty() => Err(
                EventSchemaError::InvalidShape("error message must not be empty".to_string()),
            ),
            Self::Error {
                code: Some(code), ..
            } if code.chars().count() > MAX_ERROR_CODE_CHARS => {
                Err(EventSchemaError::InvalidShape(format!(
                    "error code longer than {MAX_ERROR_CODE_CHARS} characters"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Serializes the event as one newline-terminated NDJSON line.
    pub fn to_line(&self) -> serde_json::Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}
