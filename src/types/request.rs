use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

const SESSION_ID_MAX_CHARS: usize = 200;
const MESSAGE_MAX_CHARS: usize = 10_000;
const SUBJECT_MAX_CHARS: usize = 100;
const SYLLABUS_HINTS_MAX_CHARS: usize = 1_000;
pub const RETRIEVAL_K_RANGE: std::ops::RangeInclusive<u8> = 1..=20;

const KNOWN_FIELDS: [&str; 5] = [
    "sessionId",
    "message",
    "subject",
    "max_retrieval_k",
    "syllabus_hints",
];

/// Inbound chat request, as accepted by the relay and sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retrieval_k: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syllabus_hints: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in one request body, in field order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render_violations(.violations))]
pub struct RequestValidationError {
    pub violations: Vec<FieldViolation>,
}

impl RequestValidationError {
    fn single(field: &str, message: impl Into<String>) -> Self {
        Self {
            violations: vec![FieldViolation {
                field: field.to_string(),
                message: message.into(),
            }],
        }
    }

    pub fn detail(&self) -> String {
        render_violations(&self.violations)
    }
}

fn render_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: message.into(),
            subject: subject.into(),
            max_retrieval_k: None,
            syllabus_hints: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, RequestValidationError> {
        let value: Value = serde_json::from_slice(body).map_err(|error| {
            RequestValidationError::single("body", format!("invalid JSON ({error})"))
        })?;
        Self::from_value(&value)
    }

    /// Validates a request body, reporting every bad field rather than the first.
    pub fn from_value(value: &Value) -> Result<Self, RequestValidationError> {
        let Some(object) = value.as_object() else {
            return Err(RequestValidationError::single(
                "body",
                "expected a JSON object",
            ));
        };

        let mut violations = Vec::new();
        for key in object.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                violations.push(violation(key, "unexpected field"));
            }
        }

        let session_id = optional_string(
            object,
            "sessionId",
            1,
            SESSION_ID_MAX_CHARS,
            &mut violations,
        );
        let message = required_string(object, "message", MESSAGE_MAX_CHARS, &mut violations);
        let subject = required_string(object, "subject", SUBJECT_MAX_CHARS, &mut violations);
        let max_retrieval_k = optional_retrieval_k(object, &mut violations);
        let syllabus_hints = optional_string(
            object,
            "syllabus_hints",
            0,
            SYLLABUS_HINTS_MAX_CHARS,
            &mut violations,
        );

        match (message, subject) {
            (Some(message), Some(subject)) if violations.is_empty() => Ok(Self {
                session_id,
                message,
                subject,
                max_retrieval_k,
                syllabus_hints,
            }),
            _ => Err(RequestValidationError { violations }),
        }
    }
}

fn violation(field: &str, message: impl Into<String>) -> FieldViolation {
    FieldViolation {
        field: field.to_string(),
        message: message.into(),
    }
}

fn check_length(
    field: &str,
    text: &str,
    min: usize,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) -> bool {
    let chars = text.chars().count();
    if chars < min {
        violations.push(violation(
            field,
            format!("must be at least {min} character(s)"),
        ));
        return false;
    }
    if chars > max {
        violations.push(violation(field, format!("must be at most {max} characters")));
        return false;
    }
    true
}

fn required_string(
    object: &Map<String, Value>,
    field: &str,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match object.get(field) {
        None | Some(Value::Null) => {
            violations.push(violation(field, "field required"));
            None
        }
        Some(Value::String(text)) => {
            check_length(field, text, 1, max, violations).then(|| text.clone())
        }
        Some(_) => {
            violations.push(violation(field, "expected a string"));
            None
        }
    }
}

fn optional_string(
    object: &Map<String, Value>,
    field: &str,
    min: usize,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match object.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => {
            check_length(field, text, min, max, violations).then(|| text.clone())
        }
        Some(_) => {
            violations.push(violation(field, "expected a string"));
            None
        }
    }
}

fn optional_retrieval_k(
    object: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<u8> {
    let field = "max_retrieval_k";
    match object.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => {
            let in_range = number
                .as_u64()
                .and_then(|k| u8::try_from(k).ok())
                .filter(|k| RETRIEVAL_K_RANGE.contains(k));
            if in_range.is_none() {
                let message = if number.is_u64() || number.is_i64() {
                    format!(
                        "must be between {} and {}",
                        RETRIEVAL_K_RANGE.start(),
                        RETRIEVAL_K_RANGE.end()
                    )
                } else {
                    "expected an integer".to_string()
                };
                violations.push(violation(field, message));
            }
            in_range
        }
        Some(_) => {
            violations.push(violation(field, "expected an integer"));
            None
        }
    }
}
