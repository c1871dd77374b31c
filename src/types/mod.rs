mod event;
mod request;

pub use event::{EventSchemaError, StreamEvent, EVENT_KINDS};
pub use request::{ChatRequest, FieldViolation, RequestValidationError, RETRIEVAL_K_RANGE};
