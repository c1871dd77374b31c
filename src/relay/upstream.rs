use crate::types::ChatRequest;
use crate::util::is_local_endpoint_url;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;

pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Payload sent to the generation backend's chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    pub subject: String,
    pub max_retrieval_k: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syllabus_hints: Option<String>,
}

impl UpstreamChatRequest {
    pub fn from_request(request: ChatRequest, default_retrieval_k: u8) -> Self {
        Self {
            session_id: request.session_id,
            message: request.message,
            subject: request.subject,
            max_retrieval_k: request.max_retrieval_k.unwrap_or(default_retrieval_k),
            syllabus_hints: request.syllabus_hints,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Unreachable(String),

    #[error("backend stream failed: {0}")]
    Stream(String),
}

/// The generation backend, injected into the relay router.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Starts a chat turn. Returns only once the backend has answered with a
    /// success status; any other outcome is an error and no stream exists.
    async fn open_chat(&self, request: &UpstreamChatRequest)
        -> Result<UpstreamStream, UpstreamError>;
}

pub struct HttpChatBackend {
    http: reqwest::Client,
    chat_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            chat_url: format!("{}/api/chat", base_url.trim_end_matches('/')),
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

#[async_trait::async_trait]
impl ChatBackend for HttpChatBackend {
    async fn open_chat(
        &self,
        request: &UpstreamChatRequest,
    ) -> Result<UpstreamStream, UpstreamError> {
        let response = self
            .http
            .post(&self.chat_url)
            .json(request)
            .send()
            .await
            .map_err(|error| map_backend_request_error(error, &self.chat_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|error| format!("<unreadable body: {error}>"));
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|error| UpstreamError::Stream(error.to_string())));
        Ok(Box::pin(stream))
    }
}

fn map_backend_request_error(error: reqwest::Error, request_url: &str) -> UpstreamError {
    let message = if error.is_connect() && is_local_endpoint_url(request_url) {
        format!(
            "cannot reach local backend '{request_url}': {error}. Start the backend or update TUTOR_BACKEND_URL."
        )
    } else if error.is_connect() {
        format!("cannot reach backend '{request_url}': {error}")
    } else if error.is_timeout() {
        format!("backend request to '{request_url}' timed out: {error}")
    } else {
        format!("backend request to '{request_url}' failed: {error}")
    };
    UpstreamError::Unreachable(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_retrieval_k_is_attached_when_omitted() {
        let upstream =
            UpstreamChatRequest::from_request(ChatRequest::new("What is pH?", "Chemistry"), 5);
        assert_eq!(
            serde_json::to_value(&upstream).unwrap(),
            json!({"message": "What is pH?", "subject": "Chemistry", "max_retrieval_k": 5})
        );
    }

    #[test]
    fn test_fields_are_forwarded_verbatim() {
        let mut request = ChatRequest::new("  Why?  ", "Physics").with_session_id("abc");
        request.max_retrieval_k = Some(9);
        request.syllabus_hints = Some("kinematics".to_string());

        let upstream = UpstreamChatRequest::from_request(request, 5);
        assert_eq!(
            serde_json::to_value(&upstream).unwrap(),
            json!({
                "session_id": "abc",
                "message": "  Why?  ",
                "subject": "Physics",
                "max_retrieval_k": 9,
                "syllabus_hints": "kinematics"
            })
        );
    }

    #[test]
    fn test_chat_url_joins_base_without_double_slash() {
        assert_eq!(
            HttpChatBackend::new("http://localhost:8000/").chat_url(),
            "http://localhost:8000/api/chat"
        );
    }
}
