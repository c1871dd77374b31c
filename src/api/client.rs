use super::consumer::ConsumerError;
use crate::config::Config;
use crate::relay::NDJSON_CONTENT_TYPE;
use crate::types::ChatRequest;
use crate::util::is_local_endpoint_url;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
#[cfg(test)]
use std::sync::Arc;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[cfg(test)]
pub trait MockStreamProducer: Send + Sync {
    fn create_mock_stream(&self, request: &ChatRequest) -> Result<ByteStream, ConsumerError>;
}

/// HTTP client for the relay's chat endpoint.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    relay_url: String,
    #[cfg(test)]
    mock_stream_producer: Option<Arc<dyn MockStreamProducer>>,
}

impl ChatClient {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            #[cfg(test)]
            mock_stream_producer: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.relay_url.clone())
    }

    #[cfg(test)]
    pub fn new_mock(mock_producer: Arc<dyn MockStreamProducer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: "http://localhost:3000/api/chat".to_string(),
            mock_stream_producer: Some(mock_producer),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Posts a chat request and returns the relay's NDJSON body.
    ///
    /// Fails before any bytes are read when the relay answers with a
    /// non-success status or an empty body.
    pub async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ConsumerError> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                return producer.create_mock_stream(request);
            }
        }

        let response = self
            .http
            .post(&self.relay_url)
            .header(reqwest::header::ACCEPT, NDJSON_CONTENT_TYPE)
            .json(request)
            .send()
            .await
            .map_err(|error| map_relay_request_error(error, &self.relay_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsumerError::Status {
                status: status.as_u16(),
                message: error_message_from_body(&body),
            });
        }
        if response.content_length() == Some(0) {
            return Err(ConsumerError::MissingBody);
        }

        let relay_url = self.relay_url.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| anyhow!("relay stream from '{relay_url}' failed: {error}"))
        });
        Ok(Box::pin(stream))
    }
}

fn map_relay_request_error(error: reqwest::Error, request_url: &str) -> ConsumerError {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return ConsumerError::Transport(format!(
            "cannot reach local relay '{request_url}': {error}. Start tutor-relay or update TUTOR_RELAY_URL."
        ));
    }
    if error.is_timeout() {
        return ConsumerError::Transport(format!(
            "request to relay '{request_url}' timed out: {error}"
        ));
    }
    ConsumerError::Transport(format!("request to relay '{request_url}' failed: {error}"))
}

/// Pulls `error` (and `detail`, when present) out of a JSON error body.
fn error_message_from_body(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let error = value.get("error").and_then(Value::as_str);
        let detail = value.get("detail").and_then(Value::as_str);
        match (error, detail) {
            (Some(error), Some(detail)) => return format!("{error} ({detail})"),
            (Some(error), None) => return error.to_string(),
            _ => {}
        }
    }
    if trimmed.is_empty() {
        "<empty body>".to_string()
    } else {
        trimmed.to_string()
    }
}
