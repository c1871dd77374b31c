use crate::api::client::{ByteStream, MockStreamProducer};
use crate::api::consumer::ConsumerError;
use crate::types::ChatRequest;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream;
use std::sync::{Arc, Mutex};

/// One scripted relay response.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Raw body chunks, sent exactly as given.
    Chunks(Vec<String>),
    /// Chunks followed by a transport failure.
    Broken(Vec<String>, String),
    /// Fails before any body is read.
    Reject(ConsumerError),
}

#[derive(Clone)]
pub struct MockChatClient {
    responses: Arc<Mutex<Vec<MockResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockChatClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// One NDJSON line per event value.
    pub fn ndjson(lines: &[&str]) -> MockResponse {
        MockResponse::Chunks(lines.iter().map(|line| format!("{line}\n")).collect())
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl MockStreamProducer for MockChatClient {
    fn create_mock_stream(&self, request: &ChatRequest) -> Result<ByteStream, ConsumerError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses_guard = self.responses.lock().unwrap();
        if responses_guard.is_empty() {
            return Err(ConsumerError::Transport(
                "MockChatClient: No more responses configured".to_string(),
            ));
        }

        let (chunks, failure) = match responses_guard.remove(0) {
            MockResponse::Chunks(chunks) => (chunks, None),
            MockResponse::Broken(chunks, failure) => (chunks, Some(failure)),
            MockResponse::Reject(error) => return Err(error),
        };

        let mut byte_chunks: Vec<Result<Bytes>> =
            chunks.into_iter().map(|s| Ok(Bytes::from(s))).collect();
        if let Some(failure) = failure {
            byte_chunks.push(Err(anyhow!(failure)));
        }

        Ok(Box::pin(stream::iter(byte_chunks)))
    }
}
