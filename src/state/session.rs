use super::store::{MessageId, MessageStore, StoreError};
use crate::api::{ChatClient, ConsumerError, StreamConsumer, StreamHandlers, StreamOutcome};
use crate::finalize::finalize_response;
use crate::types::ChatRequest;
use anyhow::Result;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const APOLOGY_MESSAGE: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Progress of one turn, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    Token(String),
    Tool(ToolRequest),
    Finalized(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// Stream ended without `done`; the partial text was kept.
    Closed,
    /// Cancelled by the caller; the partial text was kept.
    Cancelled,
    /// The message was replaced with [`APOLOGY_MESSAGE`].
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub message_id: MessageId,
    pub text: String,
    pub tools: Vec<ToolRequest>,
    pub status: TurnStatus,
}

/// One chat: a store plus the client that feeds it.
pub struct ChatSession {
    client: ChatClient,
    store: MessageStore,
    subject: String,
    session_id: Option<String>,
    cancel: Option<CancellationToken>,
}

impl ChatSession {
    pub fn new(client: ChatClient, subject: impl Into<String>) -> Self {
        Self {
            client,
            store: MessageStore::new(),
            subject: subject.into(),
            session_id: None,
            cancel: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_store(mut self, store: MessageStore) -> Self {
        self.store = store;
        self
    }

    /// Token checked between reads of every later turn.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Runs one turn. Transport and remote failures do not surface as `Err`;
    /// they leave the apology in the store and a `Failed` status in the report.
    pub async fn send_message(
        &mut self,
        text: String,
        update_tx: Option<&mpsc::UnboundedSender<TurnUpdate>>,
    ) -> Result<TurnReport> {
        let mut request = ChatRequest::new(text.clone(), self.subject.clone());
        request.session_id = self.session_id.clone();

        self.store.push_user(text);
        let message_id = self.store.begin_assistant();

        let stream = match self.client.open_stream(&request).await {
            Ok(stream) => stream,
            Err(error) => return self.fail_turn(message_id, Vec::new(), &error, update_tx),
        };

        let consumer = match &self.cancel {
            Some(token) => StreamConsumer::new().with_cancellation(token.clone()),
            None => StreamConsumer::new(),
        };
        let mut sink = TurnSink {
            store: &mut self.store,
            message_id,
            update_tx,
            tools: Vec::new(),
            store_error: None,
        };
        let result = consumer.consume(stream, &mut sink).await;
        let TurnSink {
            tools, store_error, ..
        } = sink;
        if let Some(error) = store_error {
            return Err(error.into());
        }

        let status = match result {
            Ok(StreamOutcome::Completed) => TurnStatus::Completed,
            Ok(StreamOutcome::Cancelled) => TurnStatus::Cancelled,
            Ok(StreamOutcome::Closed) if self.partial_text(message_id).trim().is_empty() => {
                let error = ConsumerError::Transport(
                    "stream closed before any content arrived".to_string(),
                );
                return self.fail_turn(message_id, tools, &error, update_tx);
            }
            Ok(StreamOutcome::Closed) => TurnStatus::Closed,
            Ok(StreamOutcome::Interrupted(reason)) => {
                let error = ConsumerError::Transport(reason);
                return self.fail_turn(message_id, tools, &error, update_tx);
            }
            Err(error) => return self.fail_turn(message_id, tools, &error, update_tx),
        };

        let finalized = finalize_response(self.partial_text(message_id));
        self.store.replace(message_id, finalized.clone())?;
        info!(
            status = ?status,
            chars = finalized.chars().count(),
            tools = tools.len(),
            "chat turn finished"
        );
        emit_update(update_tx, TurnUpdate::Finalized(finalized.clone()));

        Ok(TurnReport {
            message_id,
            text: finalized,
            tools,
            status,
        })
    }

    fn partial_text(&self, message_id: MessageId) -> &str {
        self.store
            .get(message_id)
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }

    fn fail_turn(
        &mut self,
        message_id: MessageId,
        tools: Vec<ToolRequest>,
        error: &ConsumerError,
        update_tx: Option<&mpsc::UnboundedSender<TurnUpdate>>,
    ) -> Result<TurnReport> {
        warn!(%error, "chat turn failed");
        self.store.replace(message_id, APOLOGY_MESSAGE)?;
        emit_update(update_tx, TurnUpdate::Failed(error.to_string()));
        Ok(TurnReport {
            message_id,
            text: APOLOGY_MESSAGE.to_string(),
            tools,
            status: TurnStatus::Failed(error.to_string()),
        })
    }
}

struct TurnSink<'a> {
    store: &'a mut MessageStore,
    message_id: MessageId,
    update_tx: Option<&'a mpsc::UnboundedSender<TurnUpdate>>,
    tools: Vec<ToolRequest>,
    store_error: Option<StoreError>,
}

impl StreamHandlers for TurnSink<'_> {
    fn on_token(&mut self, token: &str) {
        if let Err(error) = self.store.append(self.message_id, token) {
            self.store_error.get_or_insert(error);
            return;
        }
        emit_update(self.update_tx, TurnUpdate::Token(token.to_string()));
    }

    fn on_tool(&mut self, name: &str, args: &Map<String, Value>) {
        let request = ToolRequest {
            name: name.to_string(),
            args: args.clone(),
        };
        emit_update(self.update_tx, TurnUpdate::Tool(request.clone()));
        self.tools.push(request);
    }
}

fn emit_update(update_tx: Option<&mpsc::UnboundedSender<TurnUpdate>>, update: TurnUpdate) {
    if let Some(tx) = update_tx {
        let _ = tx.send(update);
    }
}
