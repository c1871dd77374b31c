use crate::finalize::{normalize_formulas, repair_legacy_math};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(usize);

impl MessageId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set once the content has been through the finalizer.
    #[serde(default)]
    pub finalized: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no message with id {0:?}")]
    UnknownMessage(MessageId),
    #[error("message {0:?} is not an assistant message")]
    NotAssistant(MessageId),
}

/// Single-writer message history for one chat.
///
/// All mutation goes through `push_user`, `begin_assistant`, `append` and
/// `replace`.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads history from outside the pipeline. Assistant content loaded this
    /// way is treated as never finalized.
    pub fn restore(messages: Vec<ChatMessage>) -> Self {
        let messages = messages
            .into_iter()
            .map(|message| ChatMessage {
                finalized: message.role == Role::User,
                ..message
            })
            .collect();
        Self { messages }
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> MessageId {
        self.push(ChatMessage {
            role: Role::User,
            content: content.into(),
            finalized: true,
        })
    }

    pub fn begin_assistant(&mut self) -> MessageId {
        self.push(ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            finalized: false,
        })
    }

    pub fn append(&mut self, id: MessageId, fragment: &str) -> Result<(), StoreError> {
        let message = self.assistant_mut(id)?;
        message.content.push_str(fragment);
        Ok(())
    }

    /// Swaps in the final content of an assistant message.
    pub fn replace(&mut self, id: MessageId, content: impl Into<String>) -> Result<(), StoreError> {
        let message = self.assistant_mut(id)?;
        message.content = content.into();
        message.finalized = true;
        Ok(())
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.get(id.0)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text to render for a message. Assistant content that never went
    /// through the finalizer gets the legacy repair plus formula pass.
    pub fn display_text(&self, id: MessageId) -> Option<Cow<'_, str>> {
        let message = self.get(id)?;
        if message.finalized || message.role == Role::User {
            return Some(Cow::Borrowed(&message.content));
        }
        Some(Cow::Owned(normalize_formulas(&repair_legacy_math(
            &message.content,
        ))))
    }

    fn push(&mut self, message: ChatMessage) -> MessageId {
        self.messages.push(message);
        MessageId(self.messages.len() - 1)
    }

    fn assistant_mut(&mut self, id: MessageId) -> Result<&mut ChatMessage, StoreError> {
        let message = self
            .messages
            .get_mut(id.0)
            .ok_or(StoreError::UnknownMessage(id))?;
        if message.role != Role::Assistant {
            return Err(StoreError::NotAssistant(id));
        }
        Ok(message)
    }
}
