use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationRole::System => "system",
            ConversationRole::User => "user",
            ConversationRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ConversationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ConversationRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ConversationRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ConversationRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ConversationRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ConversationRole::Assistant, content)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError>;
}

#[async_trait]
impl<B> ChatBackend for &B
where
    B: ChatBackend + ?Sized,
{
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError> {
        (**self).chat(model, messages).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKey {
    Message,
    Response,
}

impl ReplyKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKey::Message => "message",
            ReplyKey::Response => "response",
        }
    }
}

pub fn extract_reply(reply: &Value) -> Result<(ReplyKey, String), BackendError> {
    if let Some(message) = reply.get(ReplyKey::Message.as_str()) {
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::MalformedReply("message without content".to_string()))?;
        return Ok((ReplyKey::Message, content.to_string()));
    }

    match reply.get(ReplyKey::Response.as_str()).and_then(Value::as_str) {
        Some(response) => Ok((ReplyKey::Response, response.to_string())),
        None => Err(BackendError::MalformedReply(
            "reply has neither message nor response".to_string(),
        )),
    }
}
