use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::messages::Role;

/// One turn of conversation handed to a reply generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Events emitted while a reply is generated. Ordering contract:
///
/// Delta* → (Done | Error)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyEvent {
    Delta { text: String },
    Done,
    Error { message: String },
}

impl ReplyEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = ReplyEvent> + Send>>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The LLM collaborator. Implementations stream assistant content for the
/// given conversation; the history engine never calls a model directly.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, history: &[ChatTurn]) -> Result<ReplyStream, GenerationError>;
}
