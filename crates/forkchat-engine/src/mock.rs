//! Deterministic reply generators for tests and the CLI.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use forkchat_core::generator::{ChatTurn, GenerationError, ReplyEvent, ReplyGenerator, ReplyStream};
use forkchat_core::Role;

/// One pre-programmed answer to a `stream` call.
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Yield these events immediately.
    Events(Vec<ReplyEvent>),
    /// Yield these events with a pause before each one.
    Paced(Duration, Vec<ReplyEvent>),
    /// Fail the `stream` call itself.
    Fail(GenerationError),
    /// Yield these events, then never finish.
    Stall(Vec<ReplyEvent>),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    /// Each word of `text` as a delta, then `Done`.
    pub fn words(text: &str) -> Self {
        Self::Events(word_events(text))
    }

    pub fn error(message: &str) -> Self {
        Self::Events(vec![ReplyEvent::Error {
            message: message.to_string(),
        }])
    }

    pub fn delayed(delay: Duration, inner: ScriptedReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn word_events(text: &str) -> Vec<ReplyEvent> {
    let mut events: Vec<ReplyEvent> = text
        .split_inclusive(' ')
        .map(ReplyEvent::delta)
        .collect();
    events.push(ReplyEvent::Done);
    events
}

/// Hands out scripted replies in order and records the history each call
/// was given.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    histories: Mutex<Vec<Vec<ChatTurn>>>,
    call_count: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            histories: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn histories(&self) -> Vec<Vec<ChatTurn>> {
        self.histories.lock().clone()
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, history: &[ChatTurn]) -> Result<ReplyStream, GenerationError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.histories.lock().push(history.to_vec());
        let next = self.replies.lock().pop_front();
        let Some(mut reply) = next else {
            return Err(GenerationError::InvalidRequest(format!(
                "no scripted reply for call {idx}"
            )));
        };

        loop {
            match reply {
                ScriptedReply::Events(events) => return Ok(Box::pin(stream::iter(events))),
                ScriptedReply::Paced(pause, events) => {
                    return Ok(Box::pin(stream::iter(events).then(move |event| async move {
                        tokio::time::sleep(pause).await;
                        event
                    })))
                }
                ScriptedReply::Fail(err) => return Err(err),
                ScriptedReply::Stall(events) => {
                    return Ok(Box::pin(stream::iter(events).chain(stream::pending())))
                }
                ScriptedReply::Delay(pause, inner) => {
                    tokio::time::sleep(pause).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Replies with the last user turn, one word per delta.
pub struct EchoGenerator {
    pause: Duration,
}

impl EchoGenerator {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(30))
    }
}

#[async_trait]
impl ReplyGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, history: &[ChatTurn]) -> Result<ReplyStream, GenerationError> {
        let last = history
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .ok_or_else(|| GenerationError::InvalidRequest("no user turn to echo".into()))?;
        let pause = self.pause;
        let events = word_events(&format!("echo: {}", last.content));
        Ok(Box::pin(stream::iter(events).then(move |event| async move {
            tokio::time::sleep(pause).await;
            event
        })))
    }
}
