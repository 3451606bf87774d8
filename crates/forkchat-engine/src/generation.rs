//! Streamed replies in two short critical sections: the pending node is
//! created under the session lock, content is generated with no lock held,
//! and the node is resolved under the lock again.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use forkchat_core::generator::{ChatTurn, ReplyEvent, ReplyGenerator};
use forkchat_core::{HistoryError, MessageNode, NodeId, NodeStatus, SessionId};

use crate::mutations::HistoryEngine;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CANCEL_MARKER: &str = "[cancelled]";

/// Incremental content for a reply that is still pending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyChunk {
    pub node_id: NodeId,
    pub delta: String,
}

/// How a streamed reply ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyOutcome {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub content: String,
}

impl From<MessageNode> for ReplyOutcome {
    fn from(node: MessageNode) -> Self {
        Self {
            node_id: node.id,
            status: node.status,
            content: node.content,
        }
    }
}

enum Ending {
    Done,
    Failed(String),
    Cancelled,
    TimedOut,
}

pub struct ReplyStreamer {
    engine: Arc<HistoryEngine>,
    generator: Arc<dyn ReplyGenerator>,
    timeout: Duration,
    cancel_marker: String,
}

impl ReplyStreamer {
    pub fn new(engine: Arc<HistoryEngine>, generator: Arc<dyn ReplyGenerator>) -> Self {
        Self {
            engine,
            generator,
            timeout: DEFAULT_REPLY_TIMEOUT,
            cancel_marker: DEFAULT_CANCEL_MARKER.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_marker(mut self, marker: impl Into<String>) -> Self {
        self.cancel_marker = marker.into();
        self
    }

    pub fn engine(&self) -> &Arc<HistoryEngine> {
        &self.engine
    }

    /// Send `content` and stream the reply.
    pub async fn send(
        &self,
        session_id: &SessionId,
        content: &str,
        cancel: &CancellationToken,
        chunks: Option<&mpsc::Sender<ReplyChunk>>,
    ) -> Result<ReplyOutcome, HistoryError> {
        let node_id = self.engine.send_message(session_id, content, None)?;
        self.stream_reply(session_id, &node_id, cancel, chunks).await
    }

    /// Edit a user turn and stream a reply to the new text.
    pub async fn edit(
        &self,
        session_id: &SessionId,
        message_id: &NodeId,
        new_content: &str,
        cancel: &CancellationToken,
        chunks: Option<&mpsc::Sender<ReplyChunk>>,
    ) -> Result<ReplyOutcome, HistoryError> {
        let edited = self.engine.edit_message(session_id, message_id, new_content, None)?;
        let node_id = self.engine.create_pending_reply(session_id, Some(&edited))?;
        self.stream_reply(session_id, &node_id, cancel, chunks).await
    }

    /// Regenerate an assistant turn and stream the new sibling.
    pub async fn regenerate(
        &self,
        session_id: &SessionId,
        message_id: &NodeId,
        cancel: &CancellationToken,
        chunks: Option<&mpsc::Sender<ReplyChunk>>,
    ) -> Result<ReplyOutcome, HistoryError> {
        let node_id = self.engine.regenerate_reply(session_id, message_id, None)?;
        self.stream_reply(session_id, &node_id, cancel, chunks).await
    }

    /// Drive the generator for an existing pending node and resolve it.
    ///
    /// Generation trouble never surfaces as an error: it is recorded on the
    /// node as `failed`. Errors come only from the history itself, such as
    /// the node having been deleted mid-stream.
    #[instrument(skip(self, cancel, chunks), fields(session_id = %session_id, node_id = %node_id))]
    pub async fn stream_reply(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        cancel: &CancellationToken,
        chunks: Option<&mpsc::Sender<ReplyChunk>>,
    ) -> Result<ReplyOutcome, HistoryError> {
        let history = self.engine.reply_context(session_id, node_id)?;
        let deadline = Instant::now() + self.timeout;
        let mut buffer = String::new();

        let ending = self
            .drive(&history, node_id, &mut buffer, cancel, chunks, deadline)
            .await;

        let resolved = match ending {
            Ending::Done => {
                debug!(len = buffer.len(), "reply complete");
                self.engine.complete_reply(session_id, node_id, &buffer)
            }
            Ending::Failed(message) => {
                warn!(generator = self.generator.name(), error = %message, "reply failed");
                self.engine.fail_reply(session_id, node_id, &message)
            }
            Ending::Cancelled => {
                warn!(partial_len = buffer.len(), "reply cancelled");
                self.engine.fail_reply(session_id, node_id, &self.marked(&buffer))
            }
            Ending::TimedOut => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "reply timed out");
                self.engine.fail_reply(session_id, node_id, &self.marked(&buffer))
            }
        };

        match resolved {
            Ok(node) => Ok(node.into()),
            Err(err @ HistoryError::NotFound(_)) => {
                warn!(error = %err, "pending reply removed before it resolved");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn drive(
        &self,
        history: &[ChatTurn],
        node_id: &NodeId,
        buffer: &mut String,
        cancel: &CancellationToken,
        chunks: Option<&mpsc::Sender<ReplyChunk>>,
        deadline: Instant,
    ) -> Ending {
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ending::Cancelled,
            _ = &mut expiry => return Ending::TimedOut,
            started = self.generator.stream(history) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(err) => return Ending::Failed(err.to_string()),
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                _ = &mut expiry => return Ending::TimedOut,
                event = stream.next() => event,
            };
            match event {
                Some(ReplyEvent::Delta { text }) => {
                    buffer.push_str(&text);
                    if let Some(tx) = chunks {
                        let chunk = ReplyChunk {
                            node_id: node_id.clone(),
                            delta: text,
                        };
                        // A stalled reader must not hold off cancel or expiry.
                        // A dropped receiver only means nobody is watching.
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ending::Cancelled,
                            _ = &mut expiry => return Ending::TimedOut,
                            _ = tx.send(chunk) => {}
                        }
                    }
                }
                Some(ReplyEvent::Done) => return Ending::Done,
                Some(ReplyEvent::Error { message }) => return Ending::Failed(message),
                None => return Ending::Failed("reply stream ended before completion".to_string()),
            }
        }
    }

    fn marked(&self, partial: &str) -> String {
        if partial.is_empty() {
            self.cancel_marker.clone()
        } else {
            format!("{partial}\n{}", self.cancel_marker)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedGenerator, ScriptedReply};
    use forkchat_core::generator::GenerationError;
    use forkchat_core::Role;
    use forkchat_store::MemoryStore;

    fn streamer(replies: Vec<ScriptedReply>) -> (ReplyStreamer, Arc<ScriptedGenerator>, SessionId) {
        let engine = Arc::new(HistoryEngine::new(Arc::new(MemoryStore::new())));
        let session = engine.create_session("").unwrap();
        let generator = Arc::new(ScriptedGenerator::new(replies));
        let streamer = ReplyStreamer::new(engine, generator.clone()).with_timeout(Duration::from_secs(10));
        (streamer, generator, session.id)
    }

    #[tokio::test]
    async fn done_commits_buffer_and_forwards_chunks() {
        let (streamer, generator, session_id) = streamer(vec![ScriptedReply::words("hello there friend")]);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = streamer
            .send(&session_id, "Hi", &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(outcome.status, NodeStatus::Committed);
        assert_eq!(outcome.content, "hello there friend");
        let mut deltas = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!(chunk.node_id, outcome.node_id);
            deltas.push(chunk.delta);
        }
        assert_eq!(deltas, vec!["hello ", "there ", "friend"]);
        assert_eq!(generator.histories()[0], vec![ChatTurn::new(Role::User, "Hi")]);
    }

    #[tokio::test]
    async fn error_event_marks_failed() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::Events(vec![
            ReplyEvent::delta("partial"),
            ReplyEvent::Error {
                message: "overloaded".into(),
            },
        ])]);
        let outcome = streamer
            .send(&session_id, "Hi", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.content, "overloaded");
    }

    #[tokio::test]
    async fn startup_error_marks_failed() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::Fail(GenerationError::Unavailable(
            "no route".into(),
        ))]);
        let outcome = streamer
            .send(&session_id, "Hi", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.content.contains("no route"));
    }

    #[tokio::test]
    async fn stream_without_done_marks_failed() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::Events(vec![ReplyEvent::delta("cut")])]);
        let outcome = streamer
            .send(&session_id, "Hi", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn pre_cancelled_token_records_marker_only() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::words("never seen")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = streamer.send(&session_id, "Hi", &cancel, None).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.content, "[cancelled]");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_content() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::Stall(vec![ReplyEvent::delta("half")])]);
        let streamer = streamer.with_cancel_marker("[timed out]");
        let outcome = streamer
            .send(&session_id, "Hi", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.content, "half\n[timed out]");
    }

    #[tokio::test(start_paused = true)]
    async fn unread_chunk_channel_still_times_out() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::words("one two three four")]);
        let streamer = streamer.with_timeout(Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(1);
        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            streamer.send(&session_id, "Hi", &CancellationToken::new(), Some(&tx)),
        )
        .await
        .expect("reply resolves despite a full channel")
        .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.content, "one two \n[cancelled]");
    }

    #[tokio::test(start_paused = true)]
    async fn unread_chunk_channel_still_honours_cancel() {
        let (streamer, _, session_id) = streamer(vec![ScriptedReply::words("one two three")]);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(60), streamer.send(&session_id, "Hi", &cancel, Some(&tx)))
            .await
            .expect("cancel reaches a blocked send")
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.content.ends_with("[cancelled]"), "{}", outcome.content);
    }

    #[test]
    fn marker_formatting() {
        let (streamer, _, _) = streamer(vec![]);
        assert_eq!(streamer.marked(""), "[cancelled]");
        assert_eq!(streamer.marked("abc"), "abc\n[cancelled]");
    }
}
