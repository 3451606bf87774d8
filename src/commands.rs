use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use forkchat_core::{NodeId, NodeStatus, SessionId};
use forkchat_engine::mock::EchoGenerator;
use forkchat_engine::{BranchNode, HistoryEngine, ReplyChunk, ReplyOutcome, ReplyStreamer};
use forkchat_settings::ForkchatSettings;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a session.
    New {
        /// System prompt stored on the root node.
        #[arg(long, default_value = "")]
        system: String,
    },
    /// List sessions, newest first.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Send a message and stream the reply.
    Send { session: SessionId, text: String },
    /// Fork a user message with new text and stream a reply to it.
    Edit {
        session: SessionId,
        message: NodeId,
        text: String,
    },
    /// Stream a new sibling for an assistant reply.
    Regenerate { session: SessionId, message: NodeId },
    /// Move the head to a node.
    Switch {
        session: SessionId,
        node: NodeId,
        /// Continue down to the newest leaf below the node.
        #[arg(long)]
        leaf: bool,
    },
    /// Delete a node and everything below it.
    Delete { session: SessionId, node: NodeId },
    /// Print the active conversation.
    Path { session: SessionId },
    /// Print the branch tree.
    Tree {
        session: SessionId,
        #[arg(long)]
        json: bool,
    },
    /// Search message content.
    Search {
        session: SessionId,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

pub async fn run(command: Command, engine: Arc<HistoryEngine>, settings: &ForkchatSettings) -> Result<()> {
    match command {
        Command::New { system } => {
            let session = engine.create_session(&system)?;
            println!("{}", session.id);
        }
        Command::Sessions { limit } => {
            for session in engine.list_sessions(limit, 0)? {
                println!(
                    "{}  head={}  v{}  {}",
                    session.id,
                    session.head_id,
                    session.version,
                    session.created_at.to_rfc3339()
                );
            }
        }
        Command::Send { session, text } => {
            let streamer = streamer(engine, settings);
            stream(|cancel, tx| async move { streamer.send(&session, &text, &cancel, Some(&tx)).await }).await?;
        }
        Command::Edit { session, message, text } => {
            let streamer = streamer(engine, settings);
            stream(|cancel, tx| async move { streamer.edit(&session, &message, &text, &cancel, Some(&tx)).await })
                .await?;
        }
        Command::Regenerate { session, message } => {
            let streamer = streamer(engine, settings);
            stream(|cancel, tx| async move { streamer.regenerate(&session, &message, &cancel, Some(&tx)).await })
                .await?;
        }
        Command::Switch { session, node, leaf } => {
            let moved = if leaf {
                engine.switch_branch_to_leaf(&session, &node, None)?
            } else {
                engine.switch_branch(&session, &node, None)?
            };
            println!("head={}", moved.head_id);
        }
        Command::Delete { session, node } => {
            let deleted = engine.delete_branch(&session, &node, None)?;
            println!("removed {} node(s), head={}", deleted.removed.len(), deleted.head_id);
        }
        Command::Path { session } => {
            for node in engine.resolve_active_path(&session)? {
                let status = match node.status {
                    NodeStatus::Committed => String::new(),
                    other => format!(" [{other}]"),
                };
                println!("{} {}{}: {}", node.id, node.role, status, node.content);
            }
        }
        Command::Tree { session, json } => {
            let tree = engine.build_tree(&session)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print!("{}", render_tree(&tree));
            }
        }
        Command::Search { session, query, limit } => {
            for node in engine.search(&session, &query, limit)? {
                println!("{} {}: {}", node.id, node.role, node.content);
            }
        }
    }
    Ok(())
}

fn streamer(engine: Arc<HistoryEngine>, settings: &ForkchatSettings) -> ReplyStreamer {
    ReplyStreamer::new(engine, Arc::new(EchoGenerator::default()))
        .with_timeout(Duration::from_millis(settings.generation.reply_timeout_ms))
        .with_cancel_marker(settings.generation.cancel_marker.clone())
}

/// Run one streamed reply, echoing deltas to stdout. Ctrl-C cancels the
/// reply; the node is kept as failed.
async fn stream<F, Fut>(start: F) -> Result<()>
where
    F: FnOnce(CancellationToken, mpsc::Sender<ReplyChunk>) -> Fut,
    Fut: std::future::Future<Output = Result<ReplyOutcome, forkchat_core::HistoryError>>,
{
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::channel::<ReplyChunk>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let _ = write!(stdout, "{}", chunk.delta);
            let _ = stdout.flush();
        }
    });

    let outcome = start(cancel, tx).await;
    ctrl_c.abort();
    printer.await.context("output task failed")?;
    let outcome = outcome?;

    println!();
    match outcome.status {
        NodeStatus::Committed => println!("{}", outcome.node_id),
        status => eprintln!("{} {status}: {}", outcome.node_id, outcome.content),
    }
    Ok(())
}

/// Indented outline, one node per line; `*` marks the active path.
fn render_tree(root: &BranchNode) -> String {
    let mut out = String::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        let marker = if node.is_active { '*' } else { ' ' };
        let status = match node.status {
            NodeStatus::Committed => String::new(),
            other => format!(" [{other}]"),
        };
        out.push_str(&format!(
            "{}{marker} {} {}{status}: {}\n",
            "  ".repeat(depth),
            node.role,
            node.id,
            node.content_preview
        ));
        stack.extend(node.children.iter().rev().map(|c| (c, depth + 1)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkchat_store::MemoryStore;

    #[test]
    fn rendered_tree_marks_active_path() {
        let engine = HistoryEngine::new(Arc::new(MemoryStore::new()));
        let session = engine.create_session("sys").unwrap();
        let reply = engine.send_message(&session.id, "hi", None).unwrap();
        let user = engine.get_node(&session.id, &reply).unwrap().parent_id.unwrap();
        engine.edit_message(&session.id, &user, "hello", None).unwrap();

        let text = render_tree(&engine.build_tree(&session.id).unwrap());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("* system"));
        assert!(lines[1].starts_with("    user"), "{}", lines[1]);
        assert!(lines[2].contains("[pending]"));
        assert!(lines[3].starts_with("  * user"));
        assert!(lines[3].ends_with(": hello"));
    }
}
