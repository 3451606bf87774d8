//! Branch-aware conversation history: path resolution, tree projection,
//! head-moving mutations, and the streamed reply pipeline.

pub mod generation;
mod locks;
pub mod mock;
pub mod mutations;
pub mod resolver;
pub mod tree;

pub use generation::{ReplyChunk, ReplyOutcome, ReplyStreamer};
pub use mutations::{DeletedBranch, HistoryEngine};
pub use resolver::SiblingInfo;
pub use tree::{BranchNode, DEFAULT_PREVIEW_CHARS};
