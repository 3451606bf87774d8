pub mod errors;
pub mod generator;
pub mod ids;
pub mod messages;
pub mod snapshot;

pub use errors::HistoryError;
pub use ids::{NodeId, SessionId};
pub use messages::{MessageNode, NewNode, NodeStatus, Role, Session};
pub use snapshot::SessionSnapshot;
