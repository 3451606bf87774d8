use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use forkchat_core::SessionId;

/// Per-session write lock. Writers for one session queue behind the same
/// mutex; writers for different sessions never touch each other's entry.
#[derive(Default)]
pub(crate) struct SessionLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub(crate) fn get(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry for a session id that turned out not to exist. An
    /// entry someone else is waiting on stays; `held` is the caller's handle.
    pub(crate) fn discard(&self, session_id: &SessionId, held: &Arc<Mutex<()>>) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) <= 2);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
