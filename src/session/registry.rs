use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::ConversationId;

/// Everything owned by one in-flight generation.
///
/// The cancel token is shared only with the session's background task and
/// its consumer stream; the consumer races every receive against it, so
/// cancelling also closes the output channel from the reader's side.
#[derive(Debug)]
pub struct GenerationHandle {
    pub conversation_id: ConversationId,
    /// Identity of this particular run.  A conversation id is reused across
    /// runs; the session id is not.
    pub session: Uuid,
    pub cancel: CancellationToken,
    pub task: Option<JoinHandle<()>>,
    pub started_at: DateTime<Utc>,
}

impl GenerationHandle {
    pub fn new(conversation_id: ConversationId, cancel: CancellationToken) -> Self {
        Self {
            conversation_id,
            session: Uuid::new_v4(),
            cancel,
            task: None,
            started_at: Utc::now(),
        }
    }
}

/// Read-only view of a registered session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub conversation_id: ConversationId,
    pub session: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// Map from conversation id to its active generation.
///
/// A single mutex guards the map and is held only for the map operation
/// itself, never across generation work or awaits.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConversationId, GenerationHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, GenerationHandle>> {
        // The map holds no invariants a panicking holder could break halfway.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` for its conversation.
    ///
    /// Any previous handle for the same id is cancelled and removed in the
    /// same critical section, then returned so the caller can finish
    /// releasing it.  Two handles for one id never coexist.
    pub fn register(&self, handle: GenerationHandle) -> Option<GenerationHandle> {
        let mut sessions = self.lock();
        let previous = sessions.remove(&handle.conversation_id);
        if let Some(ref prev) = previous {
            prev.cancel.cancel();
            debug!(
                conversation_id = prev.conversation_id,
                session = %prev.session,
                "replacing active generation"
            );
        }
        sessions.insert(handle.conversation_id, handle);
        previous
    }

    /// Store the background task of a registered session.
    ///
    /// Returns the task back when the session is no longer registered (it
    /// was stopped or replaced in the meantime); its token is already
    /// cancelled in that case.
    pub fn attach_task(
        &self,
        conversation_id: ConversationId,
        session: Uuid,
        task: JoinHandle<()>,
    ) -> std::result::Result<(), JoinHandle<()>> {
        let mut sessions = self.lock();
        match sessions.get_mut(&conversation_id) {
            Some(handle) if handle.session == session => {
                handle.task = Some(task);
                Ok(())
            }
            _ => Err(task),
        }
    }

    /// Remove whatever generation is registered for `conversation_id`.
    /// Removing an unknown id is a no-op.
    pub fn remove(&self, conversation_id: ConversationId) -> Option<GenerationHandle> {
        self.lock().remove(&conversation_id)
    }

    /// Remove the entry for `conversation_id` only if it still belongs to
    /// `session`.  A finished run must not tear down its replacement.
    pub fn remove_session(
        &self,
        conversation_id: ConversationId,
        session: Uuid,
    ) -> Option<GenerationHandle> {
        let mut sessions = self.lock();
        match sessions.get(&conversation_id) {
            Some(handle) if handle.session == session => sessions.remove(&conversation_id),
            _ => None,
        }
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<SessionInfo> {
        self.lock().get(&conversation_id).map(|h| SessionInfo {
            conversation_id: h.conversation_id,
            session: h.session,
            started_at: h.started_at,
            cancelled: h.cancel.is_cancelled(),
        })
    }

    #[cfg(test)]
    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.lock().contains_key(&conversation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Conversation ids with an active generation, in ascending order.
    pub fn active_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every registered session, ordered by conversation id.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.active_ids()
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }
}
