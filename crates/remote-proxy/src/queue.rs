//! Serialized request queue for multi-step fetches.
//!
//! At most one entry is active against the remote service. The active entry is
//! an ordinary pending command with a stall deadline; the queue only decides
//! who goes next.

use crate::command::{CommandId, CompletionHandler, RemoteCommand, TimeoutPolicy};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A fetch request waiting for its turn. Immutable once enqueued.
pub struct QueueEntry {
    pub kind: String,
    pub command: RemoteCommand,
    pub handler: Arc<dyn CompletionHandler>,
}

pub(crate) struct Waiting {
    pub id: CommandId,
    pub entry: QueueEntry,
}

struct Active {
    id: CommandId,
    kind: String,
}

pub(crate) struct RequestQueue {
    waiting: VecDeque<Waiting>,
    active: Option<Active>,
    stall: Duration,
}

impl RequestQueue {
    pub fn new(stall: Duration) -> Self {
        Self {
            waiting: VecDeque::new(),
            active: None,
            stall,
        }
    }

    pub fn stall_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::Stall(self.stall)
    }

    /// Accept an entry. Hands it straight back when the queue is idle and the
    /// entry should be promoted now.
    pub fn push(&mut self, waiting: Waiting) -> Option<Waiting> {
        if self.is_empty() {
            return Some(waiting);
        }
        self.waiting.push_back(waiting);
        None
    }

    pub fn activate(&mut self, id: CommandId, kind: &str) {
        debug_assert!(self.active.is_none());
        self.active = Some(Active {
            id,
            kind: kind.to_string(),
        });
    }

    pub fn is_active(&self, id: CommandId) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == id)
    }

    pub fn active_kind(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.kind.as_str())
    }

    /// Retire the active entry after its terminal outcome and pop the next
    /// head, if any.
    pub fn finish(&mut self, id: CommandId) -> Option<Waiting> {
        if !self.is_active(id) {
            return None;
        }
        self.active = None;
        self.waiting.pop_front()
    }

    /// Remove every waiting entry, leaving the active one alone.
    pub fn clear_waiting(&mut self) -> Vec<Waiting> {
        self.waiting.drain(..).collect()
    }

    /// Forget the active entry and remove every waiting one.
    pub fn drain(&mut self) -> (Option<CommandId>, Vec<Waiting>) {
        let active = self.active.take().map(|active| active.id);
        (active, self.waiting.drain(..).collect())
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Waiting entries plus the active one.
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
