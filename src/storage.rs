use std::sync::atomic::{AtomicU64, Ordering};

use crate::rpc::message::Term;

/// Read-only view of the replicated log that elections need.
pub trait LogStore: Send + Sync {
    fn commit_index(&self) -> u64;

    fn last_commit_log_term(&self) -> Term;
}

/// In-memory log position; nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    commit_index: AtomicU64,
    last_commit_log_term: AtomicU64,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the commit position, e.g. when seeding a test node.
    pub fn set_commit(&self, index: u64, term: Term) {
        self.commit_index.store(index, Ordering::SeqCst);
        self.last_commit_log_term.store(term, Ordering::SeqCst);
    }
}

impl LogStore for MemoryLogStore {
    fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    fn last_commit_log_term(&self) -> Term {
        self.last_commit_log_term.load(Ordering::SeqCst)
    }
}
