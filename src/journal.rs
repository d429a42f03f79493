//! Execution Journal — append-only, MVCC-style results store
//!
//! The journal is the single shared write target during a wave. `commit`
//! is the linearization point: it atomically assigns the next commit id
//! and appends. Readers snapshot a cutoff id under the same lock and
//! thereafter read an immutable prefix.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{CheckId, CheckResult, ScopePath};

/// Strictly monotonic per-session commit id
pub type CommitId = u64;

/// One append-only record in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing commit id, assigned at commit time
    pub commit_id: CommitId,
    /// The run this entry belongs to
    pub session_id: uuid::Uuid,
    /// forEach scope this entry was produced under
    pub scope: ScopePath,
    /// Which check produced this entry
    pub check_id: CheckId,
    /// The event name active when the provider was invoked
    pub event: String,
    /// The committed result
    pub result: CheckResult,
    /// Wall-clock commit time, for reporting only (never used for ordering)
    pub committed_at: DateTime<Utc>,
}

/// A commit-id cutoff plus optional scope/event filter, defining a
/// consistent read view
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Entries with `commit_id > cutoff` are invisible
    pub cutoff: CommitId,
    /// The scope evaluating under this snapshot, for [`crate::context::ContextView`]
    pub scope: ScopePath,
    /// If set, restricts visibility per the `goto_event` leaf-filtering
    /// policy
    pub event: Option<String>,
}

/// Append-only, MVCC-style journal of committed check results.
///
/// Indexed by `(check_id)` via a secondary `DashMap` of entry offsets. A
/// multi-session deployment would index by `(session_id, check_id)` for
/// sub-linear reads; this journal is single-session, so the index key is
/// just `check_id`.
pub struct Journal {
    session_id: uuid::Uuid,
    entries: RwLock<Vec<JournalEntry>>,
    index: DashMap<CheckId, Vec<usize>>,
    next_commit: AtomicU64,
}

impl Journal {
    /// Create an empty journal for a new run
    pub fn new(session_id: uuid::Uuid) -> Self {
        Self {
            session_id,
            entries: RwLock::new(Vec::new()),
            index: DashMap::new(),
            next_commit: AtomicU64::new(1),
        }
    }

    /// The session this journal belongs to
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Current max commit id, usable as a fresh snapshot cutoff
    pub fn begin_snapshot(&self) -> CommitId {
        self.next_commit.load(Ordering::SeqCst) - 1
    }

    /// Atomically assign the next commit id and append `entry`
    pub fn commit(
        &self,
        scope: ScopePath,
        check_id: CheckId,
        event: String,
        result: CheckResult,
    ) -> JournalEntry {
        let mut entries = self.entries.write();
        let commit_id = self.next_commit.fetch_add(1, Ordering::SeqCst);
        let entry = JournalEntry {
            commit_id,
            session_id: self.session_id,
            scope,
            check_id: check_id.clone(),
            event,
            result,
            committed_at: Utc::now(),
        };
        let offset = entries.len();
        entries.push(entry.clone());
        self.index.entry(check_id).or_default().push(offset);
        entry
    }

    /// Every entry with `commit_id <= cutoff`, optionally restricted to one
    /// check id and/or to a matching event name
    pub fn read_visible(
        &self,
        cutoff: CommitId,
        check_id: Option<&CheckId>,
        event: Option<&str>,
    ) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        match check_id {
            Some(id) => {
                let Some(offsets) = self.index.get(id) else {
                    return Vec::new();
                };
                offsets
                    .iter()
                    .filter_map(|&i| entries.get(i))
                    .filter(|e| e.commit_id <= cutoff)
                    .filter(|e| event.map(|ev| e.event == ev).unwrap_or(true))
                    .cloned()
                    .collect()
            }
            None => entries
                .iter()
                .filter(|e| e.commit_id <= cutoff)
                .filter(|e| event.map(|ev| e.event == ev).unwrap_or(true))
                .cloned()
                .collect(),
        }
    }

    /// All committed entries for `check_id`, unfiltered by scope, in commit
    /// order (used by [`crate::context::ContextView::get_history`])
    pub fn history(&self, cutoff: CommitId, check_id: &CheckId) -> Vec<JournalEntry> {
        self.read_visible(cutoff, Some(check_id), None)
    }

    /// Total number of committed entries (diagnostic / test helper)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing has been committed yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
