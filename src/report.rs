//! Result Aggregator — folds committed journal entries into a run report

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::journal::JournalEntry;
use crate::model::{CheckId, Issue};
use crate::session::{CheckStats, RunState};

/// One check's outcome as surfaced on the final report: its last committed
/// entry per scope, since a forEach parent and its per-item children each
/// get their own row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Which check this row is for
    pub check_id: CheckId,
    /// Scope this particular entry ran under
    pub scope: String,
    /// Whether the committed result succeeded
    pub succeeded: bool,
    /// Issues attached to this entry
    pub issues: Vec<Issue>,
}

/// The full outcome of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// The run this report describes
    pub session_id: uuid::Uuid,
    /// One row per committed entry, in commit order
    pub outcomes: Vec<CheckOutcome>,
    /// Every issue across every committed entry, worst severity first
    pub issues: Vec<Issue>,
    /// Overall run status: no committed entry errored or hit a critical issue
    pub success: bool,
    /// Total wall-clock time spent executing
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Per-check invocation/failure counters
    pub stats: HashMap<CheckId, CheckStatsView>,
}

/// Serializable mirror of [`CheckStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatsView {
    /// Total invocation attempts
    pub invocations: u32,
    /// Invocations that committed a failing result
    pub failures: u32,
}

impl From<&CheckStats> for CheckStatsView {
    fn from(s: &CheckStats) -> Self {
        Self {
            invocations: s.invocations,
            failures: s.failures,
        }
    }
}

/// Build the final report from every entry committed this run.
pub fn aggregate(session_id: uuid::Uuid, entries: &[JournalEntry], run_state: &RunState, elapsed: Duration) -> RunReport {
    let mut outcomes = Vec::with_capacity(entries.len());
    let mut issues = Vec::new();

    for entry in entries {
        outcomes.push(CheckOutcome {
            check_id: entry.check_id.clone(),
            scope: entry.scope.to_string(),
            succeeded: entry.result.succeeded(),
            issues: entry.result.issues.clone(),
        });
        issues.extend(entry.result.issues.iter().cloned());
    }
    issues.sort_by(|a, b| b.severity.cmp(&a.severity));

    let success = entries.iter().all(|e| e.result.succeeded());

    let stats = run_state
        .stats
        .iter()
        .map(|entry| (entry.key().clone(), CheckStatsView::from(entry.value())))
        .collect();

    RunReport {
        session_id,
        outcomes,
        issues,
        success,
        elapsed,
        stats,
    }
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_secs_f64() * 1000.0).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64((ms / 1000.0).max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::model::{CheckId, CheckResult, ErrorKind, OutputValue, ScopePath};

    #[test]
    fn aggregate_marks_run_failed_on_any_error_entry() {
        let journal = Journal::new(uuid::Uuid::new_v4());
        journal.commit(
            ScopePath::root(),
            CheckId::from("a"),
            "run".into(),
            CheckResult::ok(OutputValue::Bool(true)),
        );
        journal.commit(
            ScopePath::root(),
            CheckId::from("b"),
            "run".into(),
            CheckResult::error(ErrorKind::ProviderError, "boom"),
        );
        let cutoff = journal.begin_snapshot();
        let entries = journal.read_visible(cutoff, None, None);
        let run_state = RunState::new(journal.session_id(), 10, false);
        let report = aggregate(journal.session_id(), &entries, &run_state, Duration::from_secs(1));
        assert!(!report.success);
        assert_eq!(report.outcomes.len(), 2);
    }
}
