//! Session/Run State — the mutable state threaded through one run

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cancellation::CancellationToken;
use crate::model::{CheckId, ScopePath};

/// Per-check counters surfaced on the final report
#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    /// Number of times this check was invoked (including retries / reruns)
    pub invocations: u32,
    /// Number of invocations that committed a failing result
    pub failures: u32,
}

/// The mutable state shared by every concurrently-running task within one
/// run: the routing loop budget, dedup guards for forward-run requests, and
/// cooperative cancellation.
pub struct RunState {
    session_id: uuid::Uuid,
    routing_loop_count: AtomicU32,
    max_loops: u32,
    /// Dedups `(target, scope, wave)` so the same WaveRetry request isn't
    /// queued twice when multiple routing invocations target it.
    forward_run_guards: Mutex<HashSet<(CheckId, ScopePath, usize)>>,
    /// Cooperative cancellation, fired on fail-fast or run timeout
    pub cancellation: CancellationToken,
    pub stats: DashMap<CheckId, CheckStats>,
    pub fail_fast: bool,
}

impl RunState {
    /// A fresh run state for a new session
    pub fn new(session_id: uuid::Uuid, max_loops: u32, fail_fast: bool) -> Self {
        Self {
            session_id,
            routing_loop_count: AtomicU32::new(0),
            max_loops,
            forward_run_guards: Mutex::new(HashSet::new()),
            cancellation: CancellationToken::new(),
            stats: DashMap::new(),
            fail_fast,
        }
    }

    /// This run's session id
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Current count of routing-emitted forward runs this run
    pub fn routing_loop_count(&self) -> u32 {
        self.routing_loop_count.load(Ordering::SeqCst)
    }

    /// The configured ceiling on routing emissions
    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Record one routing-emitted forward run
    pub fn record_emission(&self) {
        self.routing_loop_count.fetch_add(1, Ordering::SeqCst);
    }

    /// True if `(target, scope, wave)` has not been requested before within
    /// the current pass — inserts it either way, so the first caller gets
    /// `true` and every later duplicate within the same pass gets `false`.
    /// Call [`Self::begin_pass`] between passes so a retry loop isn't
    /// deduped against its own earlier rounds.
    pub fn guard_forward_run(&self, target: &CheckId, scope: &ScopePath, wave: usize) -> bool {
        self.forward_run_guards
            .lock()
            .insert((target.clone(), scope.clone(), wave))
    }

    /// Clears the forward-run dedup set, starting a fresh pass. The guard
    /// only needs to catch duplicate requests emitted *within* one batch of
    /// routing results — a later pass re-targeting the same check (e.g. a
    /// retry loop) must be allowed through.
    pub fn begin_pass(&self) {
        self.forward_run_guards.lock().clear();
    }

    /// Record one invocation attempt for a check, and whether it failed
    pub fn record_invocation(&self, check_id: &CheckId, failed: bool) {
        let mut entry = self.stats.entry(check_id.clone()).or_default();
        entry.invocations += 1;
        if failed {
            entry.failures += 1;
        }
    }
}
