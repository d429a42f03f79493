//! Wave Scheduler — runs a [`Plan`] to completion: snapshot, invoke, commit,
//! route, repeat. Also the ForEach Driver: static `run` targets with
//! `fanout: map` expand into one forward-run per item.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::ContextView;
use crate::journal::{Journal, JournalEntry, Snapshot};
use crate::memory::MemoryStore;
use crate::model::{Check, CheckId, CheckResult, EngineConfig, ScopePath, Severity};
use crate::provider::{CheckContext, EventEnvelope, ProviderRegistry};
use crate::resolver::Plan;
use crate::routing;
use crate::session::RunState;

/// One queued unit of work: a check to attempt under a specific scope and
/// event.
#[derive(Debug, Clone)]
struct WorkItem {
    check_id: CheckId,
    scope: ScopePath,
    event_name: String,
    event_payload: crate::model::OutputValue,
}

/// Runs every wave of `plan` to completion, honoring routing-driven forward
/// runs (same wave or later), WaveRetry requests into earlier waves, and
/// tag filtering. Returns every entry committed during the run.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    plan: &Plan,
    config: Arc<EngineConfig>,
    journal: Arc<Journal>,
    providers: Arc<ProviderRegistry>,
    memory: Arc<MemoryStore>,
    run_state: Arc<RunState>,
    initial_event: EventEnvelope,
    run_deadline: Option<Instant>,
) -> Vec<JournalEntry> {
    let semaphore = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
    let mut pending: Vec<VecDeque<WorkItem>> = plan
        .waves
        .iter()
        .map(|wave| {
            wave.iter()
                // A `fanout: map` consumer of a `for_each` parent only ever
                // runs per item, via that parent's routing forwards — seeding
                // it here too would additionally run it once, unfanned, at
                // root scope.
                .filter(|id| !is_foreach_fanout_consumer(id, &config))
                .map(|id| WorkItem {
                    check_id: id.clone(),
                    scope: ScopePath::root(),
                    event_name: initial_event.name.clone(),
                    event_payload: initial_event.payload.clone(),
                })
                .collect()
        })
        .collect();

    let mut committed = Vec::new();
    let mut wave_idx = 0usize;

    while wave_idx < pending.len() {
        if run_state.cancellation.is_cancelled() {
            break;
        }
        let items: Vec<WorkItem> = pending[wave_idx].drain(..).collect();
        if items.is_empty() {
            wave_idx += 1;
            continue;
        }

        let snapshot_cutoff = journal.begin_snapshot();
        let mut join_set = JoinSet::new();
        for item in items {
            let permit = semaphore.clone().acquire_owned();
            let config = config.clone();
            let journal = journal.clone();
            let providers = providers.clone();
            let memory = memory.clone();
            let run_state = run_state.clone();
            join_set.spawn(async move {
                let _permit = permit.await.expect("semaphore not closed during run");
                run_one(item, snapshot_cutoff, config, journal, providers, memory, run_state, run_deadline).await
            });
        }

        let mut forwards_this_pass = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok(Outcome { entry, forwards, item_entries }) = joined else {
                continue;
            };
            if let Some(entry) = entry {
                if config.fail_fast && entry_is_fatal(&entry) {
                    run_state.cancellation.cancel();
                }
                committed.push(entry);
            }
            committed.extend(item_entries);
            forwards_this_pass.extend(forwards);
        }

        // The dedup guard only needs to catch duplicate requests within this
        // pass (e.g. two sibling checks routing to the same target); a later
        // pass re-targeting the same (check, scope, wave) — a retry loop —
        // must still get through.
        run_state.begin_pass();
        for fwd in forwards_this_pass {
            let Some(target_wave) = plan.wave_of(&fwd.target) else {
                // Forward-run target outside this run's resolved closure
                // (e.g. a targeted partial run naming an unrelated check):
                // append a new trailing wave rather than drop it silently.
                pending.push(VecDeque::new());
                let new_idx = pending.len() - 1;
                if run_state.guard_forward_run(&fwd.target, &fwd.scope, new_idx) {
                    pending[new_idx].push_back(WorkItem {
                        check_id: fwd.target,
                        scope: fwd.scope,
                        event_name: fwd.event_override.unwrap_or_else(|| initial_event.name.clone()),
                        event_payload: initial_event.payload.clone(),
                    });
                }
                continue;
            };

            if run_state.guard_forward_run(&fwd.target, &fwd.scope, target_wave) {
                pending[target_wave].push_back(WorkItem {
                    check_id: fwd.target,
                    scope: fwd.scope,
                    event_name: fwd.event_override.unwrap_or_else(|| initial_event.name.clone()),
                    event_payload: initial_event.payload.clone(),
                });
                if target_wave < wave_idx {
                    wave_idx = target_wave;
                }
            }
        }

        if pending[wave_idx].is_empty() {
            wave_idx += 1;
        }
    }

    committed
}

/// True if `id` names a `fanout: map` check depending on a `for_each` parent
/// in `config` — such a check is scheduled exclusively through that parent's
/// per-item routing forwards, never through upfront wave-seeding.
fn is_foreach_fanout_consumer(id: &CheckId, config: &EngineConfig) -> bool {
    let Some(check) = config.checks.get(id) else {
        return false;
    };
    if check.fanout != crate::model::FanoutMode::Map {
        return false;
    }
    check.depends_on.iter().any(|dep| {
        dep.ids()
            .into_iter()
            .any(|parent_id| config.checks.get(parent_id).is_some_and(|p| p.for_each))
    })
}

fn entry_is_fatal(entry: &JournalEntry) -> bool {
    entry.result.error.is_some() || entry.result.worst_severity() == Some(Severity::Critical)
}

struct Outcome {
    entry: Option<JournalEntry>,
    forwards: Vec<routing::ForwardRunRequest>,
    /// Per-item journal entries committed for a `for_each` parent, one per
    /// fanned element — reported alongside the parent's own
    /// aggregate entry.
    item_entries: Vec<JournalEntry>,
}

async fn run_one(
    item: WorkItem,
    snapshot_cutoff: crate::journal::CommitId,
    config: Arc<EngineConfig>,
    journal: Arc<Journal>,
    providers: Arc<ProviderRegistry>,
    memory: Arc<MemoryStore>,
    run_state: Arc<RunState>,
    run_deadline: Option<Instant>,
) -> Outcome {
    let Some(check) = config.checks.get(&item.check_id) else {
        return Outcome { entry: None, forwards: Vec::new(), item_entries: Vec::new() };
    };

    // The active event always scopes leaf visibility; ancestor-prefix and latest-fallback entries stay visible
    // regardless, per ContextView's event-leaf policy.
    let snapshot = Snapshot {
        cutoff: snapshot_cutoff,
        scope: item.scope.clone(),
        event: Some(item.event_name.clone()),
    };
    let outputs = ContextView::new(journal.clone(), snapshot);

    if !is_eligible(check, &item, &outputs, &memory) {
        return Outcome { entry: None, forwards: Vec::new(), item_entries: Vec::new() };
    }

    let event = EventEnvelope {
        name: item.event_name.clone(),
        payload: item.event_payload.clone(),
    };

    let provider = match providers.get(&check.provider) {
        Some(p) => p,
        None => {
            run_state.record_invocation(&item.check_id, true);
            return Outcome { entry: None, forwards: Vec::new(), item_entries: Vec::new() };
        }
    };

    // Effective deadline is the earlier of the check's own timeout and
    // whatever remains of the run-level budget when this check starts; a
    // budget that has already elapsed collapses to a zero-length deadline,
    // which times the check out immediately rather than letting it run.
    let check_timeout_ms = check.timeout.map(|d| d.as_millis() as u64).unwrap_or(30_000);
    let deadline_ms = match run_deadline {
        Some(deadline) => {
            let remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
            check_timeout_ms.min(remaining_ms)
        }
        None => check_timeout_ms,
    };

    let ctx = CheckContext {
        check_id: item.check_id.clone(),
        scope: item.scope.clone(),
        event: event.clone(),
        inputs: outputs.clone(),
        memory: memory.clone(),
        config: check.payload.clone(),
        cancellation: run_state.cancellation.clone(),
        deadline_ms,
    };

    let mut result = crate::provider::invoke_with_deadline(provider, ctx).await;

    let success = routing::apply_fail_if(
        &mut result,
        check,
        config.fail_if.as_deref(),
        &outputs,
        &memory,
    );
    run_state.record_invocation(&item.check_id, !success);

    let outcome = routing::route(
        check,
        &item.scope,
        &mut result,
        success,
        &config,
        &event,
        &outputs,
        &memory,
        &run_state,
    );

    let entry = journal.commit(item.scope.clone(), item.check_id.clone(), item.event_name.clone(), result);

    // A forEach producer also gets one committed entry per item, scoped
    // under itself, so a fanout:map dependent's context view resolves the
    // single element by exact-scope match rather than the whole collection
    //.
    let item_entries = if entry.result.is_for_each {
        entry
            .result
            .for_each_items
            .iter()
            .flatten()
            .enumerate()
            .map(|(i, value)| {
                journal.commit(
                    item.scope.child(item.check_id.clone(), i),
                    item.check_id.clone(),
                    item.event_name.clone(),
                    CheckResult::ok(value.clone()),
                )
            })
            .collect()
    } else {
        Vec::new()
    };

    Outcome {
        entry: Some(entry),
        forwards: outcome.forwards,
        item_entries,
    }
}

fn is_eligible(check: &Check, item: &WorkItem, outputs: &ContextView, memory: &MemoryStore) -> bool {
    for dep in &check.depends_on {
        let satisfied = dep.ids().into_iter().any(|id| outputs.is_satisfied(id));
        if !satisfied {
            return false;
        }
    }

    if let Some(src) = &check.if_expr {
        let Ok(expr) = crate::sandbox::parse(src) else {
            return false;
        };
        let scope = crate::sandbox::SandboxScope {
            step: crate::model::OutputValue::Record(
                [("id".to_string(), crate::model::OutputValue::String(check.id.0.clone()))]
                    .into_iter()
                    .collect(),
            ),
            output: crate::model::OutputValue::Null,
            event: crate::model::OutputValue::Record(
                [
                    ("name".to_string(), crate::model::OutputValue::String(item.event_name.clone())),
                    ("payload".to_string(), item.event_payload.clone()),
                ]
                .into_iter()
                .collect(),
            ),
            outputs,
            memory,
            memory_namespace: "default",
        };
        if !expr.eval_bool(&scope) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{Check, CheckId, DepRef, FanoutMode, OutputValue, RoutingBlock};
    use crate::provider::{EchoProvider, ProviderRegistry};
    use crate::resolver;
    use std::collections::HashMap;

    fn echo_check(id: &str, deps: &[&str], payload: serde_json::Value) -> Check {
        Check {
            id: CheckId::from(id),
            provider: "echo".into(),
            depends_on: deps.iter().map(|d| DepRef::parse(d)).collect(),
            for_each: false,
            fanout: FanoutMode::Reduce,
            if_expr: None,
            fail_if: None,
            on_success: RoutingBlock::default(),
            on_fail: RoutingBlock::default(),
            on_finish: RoutingBlock::default(),
            schema: None,
            tags: vec![],
            group: None,
            timeout: None,
            retry: None,
            payload,
        }
    }

    #[tokio::test]
    async fn linear_chain_commits_both_checks_in_order() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), echo_check("a", &[], serde_json::json!(true)));
        checks.insert(CheckId::from("b"), echo_check("b", &["a"], serde_json::json!(true)));
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 4,
            fail_fast: false,
            memory: None,
        });
        let plan = resolver::resolve(&config.checks, &[]).unwrap();
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let providers = Arc::new(ProviderRegistry::new().register("echo", Arc::new(EchoProvider)));
        let memory = Arc::new(MemoryStore::in_memory());
        let run_state = Arc::new(RunState::new(uuid::Uuid::new_v4(), 10, false));

        let committed = execute(
            &plan,
            config,
            journal,
            providers,
            memory,
            run_state,
            EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
            None,
        )
        .await;

        assert_eq!(committed.len(), 2);
        assert!(committed.iter().all(|e| e.result.succeeded()));
        let a_idx = committed.iter().position(|e| e.check_id == CheckId::from("a")).unwrap();
        let b_idx = committed.iter().position(|e| e.check_id == CheckId::from("b")).unwrap();
        assert!(committed[a_idx].commit_id < committed[b_idx].commit_id);
    }

    #[tokio::test]
    async fn on_success_run_forwards_into_a_later_wave_target() {
        let mut checks = HashMap::new();
        let mut a = echo_check("a", &[], serde_json::json!(true));
        a.on_success = RoutingBlock {
            run: vec![CheckId::from("notify")],
            ..Default::default()
        };
        checks.insert(CheckId::from("a"), a);
        checks.insert(CheckId::from("notify"), echo_check("notify", &[], serde_json::json!("sent")));
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 4,
            fail_fast: false,
            memory: None,
        });
        let plan = resolver::resolve(&config.checks, &[CheckId::from("a")]).unwrap();
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let providers = Arc::new(ProviderRegistry::new().register("echo", Arc::new(EchoProvider)));
        let memory = Arc::new(MemoryStore::in_memory());
        let run_state = Arc::new(RunState::new(uuid::Uuid::new_v4(), 10, false));

        let committed = execute(
            &plan,
            config,
            journal,
            providers,
            memory,
            run_state,
            EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
            None,
        )
        .await;

        assert!(committed.iter().any(|e| e.check_id == CheckId::from("notify")));
    }

    #[tokio::test]
    async fn foreach_fanout_commits_one_item_entry_and_one_proc_entry_per_element_only() {
        let mut checks = HashMap::new();
        let mut list = echo_check("list", &[], serde_json::json!(["A", "B", "C"]));
        list.for_each = true;
        list.on_success = RoutingBlock {
            run: vec![CheckId::from("proc")],
            ..Default::default()
        };
        checks.insert(CheckId::from("list"), list);
        let mut proc = echo_check("proc", &["list"], serde_json::json!(true));
        proc.fanout = FanoutMode::Map;
        checks.insert(CheckId::from("proc"), proc);
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 4,
            fail_fast: false,
            memory: None,
        });
        let plan = resolver::resolve(&config.checks, &[]).unwrap();
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let providers = Arc::new(ProviderRegistry::new().register("echo", Arc::new(EchoProvider)));
        let memory = Arc::new(MemoryStore::in_memory());
        let run_state = Arc::new(RunState::new(uuid::Uuid::new_v4(), 10, false));

        let committed = execute(
            &plan,
            config,
            journal,
            providers,
            memory,
            run_state,
            EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
            None,
        )
        .await;

        let list_entries: Vec<_> = committed.iter().filter(|e| e.check_id == CheckId::from("list")).collect();
        let proc_entries: Vec<_> = committed.iter().filter(|e| e.check_id == CheckId::from("proc")).collect();
        assert_eq!(list_entries.len(), 4, "one aggregate entry plus one per item");
        assert_eq!(proc_entries.len(), 3, "proc must run exactly once per item, never also at root scope");
        let item_scopes: std::collections::HashSet<_> = proc_entries.iter().map(|e| e.scope.clone()).collect();
        assert_eq!(item_scopes.len(), 3, "each proc invocation ran under its own fanned scope");
    }

    #[tokio::test]
    async fn wave_siblings_share_a_snapshot_from_before_either_committed() {
        struct SiblingProbeProvider;
        #[async_trait::async_trait]
        impl crate::provider::Provider for SiblingProbeProvider {
            async fn invoke(&self, ctx: CheckContext) -> CheckResult {
                let sibling = if ctx.check_id == CheckId::from("x") { "y" } else { "x" };
                CheckResult::ok(OutputValue::Bool(ctx.inputs.get(&CheckId::from(sibling)).is_some()))
            }
        }

        let mut checks = HashMap::new();
        checks.insert(CheckId::from("p"), echo_check("p", &[], serde_json::json!(true)));
        checks.insert(CheckId::from("x"), echo_check("x", &["p"], serde_json::json!(true)));
        checks.insert(CheckId::from("y"), echo_check("y", &["p"], serde_json::json!(true)));
        for id in ["x", "y"] {
            checks.get_mut(&CheckId::from(id)).unwrap().provider = "probe".into();
        }
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 2,
            fail_fast: false,
            memory: None,
        });
        let plan = resolver::resolve(&config.checks, &[]).unwrap();
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let providers = Arc::new(
            ProviderRegistry::new()
                .register("echo", Arc::new(EchoProvider))
                .register("probe", Arc::new(SiblingProbeProvider)),
        );
        let memory = Arc::new(MemoryStore::in_memory());
        let run_state = Arc::new(RunState::new(uuid::Uuid::new_v4(), 10, false));

        let committed = execute(
            &plan,
            config,
            journal,
            providers,
            memory,
            run_state,
            EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
            None,
        )
        .await;

        for id in ["x", "y"] {
            let entry = committed.iter().find(|e| e.check_id == CheckId::from(id)).unwrap();
            assert_eq!(
                entry.result.output,
                Some(OutputValue::Bool(false)),
                "{id} must not observe its sibling committed within the same wave"
            );
        }
    }

    #[tokio::test]
    async fn an_exhausted_run_budget_times_out_a_check_regardless_of_its_own_longer_timeout() {
        struct SlowProvider;
        #[async_trait::async_trait]
        impl crate::provider::Provider for SlowProvider {
            async fn invoke(&self, _ctx: CheckContext) -> CheckResult {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                CheckResult::ok(OutputValue::Bool(true))
            }
        }

        let mut checks = HashMap::new();
        let mut slow = echo_check("slow", &[], serde_json::json!(true));
        slow.provider = "slow".into();
        slow.timeout = Some(std::time::Duration::from_secs(30));
        checks.insert(CheckId::from("slow"), slow);
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 4,
            fail_fast: false,
            memory: None,
        });
        let plan = resolver::resolve(&config.checks, &[]).unwrap();
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let providers = Arc::new(ProviderRegistry::new().register("slow", Arc::new(SlowProvider)));
        let memory = Arc::new(MemoryStore::in_memory());
        let run_state = Arc::new(RunState::new(uuid::Uuid::new_v4(), 10, false));

        let committed = execute(
            &plan,
            config,
            journal,
            providers,
            memory,
            run_state,
            EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
            Some(Instant::now()),
        )
        .await;

        let entry = committed.iter().find(|e| e.check_id == CheckId::from("slow")).unwrap();
        assert!(
            matches!(
                entry.result.error.as_ref().map(|e| e.kind),
                Some(crate::model::ErrorKind::Timeout)
            ),
            "an already-exhausted run budget must win over the check's own 30s timeout"
        );
    }
}
