//! Routing Engine — evaluates fail_if/on_success/on_fail/on_finish and
//! schedules forward runs, enforcing the loop budget

use crate::context::ContextView;
use crate::memory::MemoryStore;
use crate::model::{
    Check, CheckId, CheckResult, EngineConfig, FanoutMode, Issue, RoutingBlock, ScopePath, Severity,
};
use crate::provider::EventEnvelope;
use crate::sandbox::{self, SandboxScope};
use crate::session::RunState;

/// One routing-emitted forward execution request
#[derive(Debug, Clone)]
pub struct ForwardRunRequest {
    /// The check to run next
    pub target: CheckId,
    /// Scope it should run under
    pub scope: ScopePath,
    /// If set, the target runs under this event name instead of the current one
    pub event_override: Option<String>,
}

/// The outcome of routing one committed check result
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    /// Forward executions to schedule
    pub forwards: Vec<ForwardRunRequest>,
}

/// Adjusts a freshly-invoked (not yet committed) [`CheckResult`] by
/// evaluating `fail_if` (check-level then global). Skipped when there is no
/// `output`, e.g. after a `Timeout`.
pub fn apply_fail_if(
    result: &mut CheckResult,
    check: &Check,
    global_fail_if: Option<&str>,
    outputs: &ContextView,
    memory: &MemoryStore,
) -> bool {
    let mut success = result.error.is_none();
    if result.output.is_none() {
        return success;
    }

    if let Some(expr_src) = &check.fail_if {
        if let Ok(expr) = sandbox::parse(expr_src) {
            let scope = step_scope(check, result, outputs, memory);
            if expr.eval_bool(&scope) {
                success = false;
                result.issues.push(Issue::synthetic(
                    format!("{}_fail_if", check.id),
                    Severity::Error,
                    "fail_if expression evaluated truthy",
                ));
            }
        }
    }

    if let Some(expr_src) = global_fail_if {
        if let Ok(expr) = sandbox::parse(expr_src) {
            let scope = step_scope(check, result, outputs, memory);
            if expr.eval_bool(&scope) {
                success = false;
                result.issues.push(Issue::synthetic(
                    "global_fail_if",
                    Severity::Error,
                    "global fail_if expression evaluated truthy",
                ));
            }
        }
    }

    success
}

fn step_scope<'a>(
    check: &Check,
    result: &CheckResult,
    outputs: &'a ContextView,
    memory: &'a MemoryStore,
) -> SandboxScope<'a> {
    SandboxScope {
        step: step_value(check),
        output: result.output.clone().unwrap_or(crate::model::OutputValue::Null),
        event: crate::model::OutputValue::Null,
        outputs,
        memory,
        memory_namespace: "default",
    }
}

fn step_value(check: &Check) -> crate::model::OutputValue {
    use crate::model::OutputValue;
    OutputValue::Record(
        [
            ("id".to_string(), OutputValue::String(check.id.0.clone())),
            (
                "group".to_string(),
                check
                    .group
                    .clone()
                    .map(OutputValue::String)
                    .unwrap_or(OutputValue::Null),
            ),
            (
                "tags".to_string(),
                OutputValue::List(check.tags.iter().cloned().map(OutputValue::String).collect()),
            ),
        ]
        .into_iter()
        .collect(),
    )
}

/// Runs the full routing step for one committed check result: selects
/// `on_success`/`on_fail`, conditionally applies `on_finish`, resolves
/// static and dynamic targets in order, and enforces the loop budget,
/// appending a synthetic issue to `result` and halting further emission
/// once it is exceeded.
#[allow(clippy::too_many_arguments)]
pub fn route(
    check: &Check,
    scope: &ScopePath,
    result: &mut CheckResult,
    success: bool,
    config: &EngineConfig,
    event: &EventEnvelope,
    outputs: &ContextView,
    memory: &MemoryStore,
    run_state: &RunState,
) -> RoutingOutcome {
    let mut forwards = Vec::new();
    let defaults = &config.routing.defaults;

    let primary = if success {
        check.on_success.merged_over(&defaults.on_success)
    } else {
        check.on_fail.merged_over(&defaults.on_fail)
    };
    emit_block(check, scope, &primary, config, event, outputs, memory, run_state, result, &mut forwards);

    if !check.on_finish.is_empty() && !has_foreach_dependents(check, config) {
        let on_finish = check.on_finish.merged_over(&defaults.on_finish);
        emit_block(check, scope, &on_finish, config, event, outputs, memory, run_state, result, &mut forwards);
    }

    RoutingOutcome { forwards }
}

/// True when some other check depends on `check` and consumes it via
/// `fanout: map` — in that case `on_finish` is left to the per-item forward
/// runs rather than firing once at the parent scope.
fn has_foreach_dependents(check: &Check, config: &EngineConfig) -> bool {
    if !check.for_each {
        return false;
    }
    config.checks.values().any(|other| {
        other.fanout == FanoutMode::Map
            && other
                .depends_on
                .iter()
                .any(|dep| dep.ids().into_iter().any(|id| *id == check.id))
    })
}

#[allow(clippy::too_many_arguments)]
fn emit_block(
    check: &Check,
    scope: &ScopePath,
    block: &RoutingBlock,
    config: &EngineConfig,
    event: &EventEnvelope,
    outputs: &ContextView,
    memory: &MemoryStore,
    run_state: &RunState,
    result: &mut CheckResult,
    forwards: &mut Vec<ForwardRunRequest>,
) {
    // Static `run` list first, each target's own fanout mode governs
    // whether it receives one forward-run per item or one at current scope.
    for target in &block.run {
        if budget_exceeded(check, run_state, result) {
            return;
        }
        let target_fanout = config.checks.get(target).map(|c| c.fanout).unwrap_or_default();
        if target_fanout == FanoutMode::Map && result.is_for_each {
            let items = result.for_each_items.clone().unwrap_or_default();
            for i in 0..items.len() {
                if budget_exceeded(check, run_state, result) {
                    return;
                }
                forwards.push(ForwardRunRequest {
                    target: target.clone(),
                    scope: scope.child(check.id.clone(), i),
                    event_override: block.goto_event.clone(),
                });
                run_state.record_emission();
            }
        } else {
            forwards.push(ForwardRunRequest {
                target: target.clone(),
                scope: scope.clone(),
                event_override: None,
            });
            run_state.record_emission();
        }
    }

    // Dynamic `run_js` — only worth a budget check if there's an expression to evaluate
    if let Some(src) = &block.run_js {
        if budget_exceeded(check, run_state, result) {
            return;
        }
        if let Ok(expr) = sandbox::parse(src) {
            let sandbox_scope = routing_scope(check, event, outputs, memory);
            for id in expr.eval_ids(&sandbox_scope) {
                if budget_exceeded(check, run_state, result) {
                    return;
                }
                forwards.push(ForwardRunRequest {
                    target: id,
                    scope: scope.clone(),
                    event_override: None,
                });
                run_state.record_emission();
            }
        }
    }

    // `goto` (static) then `goto_js` (dynamic) — only one jump target fires
    if (block.goto.is_some() || block.goto_js.is_some()) && budget_exceeded(check, run_state, result) {
        return;
    }
    let goto_target = block.goto.clone().or_else(|| {
        block.goto_js.as_ref().and_then(|src| {
            sandbox::parse(src)
                .ok()
                .map(|expr| expr.eval_id(&routing_scope(check, event, outputs, memory)))
                .flatten()
        })
    });
    if let Some(target) = goto_target {
        forwards.push(ForwardRunRequest {
            target,
            scope: scope.clone(),
            event_override: block.goto_event.clone(),
        });
        run_state.record_emission();
    }
}

fn routing_scope<'a>(
    check: &Check,
    event: &EventEnvelope,
    outputs: &'a ContextView,
    memory: &'a MemoryStore,
) -> SandboxScope<'a> {
    SandboxScope {
        step: step_value(check),
        output: crate::model::OutputValue::Null,
        event: event.payload.clone(),
        outputs,
        memory,
        memory_namespace: "default",
    }
}

/// Every emission increments `routing_loop_count`; once it exceeds
/// `max_loops` a single synthetic issue is appended and further emission
/// from this routing invocation stops.
fn budget_exceeded(check: &Check, run_state: &RunState, result: &mut CheckResult) -> bool {
    if run_state.routing_loop_count() < run_state.max_loops() {
        return false;
    }
    if !result
        .issues
        .iter()
        .any(|i| i.rule_id == format!("{}/routing/loop_budget_exceeded", check.id))
    {
        result.issues.push(Issue::synthetic(
            format!("{}/routing/loop_budget_exceeded", check.id),
            Severity::Critical,
            format!("routing loop budget ({}) exceeded", run_state.max_loops()),
        ));
    }
    true
}
