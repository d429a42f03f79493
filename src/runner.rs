//! The orchestrator entry point: resolves a config, runs every wave, and
//! aggregates the result.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument};

use crate::error::EngineResult;
use crate::journal::Journal;
use crate::memory::MemoryStore;
use crate::model::{CheckId, EngineConfig};
use crate::provider::{EventEnvelope, ProviderRegistry};
use crate::report::{self, RunReport};
use crate::resolver;
use crate::scheduler;
use crate::session::RunState;

/// Inputs to one run beyond the static config
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Restrict execution to the transitive closure of these checks; empty means "all"
    pub targets: Vec<CheckId>,
    /// Only run checks carrying at least one of these tags, if non-empty
    pub tag_filter: Option<Vec<String>>,
    /// Event driving this run
    pub event: EventEnvelope,
    /// Run-level budget: a check's effective deadline is the earlier of its
    /// own `timeout` and whatever remains of this budget when it starts.
    pub timeout_ms: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            tag_filter: None,
            event: EventEnvelope {
                name: "manual".to_string(),
                payload: crate::model::OutputValue::Null,
            },
            timeout_ms: None,
        }
    }
}

/// Resolve `config` into waves and execute them against `providers`,
/// returning the aggregated [`RunReport`]. `memory` is shared across the
/// whole run; callers own its lifetime (and, if persisted, its flush).
#[instrument(skip(config, providers, memory, options), fields(session_id))]
pub async fn run_checks(
    config: Arc<EngineConfig>,
    providers: Arc<ProviderRegistry>,
    memory: Arc<MemoryStore>,
    options: RunOptions,
) -> EngineResult<RunReport> {
    let session_id = uuid::Uuid::new_v4();
    tracing::Span::current().record("session_id", tracing::field::display(session_id));

    let targets = effective_targets(&config, &options);
    let plan = resolver::resolve(&config.checks, &targets)?;
    info!(waves = plan.waves.len(), "resolved execution plan");

    let journal = Arc::new(Journal::new(session_id));
    let run_state = Arc::new(RunState::new(session_id, config.routing.max_loops, config.fail_fast));

    let started = Instant::now();
    let run_deadline = options.timeout_ms.map(|ms| started + std::time::Duration::from_millis(ms));
    let entries = scheduler::execute(
        &plan,
        config,
        journal,
        providers,
        memory,
        run_state.clone(),
        options.event,
        run_deadline,
    )
    .await;
    let elapsed = started.elapsed();

    info!(committed = entries.len(), ?elapsed, "run complete");
    Ok(report::aggregate(session_id, &entries, &run_state, elapsed))
}

/// Folds `tag_filter` into the resolver's `targets` set: tag-matching checks
/// become the requested targets, so the resolver's transitive closure still
/// pulls in non-matching upstream dependencies rather than skipping them.
fn effective_targets(config: &EngineConfig, options: &RunOptions) -> Vec<CheckId> {
    if !options.targets.is_empty() {
        return options.targets.clone();
    }
    match &options.tag_filter {
        Some(tags) if !tags.is_empty() => config
            .checks
            .values()
            .filter(|c| c.tags.iter().any(|t| tags.contains(t)))
            .map(|c| c.id.clone())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Check, CheckId, DepRef, FanoutMode, OutputValue, RoutingBlock};
    use crate::provider::EchoProvider;
    use std::collections::HashMap;

    fn echo_check(id: &str, deps: &[&str]) -> Check {
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
            payload: serde_json::json!(true),
        }
    }

    #[tokio::test]
    async fn run_checks_reports_success_for_a_clean_linear_chain() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), echo_check("a", &[]));
        checks.insert(CheckId::from("b"), echo_check("b", &["a"]));
        let config = Arc::new(EngineConfig {
            version: 1,
            checks,
            routing: Default::default(),
            fail_if: None,
            max_parallelism: 4,
            fail_fast: false,
            memory: None,
        });
        let providers = Arc::new(ProviderRegistry::new().register("echo", Arc::new(EchoProvider)));
        let memory = Arc::new(crate::memory::MemoryStore::in_memory());

        let report = run_checks(
            config,
            providers,
            memory,
            RunOptions {
                targets: vec![],
                tag_filter: None,
                event: EventEnvelope { name: "manual".into(), payload: OutputValue::Null },
                timeout_ms: None,
            },
        )
        .await
        .unwrap();

        assert!(report.success);
        assert_eq!(report.outcomes.len(), 2);
    }
}
