//! Provider Gateway — the core's only point of contact with the outside
//! world within the execution path

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::context::ContextView;
use crate::memory::MemoryStore;
use crate::model::{CheckId, CheckResult, ErrorKind, OutputValue, ScopePath};

/// Event metadata surfaced under `event.*` in sandbox scopes
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// The event name, e.g. `"issue_comment"`
    pub name: String,
    /// Arbitrary event payload
    pub payload: OutputValue,
}

/// Everything a provider needs to execute one check invocation
pub struct CheckContext {
    /// The check being invoked
    pub check_id: CheckId,
    /// forEach scope this invocation runs under
    pub scope: ScopePath,
    /// Active event for this invocation
    pub event: EventEnvelope,
    /// Read-only view over prior outputs, frozen at the invocation's snapshot
    pub inputs: ContextView,
    /// Shared memory handle
    pub memory: Arc<MemoryStore>,
    /// The check's opaque provider-specific payload
    pub config: serde_json::Value,
    /// Cooperative cancellation handle
    pub cancellation: CancellationToken,
    /// Effective deadline for this invocation, in milliseconds
    pub deadline_ms: u64,
}

/// An external collaborator the engine calls as an opaque callable.
/// Implementations must not interpret routing or visibility — only return
/// a [`CheckResult`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute one check invocation, mapping any internal failure to
    /// `CheckResult { error: Some(..) }` rather than propagating it.
    async fn invoke(&self, ctx: CheckContext) -> CheckResult;
}

/// Maps provider tags (as named in `Check::provider`) to implementations
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `tag`
    pub fn register(mut self, tag: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(tag.into(), provider);
        self
    }

    /// Look up the provider for `tag`, if registered
    pub fn get(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(tag).cloned()
    }
}

/// Runs the check's `config.payload` (if it deserializes as a plain value)
/// straight through as its output. Useful as a deterministic stand-in for
/// seed scenarios and integration tests — concrete LLM/shell/HTTP providers
/// are out of scope.
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    async fn invoke(&self, ctx: CheckContext) -> CheckResult {
        let output: OutputValue = ctx.config.clone().into();
        match &output {
            OutputValue::List(items) => CheckResult::ok(output.clone()).with_for_each_items(items.clone()),
            _ => CheckResult::ok(output),
        }
    }
}

/// Evaluates `config.expr` (a sandbox expression) against the invocation's
/// own context and returns the result as `output`. Used to test
/// `fail_if` / routing without a real sandbox-consuming provider.
pub struct ScriptProvider;

#[async_trait]
impl Provider for ScriptProvider {
    async fn invoke(&self, ctx: CheckContext) -> CheckResult {
        let Some(expr_src) = ctx.config.get("expr").and_then(|v| v.as_str()) else {
            return CheckResult::error(ErrorKind::ProviderError, "ScriptProvider requires config.expr");
        };
        let expr = match crate::sandbox::parse(expr_src) {
            Ok(e) => e,
            Err(e) => return CheckResult::error(ErrorKind::ProviderError, e.to_string()),
        };
        let scope = crate::sandbox::SandboxScope {
            step: OutputValue::Record(
                [("id".to_string(), OutputValue::String(ctx.check_id.0.clone()))]
                    .into_iter()
                    .collect(),
            ),
            output: OutputValue::Null,
            event: ctx.event.payload.clone(),
            outputs: &ctx.inputs,
            memory: &ctx.memory,
            memory_namespace: "default",
        };
        match expr.eval(&scope) {
            Ok(value) => CheckResult::ok(value),
            Err(e) => CheckResult::error(ErrorKind::ProviderError, e.to_string()),
        }
    }
}

/// Runs `provider.invoke` under the invocation's deadline, mapping a
/// timeout or propagated cancellation to the matching [`ErrorKind`]
/// rather than letting either unwind.
pub async fn invoke_with_deadline(provider: Arc<dyn Provider>, ctx: CheckContext) -> CheckResult {
    let deadline = Duration::from_millis(ctx.deadline_ms);
    let cancellation = ctx.cancellation.clone();
    let check_id = ctx.check_id.clone();

    tokio::select! {
        result = tokio::time::timeout(deadline, provider.invoke(ctx)) => {
            match result {
                Ok(check_result) => check_result,
                Err(_) => CheckResult::error(ErrorKind::Timeout, format!("check {check_id} exceeded its deadline")),
            }
        }
        _ = cancellation.cancelled() => {
            CheckResult::error(ErrorKind::Cancelled, format!("check {check_id} was cancelled"))
        }
    }
}
