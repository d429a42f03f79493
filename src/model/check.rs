//! Compile-time check nodes and routing blocks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a check, as written in the workflow config
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(pub String);

impl From<&str> for CheckId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CheckId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One dependency edge. `a|b` pipe-alternatives are soft: satisfied when
/// any named predecessor has committed, but the resolver still requires
/// at least one alternative to exist in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    /// A single required dependency
    Single(CheckId),
    /// `a|b` — whichever of these ran
    Alternatives(Vec<CheckId>),
}

impl DepRef {
    /// Parse a dependency reference from its config string form (`"a"` or `"a|b|c"`)
    pub fn parse(raw: &str) -> Self {
        if raw.contains('|') {
            DepRef::Alternatives(raw.split('|').map(|s| CheckId(s.trim().to_string())).collect())
        } else {
            DepRef::Single(CheckId(raw.trim().to_string()))
        }
    }

    /// All ids named by this edge, flattened
    pub fn ids(&self) -> Vec<&CheckId> {
        match self {
            DepRef::Single(id) => vec![id],
            DepRef::Alternatives(ids) => ids.iter().collect(),
        }
    }

    /// Render back to the `"a"` / `"a|b|c"` config string form
    pub fn to_raw(&self) -> String {
        self.ids()
            .iter()
            .map(|id| id.0.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl Serialize for DepRef {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_raw())
    }
}

impl<'de> Deserialize<'de> for DepRef {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(DepRef::parse(&raw))
    }
}

/// How a producer's collection output fans out to this check's
/// descendants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    /// One forward-run per item of the parent's `forEachItems`
    Map,
    /// A single run seeing the parent's whole output array (default)
    Reduce,
}

impl Default for FanoutMode {
    fn default() -> Self {
        FanoutMode::Reduce
    }
}

/// Retry policy for a single check (ambient — provider-level retry, distinct
/// from routing-driven `on_fail` re-scheduling)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum additional attempts after the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(with = "humantime_duration", default)]
    pub delay: Duration,
}

/// Declarative follow-up actions evaluated after a check's result commits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingBlock {
    /// Statically scheduled forward targets
    #[serde(default)]
    pub run: Vec<CheckId>,
    /// Expression yielding a dynamic list of target ids
    #[serde(default)]
    pub run_js: Option<String>,
    /// A single statically named jump target
    #[serde(default)]
    pub goto: Option<CheckId>,
    /// Expression yielding a single jump target id
    #[serde(default)]
    pub goto_js: Option<String>,
    /// If set, the jump target runs under this event name instead of the
    /// current one
    #[serde(default)]
    pub goto_event: Option<String>,
}

impl RoutingBlock {
    /// True if this block has nothing configured
    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
            && self.run_js.is_none()
            && self.goto.is_none()
            && self.goto_js.is_none()
    }

    /// Merge `self` over `defaults`: any field `self` leaves unset is taken
    /// from `defaults`. Lists merge by *replacing*, not appending.
    pub fn merged_over(&self, defaults: &RoutingBlock) -> RoutingBlock {
        RoutingBlock {
            run: if self.run.is_empty() { defaults.run.clone() } else { self.run.clone() },
            run_js: self.run_js.clone().or_else(|| defaults.run_js.clone()),
            goto: self.goto.clone().or_else(|| defaults.goto.clone()),
            goto_js: self.goto_js.clone().or_else(|| defaults.goto_js.clone()),
            goto_event: self.goto_event.clone().or_else(|| defaults.goto_event.clone()),
        }
    }
}

/// A named unit of work in the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    /// Unique id
    pub id: CheckId,
    /// Tag identifying which provider implementation executes this check
    pub provider: String,
    /// Input dependencies, including soft pipe-alternatives
    #[serde(default)]
    pub depends_on: Vec<DepRef>,
    /// Whether this check's output fans out into per-item descendant runs
    #[serde(default)]
    pub for_each: bool,
    /// How this check consumes a forEach parent's output
    #[serde(default)]
    pub fanout: FanoutMode,
    /// Boolean predicate gating eligibility
    #[serde(default)]
    pub if_expr: Option<String>,
    /// Boolean predicate that overrides `success := false` when truthy
    #[serde(default)]
    pub fail_if: Option<String>,
    /// Routing applied when the check succeeded
    #[serde(default)]
    pub on_success: RoutingBlock,
    /// Routing applied when the check failed
    #[serde(default)]
    pub on_fail: RoutingBlock,
    /// Routing always applied after commit, success or failure
    #[serde(default)]
    pub on_finish: RoutingBlock,
    /// Hint for the provider's result shape
    #[serde(default)]
    pub schema: Option<String>,
    /// Free-form labels used for `tagFilter`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional grouping label surfaced on issues
    #[serde(default)]
    pub group: Option<String>,
    /// Per-check timeout, bounded by the run-level timeout
    #[serde(with = "humantime_duration_opt", default)]
    pub timeout: Option<Duration>,
    /// Provider-level retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Opaque provider-specific payload (prompt, command, url, body template, …)
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Check {
    /// The block to apply given `success`, without defaults merged
    pub fn routing_for(&self, success: bool) -> &RoutingBlock {
        if success {
            &self.on_success
        } else {
            &self.on_fail
        }
    }
}

/// `humantime`-free duration (de)serialization via seconds, kept local so the
/// crate doesn't need a humantime dependency for this one concern.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_alternatives() {
        match DepRef::parse("a|b|c") {
            DepRef::Alternatives(ids) => assert_eq!(ids.len(), 3),
            _ => panic!("expected alternatives"),
        }
        match DepRef::parse("a") {
            DepRef::Single(id) => assert_eq!(id, CheckId::from("a")),
            _ => panic!("expected single"),
        }
    }

    #[test]
    fn routing_block_merge_prefers_self_then_defaults() {
        let defaults = RoutingBlock {
            run: vec![CheckId::from("notify")],
            ..Default::default()
        };
        let explicit = RoutingBlock {
            goto: Some(CheckId::from("retry_me")),
            ..Default::default()
        };
        let merged = explicit.merged_over(&defaults);
        assert_eq!(merged.run, vec![CheckId::from("notify")]);
        assert_eq!(merged.goto, Some(CheckId::from("retry_me")));
    }
}
