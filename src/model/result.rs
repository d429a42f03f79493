//! Per-check results, issues, and error info

use serde::{Deserialize, Serialize};

use super::value::OutputValue;

/// Severity of a reported [`Issue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational finding
    Info,
    /// Worth a look, not blocking
    Warning,
    /// A real problem with this check
    Error,
    /// Severe enough to trigger fail-fast
    Critical,
}

/// A user-facing finding attached to a check's result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identifier for the class of failure (e.g. `"<id>_fail_if"`)
    pub rule_id: String,
    /// How severe this finding is
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
    /// Optional grouping label (e.g. a check's `group` field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Issue {
    /// Construct a synthetic system-level issue (the `"<id>_fail_if"` /
    /// `"<id>/routing/loop_budget_exceeded"` family)
    pub fn synthetic(rule_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            group: None,
        }
    }
}

/// The kind of failure recorded on a [`CheckResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider returned/threw an error
    ProviderError,
    /// The check's effective deadline elapsed
    Timeout,
    /// The check was cooperatively cancelled
    Cancelled,
}

/// Structured error info carried on a [`CheckResult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Which failure kind occurred
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

/// The result of one check invocation, as returned by the Provider Gateway
/// and committed to the journal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckResult {
    /// User-facing findings
    pub issues: Vec<Issue>,
    /// The provider's structured return value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputValue>,
    /// The provider's rendered text, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Present iff this check's output is a collection to fan out over
    #[serde(skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Vec<OutputValue>>,
    /// True iff `for_each_items` is populated
    #[serde(default)]
    pub is_for_each: bool,
    /// Populated when the invocation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl CheckResult {
    /// A plain successful result carrying only an output value
    pub fn ok(output: OutputValue) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    /// An error result of the given kind
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorInfo {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    /// Whether this result represents success: no provider error, and no
    /// issue at `Severity::Error` or above.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.worst_severity().map_or(true, |s| s < Severity::Error)
    }

    /// Highest severity issue present, if any
    pub fn worst_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    /// Mark this result as a forEach producer, given its items
    pub fn with_for_each_items(mut self, items: Vec<OutputValue>) -> Self {
        self.is_for_each = true;
        self.for_each_items = Some(items);
        self
    }
}
