//! The configuration surface, as a typed, validated model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::sandbox;

use super::check::{Check, CheckId, RoutingBlock};

/// `routing: { max_loops, defaults: { on_fail?, on_success?, on_finish? } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Maximum routing emissions per run before `LoopBudgetExceeded` fires
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Block-level defaults merged under each check's own routing blocks
    #[serde(default)]
    pub defaults: RoutingDefaults,
}

fn default_max_loops() -> u32 {
    10
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            defaults: RoutingDefaults::default(),
        }
    }
}

/// Default routing blocks applied under per-check overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDefaults {
    /// Default `on_fail` block
    #[serde(default)]
    pub on_fail: RoutingBlock,
    /// Default `on_success` block
    #[serde(default)]
    pub on_success: RoutingBlock,
    /// Default `on_finish` block
    #[serde(default)]
    pub on_finish: RoutingBlock,
}

/// Memory store persistence format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryFormat {
    /// Top-level object keyed by namespace -> {key -> value}
    Json,
    /// `namespace,key,value` rows with JSON-encoded complex values
    Csv,
}

/// `memory?: { namespace, persist, file?, format }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Default namespace new keys land in when none is specified
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Whether to persist to `file` across runs
    #[serde(default)]
    pub persist: bool,
    /// Path to the persisted file, required when `persist` is true
    #[serde(default)]
    pub file: Option<String>,
    /// Persistence format
    #[serde(default = "default_memory_format")]
    pub format: MemoryFormat,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_memory_format() -> MemoryFormat {
    MemoryFormat::Json
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            persist: false,
            file: None,
            format: default_memory_format(),
        }
    }
}

/// Top-level workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Config schema version, for forward compatibility
    pub version: u32,
    /// All checks in the workflow, keyed by id
    pub checks: HashMap<CheckId, Check>,
    /// Routing defaults and loop budget
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Global `fail_if`, evaluated against every committed result
    #[serde(default)]
    pub fail_if: Option<String>,
    /// Default concurrency bound, overridable per run
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Abort the run after the first critical issue or error entry
    #[serde(default)]
    pub fail_fast: bool,
    /// Memory store configuration
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
}

fn default_max_parallelism() -> usize {
    4
}

impl EngineConfig {
    /// Parse from a YAML document
    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation independent of any particular run's targets:
    /// every check's own id must match its map key, and every dependency
    /// and routing target must name a check that exists in this config
    /// (pipe-alternatives only require one alternative to resolve).
    pub fn validate(&self) -> EngineResult<()> {
        for (key, check) in &self.checks {
            if *key != check.id {
                return Err(EngineError::InvalidConfig(format!(
                    "check map key {key:?} does not match check id {:?}",
                    check.id
                )));
            }
            for dep in &check.depends_on {
                let ids = dep.ids();
                if !ids.iter().any(|id| self.checks.contains_key(*id)) {
                    return Err(EngineError::UnknownDep {
                        dep: ids
                            .iter()
                            .map(|i| i.0.clone())
                            .collect::<Vec<_>>()
                            .join("|"),
                        referrer: check.id.0.clone(),
                    });
                }
            }
            for block in [&check.on_success, &check.on_fail, &check.on_finish] {
                for target in &block.run {
                    if !self.checks.contains_key(target) {
                        return Err(EngineError::UnknownDep {
                            dep: target.0.clone(),
                            referrer: check.id.0.clone(),
                        });
                    }
                }
                if let Some(target) = &block.goto {
                    if !self.checks.contains_key(target) {
                        return Err(EngineError::UnknownDep {
                            dep: target.0.clone(),
                            referrer: check.id.0.clone(),
                        });
                    }
                }
            }

            if let Some(src) = &check.if_expr {
                validate_expr(src, &check.id, "if")?;
            }
            if let Some(src) = &check.fail_if {
                validate_expr(src, &check.id, "fail_if")?;
            }
            for (label, block) in [
                ("on_success", &check.on_success),
                ("on_fail", &check.on_fail),
                ("on_finish", &check.on_finish),
            ] {
                if let Some(src) = &block.run_js {
                    validate_expr(src, &check.id, &format!("{label}.run_js"))?;
                }
                if let Some(src) = &block.goto_js {
                    validate_expr(src, &check.id, &format!("{label}.goto_js"))?;
                }
            }
        }

        if let Some(src) = &self.fail_if {
            validate_expr(src, &CheckId::from("<global>"), "fail_if")?;
        }
        for (label, block) in [
            ("routing.defaults.on_success", &self.routing.defaults.on_success),
            ("routing.defaults.on_fail", &self.routing.defaults.on_fail),
            ("routing.defaults.on_finish", &self.routing.defaults.on_finish),
        ] {
            if let Some(src) = &block.run_js {
                validate_expr(src, &CheckId::from("<global>"), &format!("{label}.run_js"))?;
            }
            if let Some(src) = &block.goto_js {
                validate_expr(src, &CheckId::from("<global>"), &format!("{label}.goto_js"))?;
            }
        }

        Ok(())
    }
}

/// Rejects a malformed expression at config-load time instead of letting it
/// fall through to the sandbox's lazy per-evaluation default. Fatal: this
/// aborts the run before any check executes.
fn validate_expr(src: &str, check_id: &CheckId, field: &str) -> EngineResult<()> {
    sandbox::parse(src).map(|_| ()).map_err(|e| {
        EngineError::InvalidConfig(format!("check {check_id} has an invalid {field} expression: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
version: 1
checks:
  b:
    id: b
    provider: echo
    depends_on: ["a"]
"#;
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDep { .. }));
    }

    #[test]
    fn rejects_a_malformed_if_expression_at_load_time() {
        let yaml = r#"
version: 1
checks:
  a:
    id: a
    provider: echo
    if_expr: "outputs.b..."
"#;
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn accepts_pipe_alternative_when_one_exists() {
        let yaml = r#"
version: 1
checks:
  a:
    id: a
    provider: echo
  c:
    id: c
    provider: echo
    depends_on: ["a|missing"]
"#;
        EngineConfig::from_yaml(yaml).expect("alternative should resolve against existing a");
    }
}
