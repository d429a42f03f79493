//! `OutputValue` — the sum type backing `outputs` / `outputs_raw` / `outputs_history`
//!
//! Templates and routing expressions must consume a single, uniform shape
//! regardless of whether a provider returned a scalar, a list, or a
//! structured record.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A provider output value, normalized to a small closed set of shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    /// Absence of a value
    Null,
    /// A boolean
    Bool(bool),
    /// A number (integer or float; kept as f64 for uniform arithmetic)
    Number(f64),
    /// A string
    String(String),
    /// A homogeneous or heterogeneous list
    List(Vec<OutputValue>),
    /// A structured record (field order preserved for stable rendering)
    Record(IndexMap<String, OutputValue>),
}

impl OutputValue {
    /// Number of items if this is a [`OutputValue::List`]
    pub fn as_list(&self) -> Option<&[OutputValue]> {
        match self {
            OutputValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup if this is a [`OutputValue::Record`]
    pub fn get(&self, key: &str) -> Option<&OutputValue> {
        match self {
            OutputValue::Record(map) => map.get(key),
            _ => None,
        }
    }

    /// Truthiness per the sandbox's boolean coercion rules: `false`, `null`,
    /// `0`, `""`, and empty lists/records are falsy; everything else truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            OutputValue::Null => false,
            OutputValue::Bool(b) => *b,
            OutputValue::Number(n) => *n != 0.0,
            OutputValue::String(s) => !s.is_empty(),
            OutputValue::List(items) => !items.is_empty(),
            OutputValue::Record(map) => !map.is_empty(),
        }
    }
}

impl From<serde_json::Value> for OutputValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => OutputValue::Null,
            serde_json::Value::Bool(b) => OutputValue::Bool(b),
            serde_json::Value::Number(n) => OutputValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => OutputValue::String(s),
            serde_json::Value::Array(items) => {
                OutputValue::List(items.into_iter().map(OutputValue::from).collect())
            }
            serde_json::Value::Object(map) => OutputValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, OutputValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<OutputValue> for serde_json::Value {
    fn from(value: OutputValue) -> Self {
        match value {
            OutputValue::Null => serde_json::Value::Null,
            OutputValue::Bool(b) => serde_json::Value::Bool(b),
            OutputValue::Number(n) => serde_json::json!(n),
            OutputValue::String(s) => serde_json::Value::String(s),
            OutputValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            OutputValue::Record(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_array_round_trips_through_output_value() {
        let json = serde_json::json!(["A", "B", "C"]);
        let value = OutputValue::from(json.clone());
        assert_eq!(value.as_list().map(|l| l.len()), Some(3));
        let back: serde_json::Value = value.into();
        assert_eq!(back, json);
    }

    #[test]
    fn truthiness_matches_common_scripting_rules() {
        assert!(!OutputValue::Null.is_truthy());
        assert!(!OutputValue::Number(0.0).is_truthy());
        assert!(!OutputValue::String(String::new()).is_truthy());
        assert!(!OutputValue::List(vec![]).is_truthy());
        assert!(OutputValue::Number(1.0).is_truthy());
        assert!(OutputValue::String("x".into()).is_truthy());
    }
}
