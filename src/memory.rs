//! Memory Store — process-wide, namespaced key-value store
//!
//! The in-process store is a `DashMap` keyed by `(namespace, key)`. Ordering
//! is weak beyond `increment`, which is implemented via `DashMap::entry` so
//! concurrent callers converge on `initial + N*delta` regardless of
//! interleaving. Optional file-backed persistence
//! mirrors every mutation to disk with a write-to-temp-then-rename
//! discipline.

use dashmap::DashMap;
use indexmap::IndexMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::model::{MemoryFormat, OutputValue};

/// A process-wide, namespaced key-value store.
pub struct MemoryStore {
    data: DashMap<(String, String), OutputValue>,
    persistence: Option<Persistence>,
}

struct Persistence {
    path: PathBuf,
    format: MemoryFormat,
}

impl MemoryStore {
    /// A store with no persistence, torn down when the run ends
    pub fn in_memory() -> Self {
        Self {
            data: DashMap::new(),
            persistence: None,
        }
    }

    /// A store that mirrors every mutation to `path` in `format`, loading
    /// any existing content first.
    pub fn with_persistence(path: impl AsRef<Path>, format: MemoryFormat) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            data: DashMap::new(),
            persistence: Some(Persistence {
                path: path.clone(),
                format,
            }),
        };
        if path.exists() {
            store.load()?;
        }
        Ok(store)
    }

    /// `get(key, ns?)`
    pub fn get(&self, namespace: &str, key: &str) -> Option<OutputValue> {
        self.data.get(&(namespace.to_string(), key.to_string())).map(|v| v.clone())
    }

    /// `has(key, ns?)`
    pub fn has(&self, namespace: &str, key: &str) -> bool {
        self.data.contains_key(&(namespace.to_string(), key.to_string()))
    }

    /// `set(key, val, ns?)`
    pub fn set(&self, namespace: &str, key: &str, value: OutputValue) {
        self.data.insert((namespace.to_string(), key.to_string()), value);
        let _ = self.persist();
    }

    /// `increment(key, delta, ns?)` — atomic per-key read-modify-write,
    /// so `N` concurrent callers converge on `initial + N*delta`.
    pub fn increment(&self, namespace: &str, key: &str, delta: f64) -> f64 {
        let entry_key = (namespace.to_string(), key.to_string());
        let mut new_value = delta;
        self.data
            .entry(entry_key)
            .and_modify(|v| {
                let current = match v {
                    OutputValue::Number(n) => *n,
                    _ => 0.0,
                };
                new_value = current + delta;
                *v = OutputValue::Number(new_value);
            })
            .or_insert_with(|| OutputValue::Number(delta));
        let _ = self.persist();
        new_value
    }

    /// `append(key, val, ns?)` — pushes onto a list value, creating it if absent
    pub fn append(&self, namespace: &str, key: &str, value: OutputValue) {
        let entry_key = (namespace.to_string(), key.to_string());
        self.data
            .entry(entry_key)
            .and_modify(|v| {
                if let OutputValue::List(items) = v {
                    items.push(value.clone());
                } else {
                    *v = OutputValue::List(vec![value.clone()]);
                }
            })
            .or_insert_with(|| OutputValue::List(vec![value]));
        let _ = self.persist();
    }

    /// `clear(ns?)` — drops every key in `namespace`
    pub fn clear(&self, namespace: &str) {
        self.data.retain(|(ns, _), _| ns != namespace);
        let _ = self.persist();
    }

    /// `list(ns?)` — every key/value pair in `namespace`
    pub fn list(&self, namespace: &str) -> IndexMap<String, OutputValue> {
        self.data
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    fn persist(&self) -> EngineResult<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let tmp_path = p.path.with_extension("tmp");
        match p.format {
            MemoryFormat::Json => self.persist_json(&tmp_path)?,
            MemoryFormat::Csv => self.persist_csv(&tmp_path)?,
        }
        fs::rename(&tmp_path, &p.path)?;
        Ok(())
    }

    fn persist_json(&self, tmp_path: &Path) -> EngineResult<()> {
        let mut by_namespace: IndexMap<String, IndexMap<String, OutputValue>> = IndexMap::new();
        for entry in self.data.iter() {
            let (ns, key) = entry.key().clone();
            by_namespace
                .entry(ns)
                .or_default()
                .insert(key, entry.value().clone());
        }
        let json = serde_json::to_vec_pretty(&by_namespace)?;
        let mut file = fs::File::create(tmp_path)?;
        file.write_all(&json)?;
        Ok(())
    }

    fn persist_csv(&self, tmp_path: &Path) -> EngineResult<()> {
        let mut out = String::from("namespace,key,value\n");
        for entry in self.data.iter() {
            let (ns, key) = entry.key().clone();
            let json: serde_json::Value = entry.value().clone().into();
            let encoded = serde_json::to_string(&json)?;
            out.push_str(&format!("{ns},{key},{}\n", encoded.replace(',', "\\,")));
        }
        let mut file = fs::File::create(tmp_path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }

    fn load(&self) -> EngineResult<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let text = fs::read_to_string(&p.path)?;
        match p.format {
            MemoryFormat::Json => {
                let by_namespace: IndexMap<String, IndexMap<String, OutputValue>> =
                    serde_json::from_str(&text)?;
                for (ns, entries) in by_namespace {
                    for (key, value) in entries {
                        self.data.insert((ns.clone(), key), value);
                    }
                }
            }
            MemoryFormat::Csv => {
                for line in text.lines().skip(1) {
                    let mut parts = line.splitn(3, ',');
                    let (Some(ns), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
                        continue;
                    };
                    let unescaped = value.replace("\\,", ",");
                    let json: serde_json::Value = serde_json::from_str(&unescaped)
                        .map_err(|e| EngineError::Memory(format!("bad CSV value for {ns}/{key}: {e}")))?;
                    self.data.insert((ns.to_string(), key.to_string()), json.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_increment_converges_on_initial_plus_n_times_delta() {
        let store = Arc::new(MemoryStore::in_memory());
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    store.increment("default", "counter", 1.0);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("default", "counter"), Some(OutputValue::Number(50.0)));
    }

    #[test]
    fn json_persistence_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        {
            let store = MemoryStore::with_persistence(&path, MemoryFormat::Json).unwrap();
            store.set("default", "k", OutputValue::String("v".into()));
        }
        let reloaded = MemoryStore::with_persistence(&path, MemoryFormat::Json).unwrap();
        assert_eq!(reloaded.get("default", "k"), Some(OutputValue::String("v".into())));
    }

    #[test]
    fn append_creates_and_grows_a_list() {
        let store = MemoryStore::in_memory();
        store.append("default", "log", OutputValue::String("a".into()));
        store.append("default", "log", OutputValue::String("b".into()));
        assert_eq!(
            store.get("default", "log"),
            Some(OutputValue::List(vec![
                OutputValue::String("a".into()),
                OutputValue::String("b".into())
            ]))
        );
    }
}
