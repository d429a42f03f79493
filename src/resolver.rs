//! Dependency Resolver — topological levelling into parallel waves

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, EngineResult};
use crate::model::{Check, CheckId, DepRef};

/// A plan: an ordered sequence of waves, each a set of check ids whose
/// dependencies all appear in earlier waves.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Waves in execution order
    pub waves: Vec<Vec<CheckId>>,
}

impl Plan {
    /// Which wave index a check is scheduled into, if any
    pub fn wave_of(&self, id: &CheckId) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(id))
    }
}

/// Resolve `checks` into parallel waves, restricted to the transitive
/// dependency closure of `targets` (empty `targets` means "all").
///
/// Uses Kahn's algorithm: compute in-degrees over the closure, emit the
/// zero-in-degree frontier as a wave, decrement neighbours, repeat.
/// Within a wave, ids are sorted for determinism.
pub fn resolve(checks: &HashMap<CheckId, Check>, targets: &[CheckId]) -> EngineResult<Plan> {
    let closure = transitive_closure(checks, targets)?;

    let mut in_degree: HashMap<CheckId, usize> = closure.iter().map(|id| (id.clone(), 0)).collect();
    // edges[dep] = checks that depend on `dep`
    let mut dependents: HashMap<CheckId, Vec<CheckId>> =
        closure.iter().map(|id| (id.clone(), Vec::new())).collect();

    for id in &closure {
        let check = checks
            .get(id)
            .ok_or_else(|| EngineError::Internal(format!("closure referenced unknown check {id}")))?;
        for dep in &check.depends_on {
            let satisfied_by_closure = dep.ids().into_iter().filter(|d| closure.contains(*d)).count();
            if satisfied_by_closure == 0 {
                return Err(EngineError::UnknownDep {
                    dep: dep.to_raw(),
                    referrer: id.0.clone(),
                });
            }
            // Only the first in-closure alternative gates levelling; soft
            // pipe-alternatives are re-checked against the journal at
            // evaluation time, not here.
            if let Some(first) = dep.ids().into_iter().find(|d| closure.contains(*d)) {
                *in_degree.get_mut(id).expect("id in closure") += 1;
                dependents
                    .get_mut(first)
                    .expect("dep in closure")
                    .push(id.clone());
            }
        }
    }

    let mut waves = Vec::new();
    let mut remaining = in_degree.clone();
    let mut scheduled: HashSet<CheckId> = HashSet::new();

    while scheduled.len() < closure.len() {
        let mut frontier: Vec<CheckId> = remaining
            .iter()
            .filter(|(id, &deg)| deg == 0 && !scheduled.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        if frontier.is_empty() {
            let stuck: Vec<String> = closure
                .iter()
                .filter(|id| !scheduled.contains(*id))
                .map(|id| id.0.clone())
                .collect();
            return Err(EngineError::Cycle(stuck.join(" -> ")));
        }

        frontier.sort();
        for id in &frontier {
            scheduled.insert(id.clone());
            for dependent in &dependents[id] {
                *remaining.get_mut(dependent).expect("dependent in closure") -= 1;
            }
        }
        waves.push(frontier);
    }

    Ok(Plan { waves })
}

/// All checks reachable by walking `depends_on` backwards from `targets`
/// (i.e. targets plus every (transitive) dependency they need).
fn transitive_closure(
    checks: &HashMap<CheckId, Check>,
    targets: &[CheckId],
) -> EngineResult<HashSet<CheckId>> {
    let roots: Vec<CheckId> = if targets.is_empty() {
        checks.keys().cloned().collect()
    } else {
        targets.to_vec()
    };

    let mut seen: HashSet<CheckId> = HashSet::new();
    let mut queue: VecDeque<CheckId> = VecDeque::new();

    for root in roots {
        if !checks.contains_key(&root) {
            return Err(EngineError::UnknownDep {
                dep: root.0.clone(),
                referrer: "<run targets>".to_string(),
            });
        }
        if seen.insert(root.clone()) {
            queue.push_back(root);
        }
    }

    while let Some(id) = queue.pop_front() {
        let check = checks
            .get(&id)
            .ok_or_else(|| EngineError::Internal(format!("dangling check id {id} in queue")))?;
        for dep in &check.depends_on {
            for dep_id in dep.ids() {
                if checks.contains_key(dep_id) && seen.insert(dep_id.clone()) {
                    queue.push_back(dep_id.clone());
                }
            }
        }
    }

    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Check;

    fn check(id: &str, deps: &[&str]) -> Check {
        Check {
            id: CheckId::from(id),
            provider: "echo".into(),
            depends_on: deps.iter().map(|d| DepRef::parse(d)).collect(),
            for_each: false,
            fanout: Default::default(),
            if_expr: None,
            fail_if: None,
            on_success: Default::default(),
            on_fail: Default::default(),
            on_finish: Default::default(),
            schema: None,
            tags: vec![],
            group: None,
            timeout: None,
            retry: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn linear_chain_levels_into_two_waves() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), check("a", &[]));
        checks.insert(CheckId::from("b"), check("b", &["a"]));
        let plan = resolve(&checks, &[]).unwrap();
        assert_eq!(plan.waves, vec![vec![CheckId::from("a")], vec![CheckId::from("b")]]);
    }

    #[test]
    fn detects_cycles() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), check("a", &["b"]));
        checks.insert(CheckId::from("b"), check("b", &["a"]));
        let err = resolve(&checks, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Cycle(_)));
    }

    #[test]
    fn pipe_alternative_resolves_against_either_branch() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), check("a", &[]));
        checks.insert(CheckId::from("b"), check("b", &[]));
        checks.insert(CheckId::from("c"), check("c", &["a|b"]));
        let plan = resolve(&checks, &[]).unwrap();
        assert_eq!(plan.waves[0].len(), 2);
        assert_eq!(plan.waves[1], vec![CheckId::from("c")]);
    }

    #[test]
    fn targets_restrict_to_transitive_dependency_closure() {
        let mut checks = HashMap::new();
        checks.insert(CheckId::from("a"), check("a", &[]));
        checks.insert(CheckId::from("b"), check("b", &["a"]));
        checks.insert(CheckId::from("unrelated"), check("unrelated", &[]));
        let plan = resolve(&checks, &[CheckId::from("b")]).unwrap();
        let all: Vec<_> = plan.waves.into_iter().flatten().collect();
        assert!(!all.contains(&CheckId::from("unrelated")));
        assert!(all.contains(&CheckId::from("a")));
        assert!(all.contains(&CheckId::from("b")));
    }
}
