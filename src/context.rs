//! ContextView — scope-aware read API over the journal

use std::sync::Arc;

use crate::journal::{Journal, Snapshot};
use crate::model::{CheckId, CheckResult, OutputValue, ScopePath};

/// A scoped, read-only projection of the journal. Built once per check
/// invocation from a frozen `cutoff` and the check's `currentScope`; every
/// `get` / `get_raw` / `get_history` call resolves against that same
/// immutable view, which is what gives a wave's sibling checks snapshot
/// isolation from one another.
#[derive(Clone)]
pub struct ContextView {
    journal: Arc<Journal>,
    snapshot: Snapshot,
}

impl ContextView {
    /// Build a view over `journal` frozen at `snapshot.cutoff`, resolving
    /// relative to `snapshot.scope`
    pub fn new(journal: Arc<Journal>, snapshot: Snapshot) -> Self {
        Self { journal, snapshot }
    }

    /// The scope this view resolves relative to
    pub fn scope(&self) -> &ScopePath {
        &self.snapshot.scope
    }

    /// The frozen cutoff this view reads through
    pub fn cutoff(&self) -> crate::journal::CommitId {
        self.snapshot.cutoff
    }

    /// Resolution rules for `get(checkId)`:
    /// 1. exact-scope match ("per-item override")
    /// 2. else the longest strict-prefix ancestor ("ancestor inheritance")
    /// 3. else the latest visible entry ("default visibility")
    /// 4. else `None`
    pub fn get(&self, check_id: &CheckId) -> Option<OutputValue> {
        let visible = self.visible_entries(check_id);
        if visible.is_empty() {
            return None;
        }

        if let Some(exact) = visible.iter().find(|e| e.scope == *self.scope()) {
            return exact.result.output.clone();
        }

        let ancestor = visible
            .iter()
            .filter(|e| self.scope().has_strict_prefix(&e.scope))
            .max_by_key(|e| e.scope.depth());
        if let Some(entry) = ancestor {
            return entry.result.output.clone();
        }

        visible
            .iter()
            .max_by_key(|e| e.commit_id)
            .and_then(|e| e.result.output.clone())
    }

    /// Whether `check_id` has a visible entry under this view's resolution
    /// rules (same three tiers as [`Self::get`]) that itself succeeded.
    /// Dependency eligibility requires this, not mere presence: a
    /// `fail_if`-failed producer still has an `output`, but its dependents
    /// must not become eligible.
    pub fn is_satisfied(&self, check_id: &CheckId) -> bool {
        let visible = self.visible_entries(check_id);
        if visible.is_empty() {
            return false;
        }

        if let Some(exact) = visible.iter().find(|e| e.scope == *self.scope()) {
            return exact.result.succeeded();
        }

        let ancestor = visible
            .iter()
            .filter(|e| self.scope().has_strict_prefix(&e.scope))
            .max_by_key(|e| e.scope.depth());
        if let Some(entry) = ancestor {
            return entry.result.succeeded();
        }

        visible
            .iter()
            .max_by_key(|e| e.commit_id)
            .is_some_and(|e| e.result.succeeded())
    }

    /// The shallowest-scope visible entry for `checkId` — the aggregate
    /// parent value (e.g. the full forEach array), ignoring per-item
    /// overrides entirely
    pub fn get_raw(&self, check_id: &CheckId) -> Option<OutputValue> {
        self.visible_entries(check_id)
            .into_iter()
            .min_by_key(|e| e.scope.depth())
            .and_then(|e| e.result.output)
    }

    /// Every visible entry for `checkId`, in commit order
    pub fn get_history(&self, check_id: &CheckId) -> Vec<CheckResult> {
        let mut entries = self.visible_entries(check_id);
        entries.sort_by_key(|e| e.commit_id);
        entries.into_iter().map(|e| e.result).collect()
    }

    /// Entries visible under this snapshot's cutoff and event-leaf policy:
    /// an event filter only narrows the exact-scope ("leaf") candidates —
    /// ancestor-prefix and latest-fallback entries remain visible across a
    /// `goto_event` change.
    fn visible_entries(&self, check_id: &CheckId) -> Vec<crate::journal::JournalEntry> {
        let all = self
            .journal
            .read_visible(self.snapshot.cutoff, Some(check_id), None);
        match &self.snapshot.event {
            None => all,
            Some(event) => all
                .into_iter()
                .filter(|e| e.scope != *self.scope() || e.event == *event)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckResult;

    fn view_for(journal: Arc<Journal>, scope: ScopePath) -> ContextView {
        let cutoff = journal.begin_snapshot();
        ContextView::new(
            journal,
            Snapshot {
                cutoff,
                scope,
                event: None,
            },
        )
    }

    #[test]
    fn foreach_item_sees_element_raw_sees_whole_list() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let list = OutputValue::List(vec![
            OutputValue::String("A".into()),
            OutputValue::String("B".into()),
        ]);
        journal.commit(
            ScopePath::root(),
            CheckId::from("list"),
            "run".into(),
            CheckResult::ok(list.clone()),
        );
        let item_scope = ScopePath::root().child(CheckId::from("list"), 0);
        journal.commit(
            item_scope.clone(),
            CheckId::from("list"),
            "run".into(),
            CheckResult::ok(OutputValue::String("A".into())),
        );

        let view = view_for(journal, item_scope);
        assert_eq!(view.get(&CheckId::from("list")), Some(OutputValue::String("A".into())));
        assert_eq!(view.get_raw(&CheckId::from("list")), Some(list));
    }

    #[test]
    fn is_satisfied_is_false_for_a_fail_if_failed_dependency() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let mut result = CheckResult::ok(OutputValue::Record(
            [("error".to_string(), OutputValue::String("Missing".into()))].into_iter().collect(),
        ));
        result.issues.push(crate::model::Issue::synthetic(
            "p_fail_if",
            crate::model::Severity::Error,
            "fail_if evaluated truthy",
        ));
        journal.commit(ScopePath::root(), CheckId::from("p"), "run".into(), result);

        let view = view_for(journal, ScopePath::root());
        assert!(view.get(&CheckId::from("p")).is_some(), "output is still present");
        assert!(!view.is_satisfied(&CheckId::from("p")));
    }

    #[test]
    fn ancestor_inheritance_when_no_exact_scope_entry() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        journal.commit(
            ScopePath::root(),
            CheckId::from("p"),
            "run".into(),
            CheckResult::ok(OutputValue::String("root-val".into())),
        );
        let deep_scope = ScopePath::root()
            .child(CheckId::from("list"), 0)
            .child(CheckId::from("inner"), 2);
        let view = view_for(journal, deep_scope);
        assert_eq!(
            view.get(&CheckId::from("p")),
            Some(OutputValue::String("root-val".into()))
        );
    }
}
