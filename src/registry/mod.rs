//! Record registry: identity assignment, lookup and lineage.
//!
//! The registry hands out sequential ordinals, refuses lineage references to
//! records it does not know, and answers ancestry queries over the
//! `builds_on` graph. Records may build on several ancestors, so lineage is a
//! DAG walked breadth-first.

mod persistence;

pub use persistence::RecordStore;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tracing::{debug, info};

use crate::error::{Result, SpecError};
use crate::record::{
    validate_slug, MutationOutcome, Priority, RecordMutation, SpecId, SpecStatus,
    SpecificationRecord,
};

/// In-memory set of records keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    records: BTreeMap<SpecId, SpecificationRecord>,
}

impl SpecRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ordinal the next record will get.
    #[must_use]
    pub fn next_ordinal(&self) -> u32 {
        self.records.keys().map(SpecId::ordinal).max().unwrap_or(0) + 1
    }

    /// Register a new draft.
    ///
    /// # Errors
    ///
    /// - [`SpecError::Validation`] for a bad or already used slug
    /// - [`SpecError::NotFound`] if any `builds_on` id is unknown
    pub fn create(
        &mut self,
        slug: &str,
        description: impl Into<String>,
        priority: Priority,
        builds_on: Vec<SpecId>,
    ) -> Result<SpecId> {
        validate_slug(slug)?;
        if self.records.keys().any(|id| id.slug() == slug) {
            return Err(SpecError::validation(format!(
                "A record with slug '{slug}' already exists"
            )));
        }
        for ancestor in &builds_on {
            if !self.records.contains_key(ancestor) {
                return Err(SpecError::not_found("record", ancestor));
            }
        }

        let id = SpecId::new(self.next_ordinal(), slug)?;
        let record = SpecificationRecord::new(id.clone(), description)
            .with_priority(priority)
            .with_builds_on(builds_on);
        let ancestors: Vec<String> = record.builds_on.iter().map(ToString::to_string).collect();
        info!(spec = %id, builds_on = ?ancestors, "Created record");
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    /// Register a draft that builds on a completed `parent`.
    ///
    /// This is the recourse for changing frozen work.
    ///
    /// # Errors
    ///
    /// - [`SpecError::NotFound`] if `parent` is unknown
    /// - [`SpecError::InvalidTransition`] if `parent` is not Completed
    /// - anything [`SpecRegistry::create`] returns
    pub fn create_successor(
        &mut self,
        parent: &SpecId,
        slug: &str,
        description: impl Into<String>,
    ) -> Result<SpecId> {
        let parent_record = self.get(parent)?;
        if parent_record.status != SpecStatus::Completed {
            return Err(SpecError::invalid_transition(
                parent_record.status,
                "build a successor",
            ));
        }
        let priority = parent_record.priority;
        self.create(slug, description, priority, vec![parent.clone()])
    }

    /// Look up a record.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] for an unknown id.
    pub fn get(&self, id: &SpecId) -> Result<&SpecificationRecord> {
        self.records
            .get(id)
            .ok_or_else(|| SpecError::not_found("record", id))
    }

    /// Look up a record mutably. Callers outside the crate go through
    /// [`SpecRegistry::apply`] so the immutability enforcer sees every write.
    pub(crate) fn get_mut(&mut self, id: &SpecId) -> Result<&mut SpecificationRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| SpecError::not_found("record", id))
    }

    /// Find a record from user input: `007-add-login`, `7`, `007` or `add-login`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if nothing matches.
    pub fn resolve(&self, reference: &str) -> Result<SpecId> {
        let reference = reference.trim();
        if let Ok(id) = reference.parse::<SpecId>() {
            if self.records.contains_key(&id) {
                return Ok(id);
            }
        }
        if let Ok(ordinal) = reference.parse::<u32>() {
            if let Some(id) = self.records.keys().find(|id| id.ordinal() == ordinal) {
                return Ok(id.clone());
            }
        }
        self.records
            .keys()
            .find(|id| id.slug() == reference)
            .cloned()
            .ok_or_else(|| SpecError::not_found("record", reference))
    }

    /// Apply a mutation to a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] for an unknown id, or whatever
    /// [`SpecificationRecord::apply`] returns.
    pub fn apply(&mut self, id: &SpecId, mutation: RecordMutation) -> Result<MutationOutcome> {
        if let RecordMutation::AddRelatedSpec(other) = &mutation {
            if !self.records.contains_key(other) {
                return Err(SpecError::not_found("record", other));
            }
        }
        self.get_mut(id)?.apply(mutation)
    }

    /// Annotate `id` with a cross-reference to `other`. Allowed on completed
    /// records.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if either record is unknown.
    pub fn relate(&mut self, id: &SpecId, other: &SpecId) -> Result<MutationOutcome> {
        let outcome = self.apply(id, RecordMutation::AddRelatedSpec(other.clone()))?;
        debug!(spec = %id, related = %other, ?outcome, "Related records");
        Ok(outcome)
    }

    /// Replace a stored record with an updated copy of itself.
    ///
    /// # Errors
    ///
    /// - [`SpecError::NotFound`] if the record was never registered
    /// - [`SpecError::ImmutabilityViolation`] if the stored copy is completed
    ///   and the new copy differs in anything but `related_specs`
    pub(crate) fn update(&mut self, record: SpecificationRecord) -> Result<()> {
        let stored = self.get(&record.id)?;
        if stored.is_completed() {
            let mut comparable = record.clone();
            comparable.related_specs = stored.related_specs.clone();
            comparable.updated_at = stored.updated_at;
            if &comparable != stored {
                return Err(SpecError::ImmutabilityViolation {
                    id: record.id.to_string(),
                    reason: format!(
                        "completed records are frozen; create a new record with builds_on = [{}]",
                        record.id
                    ),
                });
            }
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Ancestors of `id` in breadth-first order, each once.
    ///
    /// Parents appear in their declared `builds_on` order; `id` itself is
    /// not included.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if `id` or any ancestor is unknown.
    pub fn lineage(&self, id: &SpecId) -> Result<Vec<SpecId>> {
        let start = self.get(id)?;
        let mut seen: HashSet<&SpecId> = HashSet::from([&start.id]);
        let mut queue: VecDeque<&SpecId> = start.builds_on.iter().collect();
        let mut lineage = Vec::new();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            let record = self.get(next)?;
            lineage.push(next.clone());
            queue.extend(record.builds_on.iter());
        }
        Ok(lineage)
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &SpecificationRecord> {
        self.records.values()
    }

    /// Records in a given status.
    pub fn with_status(&self, status: SpecStatus) -> impl Iterator<Item = &SpecificationRecord> {
        self.records.values().filter(move |r| r.status == status)
    }

    /// Insert a record as loaded from storage, without lineage checks.
    pub(crate) fn insert_loaded(&mut self, record: SpecificationRecord) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(SpecError::validation(format!(
                "Duplicate record {}",
                record.id
            )));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Check every lineage reference resolves and the graph has no cycle.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] describing the first problem.
    pub fn validate_graph(&self) -> Result<()> {
        let mut ordinals = BTreeSet::new();
        for record in self.records.values() {
            if !ordinals.insert(record.id.ordinal()) {
                return Err(SpecError::validation(format!(
                    "Ordinal {} is used by more than one record",
                    record.id.ordinal()
                )));
            }
            for ancestor in record.builds_on.iter().chain(record.related_specs.iter()) {
                if !self.records.contains_key(ancestor) {
                    return Err(SpecError::validation(format!(
                        "Record {} references unknown record {ancestor}",
                        record.id
                    )));
                }
            }
        }

        // Kahn's algorithm over builds_on edges.
        let mut indegree: BTreeMap<&SpecId, usize> =
            self.records.keys().map(|id| (id, 0)).collect();
        for record in self.records.values() {
            for ancestor in &record.builds_on {
                if let Some(d) = indegree.get_mut(ancestor) {
                    *d += 1;
                }
            }
        }
        let mut ready: Vec<&SpecId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            for ancestor in &self.records[id].builds_on {
                if let Some(d) = indegree.get_mut(ancestor) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(ancestor);
                    }
                }
            }
        }
        if visited != self.records.len() {
            return Err(SpecError::validation("Lineage graph contains a cycle"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(registry: &mut SpecRegistry, id: &SpecId) {
        registry.get_mut(id).unwrap().status = SpecStatus::Completed;
    }

    #[test]
    fn test_create_assigns_sequential_ordinals() {
        let mut registry = SpecRegistry::new();
        let a = registry.create("auth", "", Priority::High, vec![]).unwrap();
        let b = registry.create("billing", "", Priority::Low, vec![]).unwrap();
        assert_eq!(a.to_string(), "001-auth");
        assert_eq!(b.to_string(), "002-billing");
        assert_eq!(registry.get(&a).unwrap().priority, Priority::High);
    }

    #[test]
    fn test_create_rejects_duplicates_and_unknown_ancestors() {
        let mut registry = SpecRegistry::new();
        registry.create("auth", "", Priority::Medium, vec![]).unwrap();
        assert!(registry.create("auth", "", Priority::Medium, vec![]).is_err());
        assert!(registry.create("Bad Slug", "", Priority::Medium, vec![]).is_err());

        let ghost = SpecId::new(9, "ghost").unwrap();
        let err = registry
            .create("next", "", Priority::Medium, vec![ghost])
            .unwrap_err();
        assert!(matches!(err, SpecError::NotFound { kind: "record", .. }));
    }

    #[test]
    fn test_frozen_record_recourse_is_a_successor() {
        let mut registry = SpecRegistry::new();
        let old = registry.create("auth", "", Priority::High, vec![]).unwrap();
        assert!(registry.create_successor(&old, "auth-v2", "").is_err());

        complete(&mut registry, &old);
        let err = registry
            .apply(&old, RecordMutation::SetPriority(Priority::Low))
            .unwrap_err();
        assert!(matches!(err, SpecError::ImmutabilityViolation { .. }));

        let new = registry.create_successor(&old, "auth-v2", "").unwrap();
        assert_eq!(registry.get(&new).unwrap().builds_on, vec![old.clone()]);
        assert!(registry
            .apply(&new, RecordMutation::SetPriority(Priority::Low))
            .is_ok());
        assert_eq!(registry.relate(&old, &new).unwrap(), MutationOutcome::Applied);
    }

    #[test]
    fn test_lineage_over_dag_is_bfs_without_repeats() {
        //      base
        //     /    \
        //  left    right
        //     \    /
        //      top
        let mut registry = SpecRegistry::new();
        let base = registry.create("base", "", Priority::Medium, vec![]).unwrap();
        let left = registry
            .create("left", "", Priority::Medium, vec![base.clone()])
            .unwrap();
        let right = registry
            .create("right", "", Priority::Medium, vec![base.clone()])
            .unwrap();
        let top = registry
            .create("top", "", Priority::Medium, vec![left.clone(), right.clone()])
            .unwrap();

        assert_eq!(registry.lineage(&top).unwrap(), vec![left, right, base.clone()]);
        assert!(registry.lineage(&base).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_accepts_several_forms() {
        let mut registry = SpecRegistry::new();
        let id = registry.create("add-login", "", Priority::Medium, vec![]).unwrap();
        for reference in ["001-add-login", "1", "001", "add-login"] {
            assert_eq!(registry.resolve(reference).unwrap(), id, "{reference}");
        }
        assert!(registry.resolve("nope").is_err());
    }

    #[test]
    fn test_update_refuses_changes_to_completed_records() {
        let mut registry = SpecRegistry::new();
        let id = registry.create("auth", "", Priority::Medium, vec![]).unwrap();
        complete(&mut registry, &id);

        let mut changed = registry.get(&id).unwrap().clone();
        changed.description = "rewritten".into();
        assert!(registry.update(changed).is_err());

        let other = registry.create("other", "", Priority::Medium, vec![]).unwrap();
        let mut related = registry.get(&id).unwrap().clone();
        related.related_specs.insert(other);
        assert!(registry.update(related).is_ok());
    }

    #[test]
    fn test_validate_graph_detects_cycles() {
        let mut registry = SpecRegistry::new();
        let a = registry.create("a", "", Priority::Medium, vec![]).unwrap();
        let b = registry
            .create("b", "", Priority::Medium, vec![a.clone()])
            .unwrap();
        assert!(registry.validate_graph().is_ok());

        registry.get_mut(&a).unwrap().builds_on.push(b);
        assert!(registry.validate_graph().is_err());
    }
}
