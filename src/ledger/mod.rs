//! Task ledger: the ordered checklist behind every record and feature.
//!
//! # Architecture
//!
//! ```text
//! TaskLedger
//!   ├── tasks: Vec<Task>        (ordered, ids are 1-based positions)
//!   ├── revision: u64           (bumped on every effective transition)
//!   └── counters()              (always derived from `tasks`)
//! ```
//!
//! The ledger is serialized through [`LedgerDocument`], which carries the
//! three derived counters next to the checklist. Loading a document whose
//! counters disagree with its checklist is a validation error.

mod counters;

pub use counters::LedgerCounters;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SpecError};

// ============================================================================
// Task Identifier
// ============================================================================

/// 1-based position of a task within its ledger.
///
/// # Example
///
/// ```
/// use specflow::ledger::TaskId;
///
/// let id: TaskId = "#2".parse().unwrap();
/// assert_eq!(id.get(), 2);
/// assert_eq!(id.to_string(), "#2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u32);

impl TaskId {
    /// Create a task id. Ids start at 1.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the numeric id.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches('#');
        digits
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .map(TaskId)
            .ok_or_else(|| SpecError::validation(format!("Invalid task id: {s}")))
    }
}

// ============================================================================
// Task
// ============================================================================

/// A single atomic work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Position in the ledger
    pub id: TaskId,
    /// What needs doing
    pub description: String,
    /// Whether the task is done
    pub done: bool,
    /// When the task was marked done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Task Ledger
// ============================================================================

/// Ordered checklist with derived completion counters.
///
/// # Example
///
/// ```
/// use specflow::ledger::TaskLedger;
///
/// let mut ledger = TaskLedger::new();
/// let first = ledger.add_task("Write parser");
/// ledger.add_task("Write tests");
/// ledger.add_task("Wire CLI");
/// ledger.mark_done(first).unwrap();
///
/// let counters = ledger.counters();
/// assert_eq!(counters.completed, 1);
/// assert_eq!(counters.uncompleted, 2);
/// assert_eq!(counters.completion_percentage, 33);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LedgerDocument", into = "LedgerDocument")]
pub struct TaskLedger {
    tasks: Vec<Task>,
    revision: u64,
}

impl TaskLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task and return its id.
    pub fn add_task(&mut self, description: impl Into<String>) -> TaskId {
        let id = TaskId(self.tasks.len() as u32 + 1);
        self.tasks.push(Task {
            id,
            description: description.into(),
            done: false,
            completed_at: None,
        });
        id
    }

    /// Mark a task done.
    ///
    /// Returns `true` if the task transitioned, `false` if it was already done.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] for an unknown id.
    pub fn mark_done(&mut self, id: TaskId) -> Result<bool> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SpecError::not_found("task", id))?;

        if task.done {
            return Ok(false);
        }

        task.done = true;
        task.completed_at = Some(Utc::now());
        self.revision += 1;
        Ok(true)
    }

    /// Counters computed from the live task list.
    #[must_use]
    pub fn counters(&self) -> LedgerCounters {
        let completed = self.tasks.iter().filter(|t| t.done).count() as u32;
        LedgerCounters::from_counts(completed, self.tasks.len() as u32)
    }

    /// Look up a task.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// All tasks in order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Open tasks in order.
    pub fn open_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.done)
    }

    /// Number of task transitions recorded so far.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether every task is done (an empty ledger counts as done).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.counters().is_complete()
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the ledger has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

// ============================================================================
// Persisted Document
// ============================================================================

/// Wire form of a ledger: checklist plus the three derived counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// Ordered checklist
    pub tasks: Vec<Task>,
    /// Tasks marked done
    pub completed: u32,
    /// Tasks still open
    pub uncompleted: u32,
    /// Rounded completion percentage
    pub completion_percentage: u8,
    /// Transition counter
    #[serde(default)]
    pub revision: u64,
}

impl From<TaskLedger> for LedgerDocument {
    fn from(ledger: TaskLedger) -> Self {
        let counters = ledger.counters();
        Self {
            tasks: ledger.tasks,
            completed: counters.completed,
            uncompleted: counters.uncompleted,
            completion_percentage: counters.completion_percentage,
            revision: ledger.revision,
        }
    }
}

impl TryFrom<LedgerDocument> for TaskLedger {
    type Error = SpecError;

    fn try_from(doc: LedgerDocument) -> Result<Self> {
        for (index, task) in doc.tasks.iter().enumerate() {
            let expected = index as u32 + 1;
            if task.id.get() != expected {
                return Err(SpecError::validation(format!(
                    "Task at position {expected} has id {}",
                    task.id
                )));
            }
        }

        let ledger = TaskLedger {
            tasks: doc.tasks,
            revision: doc.revision,
        };

        let actual = ledger.counters();
        let claimed = LedgerCounters {
            completed: doc.completed,
            uncompleted: doc.uncompleted,
            completion_percentage: doc.completion_percentage,
        };
        if actual != claimed {
            return Err(SpecError::validation(format!(
                "Ledger counters {}/{}/{}% do not match checklist {}/{}/{}%",
                claimed.completed,
                claimed.uncompleted,
                claimed.completion_percentage,
                actual.completed,
                actual.uncompleted,
                actual.completion_percentage
            )));
        }

        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ledger_with(n: usize) -> TaskLedger {
        let mut ledger = TaskLedger::new();
        for i in 0..n {
            ledger.add_task(format!("task {i}"));
        }
        ledger
    }

    #[test]
    fn test_three_tasks_one_done() {
        let mut ledger = ledger_with(3);
        ledger.mark_done(TaskId::new(1)).unwrap();

        let c = ledger.counters();
        assert_eq!(c.completed, 1);
        assert_eq!(c.uncompleted, 2);
        assert_eq!(c.completion_percentage, 33);
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let mut once = ledger_with(2);
        assert!(once.mark_done(TaskId::new(2)).unwrap());

        let mut twice = once.clone();
        assert!(!twice.mark_done(TaskId::new(2)).unwrap());

        assert_eq!(once, twice);
        assert_eq!(twice.revision(), 1);
    }

    #[test]
    fn test_mark_done_unknown_task() {
        let mut ledger = ledger_with(1);
        let err = ledger.mark_done(TaskId::new(7)).unwrap_err();
        assert!(matches!(err, SpecError::NotFound { kind: "task", .. }));
    }

    #[test]
    fn test_add_task_does_not_bump_revision() {
        let mut ledger = ledger_with(4);
        assert_eq!(ledger.revision(), 0);
        ledger.mark_done(TaskId::new(3)).unwrap();
        ledger.add_task("late addition");
        assert_eq!(ledger.revision(), 1);
        assert_eq!(ledger.open_tasks().count(), 4);
    }

    #[test]
    fn test_task_id_parsing() {
        assert_eq!("3".parse::<TaskId>().unwrap(), TaskId::new(3));
        assert_eq!("#12".parse::<TaskId>().unwrap(), TaskId::new(12));
        assert!("0".parse::<TaskId>().is_err());
        assert!("abc".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_document_roundtrip_keeps_counters() {
        let mut ledger = ledger_with(2);
        ledger.mark_done(TaskId::new(1)).unwrap();

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["completed"], 1);
        assert_eq!(json["uncompleted"], 1);
        assert_eq!(json["completion_percentage"], 50);

        let back: TaskLedger = serde_json::from_value(json).unwrap();
        assert_eq!(back, ledger);
    }

    #[test]
    fn test_document_with_drifted_counters_is_rejected() {
        let json = serde_json::json!({
            "tasks": [
                {"id": 1, "description": "a", "done": true},
                {"id": 2, "description": "b", "done": false}
            ],
            "completed": 2,
            "uncompleted": 0,
            "completion_percentage": 100
        });

        let err = serde_json::from_value::<TaskLedger>(json).unwrap_err();
        assert!(err.to_string().contains("do not match checklist"));
    }

    #[test]
    fn test_document_with_gapped_ids_is_rejected() {
        let json = serde_json::json!({
            "tasks": [{"id": 2, "description": "a", "done": false}],
            "completed": 0,
            "uncompleted": 1,
            "completion_percentage": 0
        });

        assert!(serde_json::from_value::<TaskLedger>(json).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Done(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Add), (1u32..12).prop_map(Op::Done)]
    }

    proptest! {
        #[test]
        fn prop_counters_match_checklist(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut ledger = TaskLedger::new();
            for op in ops {
                match op {
                    Op::Add => { ledger.add_task("t"); }
                    Op::Done(id) => { let _ = ledger.mark_done(TaskId::new(id)); }
                }

                let c = ledger.counters();
                let total = ledger.len() as u32;
                let done = ledger.tasks().iter().filter(|t| t.done).count() as u32;
                prop_assert_eq!(c.completed + c.uncompleted, total);
                prop_assert_eq!(c.completed, done);
                let expected = if total == 0 {
                    0
                } else {
                    (f64::from(done) * 100.0 / f64::from(total)).round() as u8
                };
                prop_assert_eq!(c.completion_percentage, expected);
            }
        }

        #[test]
        fn prop_mark_done_twice_equals_once(n in 1usize..10, pick in 1u32..10) {
            let mut once = ledger_with(n);
            let id = TaskId::new(pick.min(n as u32));
            once.mark_done(id).unwrap();
            let mut twice = once.clone();
            twice.mark_done(id).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
