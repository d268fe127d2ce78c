//! Derived completion counters for a task ledger.
//!
//! Counters are never stored as the source of truth. They are computed from
//! the live task list and only appear in persisted documents so that a reader
//! can check them against the checklist.

use serde::{Deserialize, Serialize};

// ============================================================================
// Ledger Counters
// ============================================================================

/// Completion counters derived from a task list.
///
/// # Example
///
/// ```
/// use specflow::ledger::LedgerCounters;
///
/// let counters = LedgerCounters::from_counts(1, 3);
/// assert_eq!(counters.completed, 1);
/// assert_eq!(counters.uncompleted, 2);
/// assert_eq!(counters.completion_percentage, 33);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounters {
    /// Tasks marked done
    pub completed: u32,
    /// Tasks still open
    pub uncompleted: u32,
    /// `round(100 * completed / total)`, 0 for an empty ledger
    pub completion_percentage: u8,
}

impl LedgerCounters {
    /// Compute counters from a completed count and a total.
    ///
    /// `completed` is clamped to `total`.
    #[must_use]
    pub fn from_counts(completed: u32, total: u32) -> Self {
        let completed = completed.min(total);
        Self {
            completed,
            uncompleted: total - completed,
            completion_percentage: percentage(completed, total),
        }
    }

    /// Total number of tasks these counters describe.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.completed + self.uncompleted
    }

    /// Whether no open tasks remain.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.uncompleted == 0
    }

    /// Sum two sets of counters, recomputing the percentage.
    #[must_use]
    pub fn combine(self, other: LedgerCounters) -> Self {
        let completed = self.completed + other.completed;
        Self::from_counts(completed, self.total() + other.total())
    }
}

/// Integer percentage rounded half up.
fn percentage(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let scaled = (200 * u64::from(completed) + u64::from(total)) / (2 * u64::from(total));
    // completed <= total, so scaled <= 100
    scaled as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ledger_is_zero_percent() {
        let c = LedgerCounters::from_counts(0, 0);
        assert_eq!(c, LedgerCounters::default());
        assert!(c.is_complete());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(LedgerCounters::from_counts(1, 3).completion_percentage, 33);
        assert_eq!(LedgerCounters::from_counts(2, 3).completion_percentage, 67);
        assert_eq!(LedgerCounters::from_counts(1, 8).completion_percentage, 13);
        assert_eq!(LedgerCounters::from_counts(1, 200).completion_percentage, 1);
        assert_eq!(LedgerCounters::from_counts(5, 5).completion_percentage, 100);
    }

    #[test]
    fn test_combine() {
        let a = LedgerCounters::from_counts(1, 2);
        let b = LedgerCounters::from_counts(0, 1);
        let total = a.combine(b);
        assert_eq!(total.completed, 1);
        assert_eq!(total.uncompleted, 2);
        assert_eq!(total.completion_percentage, 33);
    }

    #[test]
    fn test_completed_is_clamped() {
        let c = LedgerCounters::from_counts(9, 4);
        assert_eq!(c.completed, 4);
        assert_eq!(c.uncompleted, 0);
    }
}
