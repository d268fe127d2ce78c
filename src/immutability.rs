//! Write gate for completed records.
//!
//! Once a record reaches `Completed` it is frozen. The only write still
//! accepted is appending a related-spec annotation. Everything else is
//! rejected with a reason that names the recourse: start a new record that
//! builds on the frozen one.
//!
//! # Example
//!
//! ```
//! use specflow::immutability::{ImmutabilityEnforcer, WriteDecision};
//! use specflow::record::{Priority, RecordMutation, SpecId, SpecificationRecord};
//!
//! let record = SpecificationRecord::new(SpecId::new(1, "login").unwrap(), "");
//! let decision = ImmutabilityEnforcer::guard_write(
//!     &record,
//!     &RecordMutation::SetPriority(Priority::High),
//! );
//! assert!(decision.is_allowed());
//! ```

use crate::record::{RecordMutation, SpecificationRecord};

/// Outcome of [`ImmutabilityEnforcer::guard_write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    /// The write may proceed
    Allow,
    /// The write must not be applied
    Reject(String),
}

impl WriteDecision {
    /// Whether the write may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, WriteDecision::Allow)
    }
}

/// Stateless gate consulted before every write to a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmutabilityEnforcer;

impl ImmutabilityEnforcer {
    /// Judge a write against the record's current state.
    ///
    /// This is a pure function of `record.status`; it never creates the
    /// successor record itself.
    #[must_use]
    pub fn guard_write(record: &SpecificationRecord, mutation: &RecordMutation) -> WriteDecision {
        if !record.is_completed() {
            return WriteDecision::Allow;
        }

        match mutation {
            RecordMutation::AddRelatedSpec(_) => WriteDecision::Allow,
            other => {
                tracing::debug!(
                    spec = %record.id,
                    mutation = other.label(),
                    "Rejected write to completed record"
                );
                WriteDecision::Reject(format!(
                    "cannot {} on a completed record; create a new record with builds_on = [{}]",
                    other.label(),
                    record.id
                ))
            }
        }
    }
}
