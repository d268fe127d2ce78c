//! Record status types and transitions.
//!
//! This module contains the state machine types for specification records:
//! - [`SpecStatus`] - Current lifecycle state
//! - [`StatusTransition`] - Record of a state change

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Spec Status
// ============================================================================

/// Lifecycle state of a specification record.
///
/// # State Transitions
///
/// ```text
/// Drafting ──Go──> Reviewed ──> Implementing ──> Verifying ──Pass──> Completed
///                                    ▲               │  │
///                                    │    Pass, open │  │ Fail
///                                    ├───────────────┘  ▼
///                                    └────────────── Fixing
///
/// any non-terminal state ──block──> Blocked ──resume──> (origin state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpecStatus {
    /// Requirements are being captured
    #[default]
    Drafting,
    /// Review returned Go
    Reviewed,
    /// Implementation actors are working through the ledger
    Implementing,
    /// A verification battery is running
    Verifying,
    /// The last verification failed
    Fixing,
    /// Terminal; the record is frozen
    Completed,
    /// Parked until a human supplies input
    Blocked,
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpecStatus::Drafting => "Drafting",
            SpecStatus::Reviewed => "Reviewed",
            SpecStatus::Implementing => "Implementing",
            SpecStatus::Verifying => "Verifying",
            SpecStatus::Fixing => "Fixing",
            SpecStatus::Completed => "Completed",
            SpecStatus::Blocked => "Blocked",
        };
        write!(f, "{s}")
    }
}

impl SpecStatus {
    /// Check if this state can transition to the target state.
    ///
    /// Leaving `Blocked` is only legal back to the state the record was
    /// parked from, which the caller checks separately.
    ///
    /// # Example
    ///
    /// ```
    /// use specflow::record::SpecStatus;
    ///
    /// assert!(SpecStatus::Drafting.can_transition_to(SpecStatus::Reviewed));
    /// assert!(!SpecStatus::Completed.can_transition_to(SpecStatus::Implementing));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, target: SpecStatus) -> bool {
        use SpecStatus::*;
        match (self, target) {
            (Completed, _) => false,
            (Blocked, Blocked) => false,
            (Blocked, Completed) => false,
            (Blocked, _) => true,
            (_, Blocked) => true,
            _ => matches!(
                (self, target),
                (Drafting, Reviewed)
                    | (Reviewed, Implementing)
                    | (Implementing, Verifying)
                    | (Verifying, Completed)
                    | (Verifying, Implementing)
                    | (Verifying, Fixing)
                    | (Fixing, Implementing)
            ),
        }
    }

    /// Check if this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpecStatus::Completed)
    }
}

// ============================================================================
// Status Transition
// ============================================================================

/// Record of a status change, kept in the record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// State before the transition
    pub from: SpecStatus,
    /// State after the transition
    pub to: SpecStatus,
    /// When the transition occurred
    pub timestamp: DateTime<Utc>,
    /// Optional reason for the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusTransition {
    /// Create a new transition record.
    #[must_use]
    pub fn new(from: SpecStatus, to: SpecStatus, reason: Option<String>) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            reason,
        }
    }
}
