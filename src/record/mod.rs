//! Specification records: the versioned, lineage-aware unit of work.
//!
//! # Architecture
//!
//! ```text
//! SpecificationRecord
//!   ├── id: SpecId               (ordinal + slug, immutable)
//!   ├── status / priority / description
//!   ├── builds_on: Vec<SpecId>   (ancestors, frozen with the record)
//!   ├── related_specs            (annotations, always appendable)
//!   ├── ledger: TaskLedger       (root checklist)
//!   └── features: Vec<Feature>   (each with its own ledger)
//! ```
//!
//! Every write goes through [`SpecificationRecord::apply`], which consults the
//! [`ImmutabilityEnforcer`](crate::immutability::ImmutabilityEnforcer) before
//! touching any field.

mod feature;
mod status;

pub use feature::{Feature, FeatureId};
pub use status::{SpecStatus, StatusTransition};

pub(crate) use feature::validate_features;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{Result, SpecError};
use crate::immutability::{ImmutabilityEnforcer, WriteDecision};
use crate::ledger::{LedgerCounters, TaskId, TaskLedger};
use crate::workflow::Verdict;

static SLUG_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn slug_regex() -> Option<&'static Regex> {
    SLUG_RE
        .get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").ok())
        .as_ref()
}

/// Check that a slug is lowercase kebab-case.
pub(crate) fn validate_slug(slug: &str) -> Result<()> {
    if slug_regex().is_some_and(|re| re.is_match(slug)) {
        Ok(())
    } else {
        Err(SpecError::validation(format!(
            "Invalid slug '{slug}': expected lowercase kebab-case"
        )))
    }
}

// ============================================================================
// Spec Identifier
// ============================================================================

/// Stable identity of a record: a sequential ordinal plus a slug.
///
/// # Example
///
/// ```
/// use specflow::record::SpecId;
///
/// let id = SpecId::new(7, "add-login").unwrap();
/// assert_eq!(id.to_string(), "007-add-login");
/// assert_eq!("007-add-login".parse::<SpecId>().unwrap(), id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecId {
    ordinal: u32,
    slug: String,
}

impl SpecId {
    /// Create an id, validating the slug.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] for an ordinal of 0 or a bad slug.
    pub fn new(ordinal: u32, slug: impl Into<String>) -> Result<Self> {
        let slug = slug.into();
        if ordinal == 0 {
            return Err(SpecError::validation("Record ordinals start at 1"));
        }
        validate_slug(&slug)?;
        Ok(Self { ordinal, slug })
    }

    /// Sequential ordinal.
    #[must_use]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Slug.
    #[must_use]
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{}", self.ordinal, self.slug)
    }
}

impl FromStr for SpecId {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self> {
        let (ordinal, slug) = s
            .split_once('-')
            .ok_or_else(|| SpecError::validation(format!("Invalid record id: {s}")))?;
        let ordinal = ordinal
            .parse::<u32>()
            .map_err(|_| SpecError::validation(format!("Invalid record ordinal in: {s}")))?;
        Self::new(ordinal, slug)
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority of a record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    ValueEnum,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drop everything else
    Critical,
    /// Next in line
    High,
    /// Normal work
    #[default]
    Medium,
    /// When there is time
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Obstacle
// ============================================================================

/// Why a record is not progressing, visible to humans and supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Obstacle {
    /// Review returned Stop or Clarify
    ReviewHalted {
        /// The verdict that halted the review
        verdict: Verdict,
        /// Reviewer's reasoning, if given
        reasoning: Option<String>,
    },
    /// Parked by an external signal
    Blocked {
        /// Reason supplied with the signal
        reason: String,
    },
    /// Another verifier holds the stack lease
    LeaseBusy {
        /// Contended stack key
        stack: String,
    },
    /// The last verification battery failed
    VerificationFailed {
        /// Names of the failing checks
        failed_checks: Vec<String>,
    },
}

impl fmt::Display for Obstacle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obstacle::ReviewHalted { verdict, reasoning } => match reasoning {
                Some(r) => write!(f, "review returned {verdict}: {r}"),
                None => write!(f, "review returned {verdict}"),
            },
            Obstacle::Blocked { reason } => write!(f, "blocked: {reason}"),
            Obstacle::LeaseBusy { stack } => write!(f, "verification lease busy for '{stack}'"),
            Obstacle::VerificationFailed { failed_checks } => {
                write!(f, "verification failed: {}", failed_checks.join(", "))
            }
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// A write against a record. Every write is expressed as one of these so the
/// immutability enforcer can judge it before it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordMutation {
    /// Change the priority
    SetPriority(Priority),
    /// Replace the description
    SetDescription(String),
    /// Append a task to the root ledger or a feature's ledger
    AddTask {
        /// Target feature, `None` for the root ledger
        feature: Option<FeatureId>,
        /// Task description
        description: String,
    },
    /// Mark a task done
    CompleteTask {
        /// Target feature, `None` for the root ledger
        feature: Option<FeatureId>,
        /// Task to mark
        task: TaskId,
    },
    /// Attach a child feature
    AddFeature(Feature),
    /// Annotate with a non-owning cross-reference
    AddRelatedSpec(SpecId),
    /// Change lifecycle state
    Transition {
        /// Target state
        to: SpecStatus,
        /// Optional reason
        reason: Option<String>,
    },
}

impl RecordMutation {
    /// Short name used in logs and rejection messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RecordMutation::SetPriority(_) => "set priority",
            RecordMutation::SetDescription(_) => "set description",
            RecordMutation::AddTask { .. } => "add task",
            RecordMutation::CompleteTask { .. } => "complete task",
            RecordMutation::AddFeature(_) => "add feature",
            RecordMutation::AddRelatedSpec(_) => "add related spec",
            RecordMutation::Transition { .. } => "transition",
        }
    }
}

/// What an applied mutation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The write took effect
    Applied,
    /// The write was a no-op (already done, already related)
    Unchanged,
    /// A task was appended with this id
    TaskAdded(TaskId),
}

// ============================================================================
// Specification Record
// ============================================================================

/// A unit of trackable work with lifecycle state and lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificationRecord {
    /// Stable identity
    pub id: SpecId,
    /// Lifecycle state
    pub status: SpecStatus,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
    /// Opaque description, never parsed for control flow
    #[serde(default)]
    pub description: String,
    /// Ancestors this record extends
    #[serde(default)]
    pub builds_on: Vec<SpecId>,
    /// Non-owning cross-references
    #[serde(default)]
    pub related_specs: BTreeSet<SpecId>,
    /// Root checklist
    pub ledger: TaskLedger,
    /// Child features
    #[serde(default)]
    pub features: Vec<Feature>,
    /// Status history
    #[serde(default)]
    pub history: Vec<StatusTransition>,
    /// Why the record is not progressing, if anything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstacle: Option<Obstacle>,
    /// State to return to when a blocked record resumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_from: Option<SpecStatus>,
    /// Ledger revision at the last verification attempt
    #[serde(default)]
    pub verified_revision: u64,
    /// Completed Fix cycles
    #[serde(default)]
    pub fix_cycles: u32,
    /// Human input supplied when resuming
    #[serde(default)]
    pub clarifications: Vec<String>,
}

impl SpecificationRecord {
    /// Create a draft record.
    #[must_use]
    pub fn new(id: SpecId, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SpecStatus::Drafting,
            priority: Priority::default(),
            created_at: now,
            updated_at: now,
            description: description.into(),
            builds_on: Vec::new(),
            related_specs: BTreeSet::new(),
            ledger: TaskLedger::new(),
            features: Vec::new(),
            history: Vec::new(),
            obstacle: None,
            blocked_from: None,
            verified_revision: 0,
            fix_cycles: 0,
            clarifications: Vec::new(),
        }
    }

    /// Builder method to set ancestors.
    #[must_use]
    pub fn with_builds_on(mut self, builds_on: Vec<SpecId>) -> Self {
        self.builds_on = builds_on;
        self
    }

    /// Builder method to set priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the record has reached its terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == SpecStatus::Completed
    }

    /// Look up a feature.
    #[must_use]
    pub fn feature(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.iter().find(|f| &f.id == id)
    }

    /// The ledger addressed by `feature` (`None` = root).
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] for an unknown feature.
    pub fn ledger_for(&self, feature: Option<&FeatureId>) -> Result<&TaskLedger> {
        match feature {
            None => Ok(&self.ledger),
            Some(id) => self
                .feature(id)
                .map(|f| &f.ledger)
                .ok_or_else(|| SpecError::not_found("feature", id)),
        }
    }

    fn ledger_for_mut(&mut self, feature: Option<&FeatureId>) -> Result<&mut TaskLedger> {
        match feature {
            None => Ok(&mut self.ledger),
            Some(id) => self
                .features
                .iter_mut()
                .find(|f| &f.id == id)
                .map(|f| &mut f.ledger)
                .ok_or_else(|| SpecError::not_found("feature", id)),
        }
    }

    /// Counters summed over the root ledger and every feature ledger.
    #[must_use]
    pub fn counters(&self) -> LedgerCounters {
        self.features
            .iter()
            .fold(self.ledger.counters(), |acc, f| acc.combine(f.ledger.counters()))
    }

    /// Sum of all ledger revisions; grows whenever any task transitions.
    #[must_use]
    pub fn ledger_revision(&self) -> u64 {
        self.features
            .iter()
            .fold(self.ledger.revision(), |acc, f| acc + f.ledger.revision())
    }

    /// Apply a write after the immutability enforcer allows it.
    ///
    /// # Errors
    ///
    /// - [`SpecError::ImmutabilityViolation`] if the record is frozen
    /// - [`SpecError::NotFound`] for unknown features or tasks
    /// - [`SpecError::Validation`] for malformed features or self-references
    /// - [`SpecError::InvalidTransition`] for illegal status changes
    pub fn apply(&mut self, mutation: RecordMutation) -> Result<MutationOutcome> {
        if let WriteDecision::Reject(reason) = ImmutabilityEnforcer::guard_write(self, &mutation) {
            return Err(SpecError::ImmutabilityViolation {
                id: self.id.to_string(),
                reason,
            });
        }

        let outcome = match mutation {
            RecordMutation::SetPriority(priority) => {
                self.priority = priority;
                MutationOutcome::Applied
            }
            RecordMutation::SetDescription(description) => {
                self.description = description;
                MutationOutcome::Applied
            }
            RecordMutation::AddTask {
                feature,
                description,
            } => {
                let id = self.ledger_for_mut(feature.as_ref())?.add_task(description);
                MutationOutcome::TaskAdded(id)
            }
            RecordMutation::CompleteTask { feature, task } => {
                if self.ledger_for_mut(feature.as_ref())?.mark_done(task)? {
                    MutationOutcome::Applied
                } else {
                    MutationOutcome::Unchanged
                }
            }
            RecordMutation::AddFeature(feature) => {
                let mut features = self.features.clone();
                features.push(feature);
                validate_features(&features)?;
                self.features = features;
                MutationOutcome::Applied
            }
            RecordMutation::AddRelatedSpec(other) => {
                if other == self.id {
                    return Err(SpecError::validation("A record cannot relate to itself"));
                }
                if self.related_specs.insert(other) {
                    MutationOutcome::Applied
                } else {
                    MutationOutcome::Unchanged
                }
            }
            RecordMutation::Transition { to, reason } => {
                if !self.status.can_transition_to(to) {
                    return Err(SpecError::invalid_transition(
                        self.status,
                        format!("move to {to}"),
                    ));
                }
                self.history
                    .push(StatusTransition::new(self.status, to, reason));
                self.status = to;
                MutationOutcome::Applied
            }
        };

        if outcome != MutationOutcome::Unchanged {
            self.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    /// Structural checks run on every loaded document.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_slug(self.id.slug())?;
        if self.builds_on.contains(&self.id) {
            return Err(SpecError::validation(format!(
                "Record {} builds on itself",
                self.id
            )));
        }
        if self.related_specs.contains(&self.id) {
            return Err(SpecError::validation(format!(
                "Record {} relates to itself",
                self.id
            )));
        }
        if self.updated_at < self.created_at {
            return Err(SpecError::validation(format!(
                "Record {} was updated before it was created",
                self.id
            )));
        }
        if (self.status == SpecStatus::Blocked) != self.blocked_from.is_some() {
            return Err(SpecError::validation(format!(
                "Record {} has inconsistent blocked state",
                self.id
            )));
        }
        validate_features(&self.features)
    }
}
