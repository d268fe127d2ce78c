//! Per-record lifecycle state machine.
//!
//! A [`WorkflowEngine`] owns one [`SpecificationRecord`] and drives it through
//! Drafting, Reviewed, Implementing, Verifying, Fixing and Completed, with a
//! Blocked side path. Methods take `&mut self`, so transitions of one record
//! are strictly sequential; different records run on different engines and
//! only meet at the [`ConcurrencyGuard`].
//!
//! Verification is step-atomic: the record is not touched while the gateway
//! runs. If the `verify` future is dropped mid-run, the lease is released by
//! its guard and the record, ledger and audit trail stay where they were.
//!
//! # Example
//!
//! ```rust,ignore
//! use specflow::workflow::{Actor, WorkflowEngine, FixedReviewer, ReviewVerdict, Verdict};
//!
//! let mut engine = WorkflowEngine::new(record, guard, reports);
//! engine.submit_for_review(&FixedReviewer::new(ReviewVerdict::new(Verdict::Go))).await?;
//! engine.start_implementation()?;
//! let task = engine.add_task(Actor::Implementation, None, "Write parser")?;
//! engine.complete_task(Actor::Implementation, None, task)?;
//! let outcome = engine.verify(&gateway, "rust", &ChangeSet::new(".")).await?;
//! ```

mod review;

pub use review::{FixedReviewer, ReviewVerdict, Reviewer, Verdict};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditTrail, ReportStore};
use crate::error::{Result, SpecError};
use crate::guard::ConcurrencyGuard;
use crate::immutability::{ImmutabilityEnforcer, WriteDecision};
use crate::ledger::TaskId;
use crate::record::{
    FeatureId, MutationOutcome, Obstacle, RecordMutation, SpecStatus, SpecificationRecord,
};
use crate::verification::{ChangeSet, VerificationReport, Verifier};

// ============================================================================
// Actors
// ============================================================================

/// Role of the worker issuing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    /// Writes code and reports task progress
    Implementation,
    /// Runs check batteries
    Verification,
    /// Judges drafts
    Review,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Implementation => write!(f, "implementation"),
            Actor::Verification => write!(f, "verification"),
            Actor::Review => write!(f, "review"),
        }
    }
}

impl Actor {
    /// Whether this role may write task ledgers.
    #[must_use]
    pub fn may_write_ledger(&self) -> bool {
        matches!(self, Actor::Implementation)
    }
}

// ============================================================================
// Settings & Outcomes
// ============================================================================

/// Tunables for the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Fix cycles allowed before the record is parked; `None` is unbounded.
    pub max_fix_cycles: Option<u32>,
}

impl WorkflowSettings {
    /// Builder method to cap Fix cycles.
    #[must_use]
    pub fn with_max_fix_cycles(mut self, max: Option<u32>) -> Self {
        self.max_fix_cycles = max;
        self
    }
}

/// What a verification run did to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// The full report from the gateway
    pub report: VerificationReport,
    /// Status the record ended in
    pub status: SpecStatus,
}

// ============================================================================
// Workflow Engine
// ============================================================================

/// State machine for one specification record.
pub struct WorkflowEngine {
    record: SpecificationRecord,
    origin: SpecificationRecord,
    audit: AuditTrail,
    guard: Arc<ConcurrencyGuard>,
    settings: WorkflowSettings,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("record", &self.record.id)
            .field("status", &self.record.status)
            .field("settings", &self.settings)
            .finish()
    }
}

impl WorkflowEngine {
    /// Engine for `record`, sharing `guard` with every other engine that
    /// verifies against the same stacks.
    pub fn new(
        record: SpecificationRecord,
        guard: Arc<ConcurrencyGuard>,
        reports: Arc<dyn ReportStore>,
    ) -> Self {
        let audit = AuditTrail::new(record.id.clone(), reports);
        Self {
            origin: record.clone(),
            record,
            audit,
            guard,
            settings: WorkflowSettings::default(),
        }
    }

    /// Builder method to set tunables.
    #[must_use]
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The record being driven.
    #[must_use]
    pub fn record(&self) -> &SpecificationRecord {
        &self.record
    }

    /// The record as it was when the engine was created.
    #[must_use]
    pub fn origin(&self) -> &SpecificationRecord {
        &self.origin
    }

    /// Give the record back, e.g. to persist it.
    #[must_use]
    pub fn into_record(self) -> SpecificationRecord {
        self.record
    }

    /// Give back the starting copy and the current record, for a
    /// compare-and-swap style save.
    #[must_use]
    pub fn into_parts(self) -> (SpecificationRecord, SpecificationRecord) {
        (self.origin, self.record)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SpecStatus {
        self.record.status
    }

    /// The record's audit trail.
    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    // ------------------------------------------------------------------------
    // Review
    // ------------------------------------------------------------------------

    /// Ask `reviewer` to judge the draft.
    ///
    /// `Go` moves the record to Reviewed. `Stop` and `Clarify` keep it in
    /// Drafting with a [`Obstacle::ReviewHalted`] that only [`resume`] clears.
    ///
    /// [`resume`]: WorkflowEngine::resume
    ///
    /// # Errors
    ///
    /// - [`SpecError::InvalidTransition`] outside Drafting
    /// - [`SpecError::AwaitingInput`] while a halted review awaits input
    /// - [`SpecError::Other`] if the reviewer itself failed
    pub async fn submit_for_review(&mut self, reviewer: &dyn Reviewer) -> Result<ReviewVerdict> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Reviewed,
            reason: None,
        })?;
        self.require(SpecStatus::Drafting, "submit for review")?;
        if let Some(obstacle @ Obstacle::ReviewHalted { .. }) = &self.record.obstacle {
            return Err(SpecError::AwaitingInput {
                id: self.record.id.to_string(),
                reason: obstacle.to_string(),
            });
        }

        let verdict = reviewer.review(&self.record).await?;
        info!(
            spec = %self.record.id,
            verdict = %verdict.verdict,
            "Review returned"
        );

        match verdict.verdict {
            Verdict::Go => {
                self.record.obstacle = None;
                self.transition(SpecStatus::Reviewed, verdict.reasoning.clone())?;
            }
            Verdict::Stop | Verdict::Clarify => {
                warn!(
                    spec = %self.record.id,
                    verdict = %verdict.verdict,
                    "Review halted the draft"
                );
                self.set_obstacle(Some(Obstacle::ReviewHalted {
                    verdict: verdict.verdict,
                    reasoning: verdict.reasoning.clone(),
                }));
            }
        }
        Ok(verdict)
    }

    /// Reviewed → Implementing.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidTransition`] outside Reviewed.
    pub fn start_implementation(&mut self) -> Result<()> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Implementing,
            reason: None,
        })?;
        self.require(SpecStatus::Reviewed, "start implementation")?;
        self.transition(SpecStatus::Implementing, None)
    }

    // ------------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------------

    /// Append a task to the root ledger or to `feature`'s ledger.
    ///
    /// # Errors
    ///
    /// - [`SpecError::Validation`] if `actor` may not write ledgers
    /// - [`SpecError::ImmutabilityViolation`] on a completed record
    /// - [`SpecError::InvalidTransition`] outside Drafting, Reviewed, Implementing
    /// - [`SpecError::NotFound`] for an unknown feature
    pub fn add_task(
        &mut self,
        actor: Actor,
        feature: Option<FeatureId>,
        description: impl Into<String>,
    ) -> Result<TaskId> {
        let mutation = RecordMutation::AddTask {
            feature,
            description: description.into(),
        };
        self.authorize_ledger_write(actor, &mutation)?;
        if !matches!(
            self.record.status,
            SpecStatus::Drafting | SpecStatus::Reviewed | SpecStatus::Implementing
        ) {
            return Err(SpecError::invalid_transition(self.record.status, "add a task"));
        }

        match self.record.apply(mutation)? {
            MutationOutcome::TaskAdded(id) => {
                debug!(spec = %self.record.id, task = %id, "Task added");
                Ok(id)
            }
            other => Err(SpecError::Other(anyhow::anyhow!(
                "unexpected outcome for add task: {other:?}"
            ))),
        }
    }

    /// Mark a task done. Marking a done task again is a no-op.
    ///
    /// Returns `true` if the task transitioned.
    ///
    /// # Errors
    ///
    /// - [`SpecError::Validation`] if `actor` may not write ledgers
    /// - [`SpecError::ImmutabilityViolation`] on a completed record
    /// - [`SpecError::InvalidTransition`] outside Implementing
    /// - [`SpecError::NotFound`] for an unknown feature or task
    pub fn complete_task(
        &mut self,
        actor: Actor,
        feature: Option<FeatureId>,
        task: TaskId,
    ) -> Result<bool> {
        let mutation = RecordMutation::CompleteTask { feature, task };
        self.authorize_ledger_write(actor, &mutation)?;
        self.require(SpecStatus::Implementing, "complete a task")?;

        let changed = self.record.apply(mutation)? == MutationOutcome::Applied;
        let counters = self.record.counters();
        debug!(
            spec = %self.record.id,
            task = %task,
            changed,
            completed = counters.completed,
            uncompleted = counters.uncompleted,
            "Task completion reported"
        );
        Ok(changed)
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Run verification for one stack and route the result.
    ///
    /// Requires Implementing and at least one task transition since the
    /// previous attempt. The lease for `stack` is held only while `verifier`
    /// runs. Once the report is back:
    ///
    /// - Pass with no open tasks: report cleared, record Completed
    /// - Pass with open tasks: report cleared, record back to Implementing
    /// - Fail: report stored, record Fixing
    ///
    /// # Errors
    ///
    /// - [`SpecError::InvalidTransition`] outside Implementing or without ledger progress
    /// - [`SpecError::ConcurrencyViolation`] if another verifier holds `stack`;
    ///   the record stays Implementing with [`Obstacle::LeaseBusy`]
    /// - [`SpecError::NotFound`] if `verifier` has no battery for `stack`
    pub async fn verify(
        &mut self,
        verifier: &dyn Verifier,
        stack: &str,
        change_set: &ChangeSet,
    ) -> Result<VerifyOutcome> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Verifying,
            reason: None,
        })?;
        self.require(SpecStatus::Implementing, "verify")?;

        let revision = self.record.ledger_revision();
        if revision <= self.record.verified_revision {
            return Err(SpecError::invalid_transition(
                self.record.status,
                "verify without a task transition since the last verification",
            ));
        }

        let lease = match self.guard.acquire_scoped(stack) {
            Ok(lease) => lease,
            Err(e @ SpecError::ConcurrencyViolation { .. }) => {
                warn!(spec = %self.record.id, stack = %stack, "Verification lease busy");
                self.set_obstacle(Some(Obstacle::LeaseBusy {
                    stack: stack.to_string(),
                }));
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(
            spec = %self.record.id,
            stack = %stack,
            lease = %lease.lease().id(),
            "Acquired verification lease"
        );

        let report = verifier.run(stack, change_set).await;
        lease.release()?;
        debug!(spec = %self.record.id, stack = %stack, "Released verification lease");
        let report = report?;

        if report.passed() {
            self.audit.clear()?;
        } else {
            self.audit.record_failure(&report)?;
        }

        self.record.verified_revision = revision;
        self.transition(SpecStatus::Verifying, Some(format!("verifying {stack}")))?;

        let counters = self.record.counters();
        if report.passed() {
            self.record.obstacle = None;
            self.record.fix_cycles = 0;
            if counters.uncompleted == 0 {
                self.transition(SpecStatus::Completed, Some("verification passed".into()))?;
            } else {
                self.transition(
                    SpecStatus::Implementing,
                    Some(format!(
                        "verification passed with {} open task(s)",
                        counters.uncompleted
                    )),
                )?;
            }
        } else {
            let failed_checks = report.failed_checks();
            self.transition(
                SpecStatus::Fixing,
                Some(format!("failed: {}", failed_checks.join(", "))),
            )?;
            self.set_obstacle(Some(Obstacle::VerificationFailed { failed_checks }));
        }

        Ok(VerifyOutcome {
            report,
            status: self.record.status,
        })
    }

    /// Fixing → Implementing, counting one Fix cycle.
    ///
    /// With a fix-cycle limit configured and reached, the record is parked in
    /// Blocked instead.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidTransition`] outside Fixing.
    pub fn resume_fixing(&mut self) -> Result<SpecStatus> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Implementing,
            reason: None,
        })?;
        self.require(SpecStatus::Fixing, "resume fixing")?;

        if let Some(max) = self.settings.max_fix_cycles {
            if self.record.fix_cycles >= max {
                warn!(
                    spec = %self.record.id,
                    cycles = self.record.fix_cycles,
                    max,
                    "Fix cycle limit reached"
                );
                self.park(format!("fix cycle limit of {max} reached"))?;
                return Ok(self.record.status);
            }
        }

        self.record.fix_cycles += 1;
        let cycle = self.record.fix_cycles;
        self.transition(SpecStatus::Implementing, Some(format!("fix cycle {cycle}")))?;
        Ok(self.record.status)
    }

    // ------------------------------------------------------------------------
    // Human signals
    // ------------------------------------------------------------------------

    /// Park the record until [`resume`](WorkflowEngine::resume).
    ///
    /// # Errors
    ///
    /// - [`SpecError::ImmutabilityViolation`] on a completed record
    /// - [`SpecError::InvalidTransition`] if already Blocked
    pub fn block(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Blocked,
            reason: None,
        })?;
        if self.record.status == SpecStatus::Blocked {
            return Err(SpecError::invalid_transition(self.record.status, "block"));
        }
        self.park(reason.into())
    }

    /// Stop a Fix loop and park the record in Blocked.
    ///
    /// Allowed anywhere between a failed verification and the next attempt:
    /// in Fixing, or in Implementing while a Fix cycle is open.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidTransition`] outside a Fix loop.
    pub fn abandon(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_writable(&RecordMutation::Transition {
            to: SpecStatus::Blocked,
            reason: None,
        })?;
        let in_fix_loop = match self.record.status {
            SpecStatus::Fixing => true,
            SpecStatus::Implementing => self.record.fix_cycles > 0,
            _ => false,
        };
        if !in_fix_loop {
            return Err(SpecError::invalid_transition(
                self.record.status,
                "abandon outside a fix loop",
            ));
        }
        let reason = reason.into();
        info!(spec = %self.record.id, reason = %reason, "Fix loop abandoned");
        self.park(format!("abandoned: {reason}"))
    }

    /// Resume with human input.
    ///
    /// A Blocked record returns to the state it was parked from; a draft with
    /// a halted review becomes submittable again. Returns the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidTransition`] if nothing is waiting for input.
    pub fn resume(&mut self, input: impl Into<String>) -> Result<SpecStatus> {
        self.ensure_writable(&RecordMutation::SetDescription(String::new()))?;
        let input = input.into();

        match (self.record.status, &self.record.obstacle) {
            (SpecStatus::Blocked, _) => {
                let origin = self.record.blocked_from.ok_or_else(|| {
                    SpecError::validation(format!(
                        "Record {} is blocked without an origin state",
                        self.record.id
                    ))
                })?;
                self.transition(origin, Some(format!("resumed: {input}")))?;
                self.record.blocked_from = None;
                if origin == SpecStatus::Fixing {
                    self.record.fix_cycles = 0;
                }
            }
            (SpecStatus::Drafting, Some(Obstacle::ReviewHalted { .. })) => {
                info!(spec = %self.record.id, "Halted review resumed");
            }
            (status, _) => {
                return Err(SpecError::invalid_transition(status, "resume"));
            }
        }

        self.record.obstacle = None;
        self.record.clarifications.push(input);
        self.touch();
        Ok(self.record.status)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn park(&mut self, reason: String) -> Result<()> {
        let origin = self.record.status;
        self.transition(SpecStatus::Blocked, Some(reason.clone()))?;
        self.record.blocked_from = Some(origin);
        self.set_obstacle(Some(Obstacle::Blocked { reason }));
        Ok(())
    }

    fn transition(&mut self, to: SpecStatus, reason: Option<String>) -> Result<()> {
        let from = self.record.status;
        self.record.apply(RecordMutation::Transition {
            to,
            reason: reason.clone(),
        })?;
        info!(
            spec = %self.record.id,
            from = %from,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "Record transitioned"
        );
        Ok(())
    }

    fn require(&self, expected: SpecStatus, action: &str) -> Result<()> {
        if self.record.status == expected {
            Ok(())
        } else {
            Err(SpecError::invalid_transition(self.record.status, action))
        }
    }

    fn ensure_writable(&self, mutation: &RecordMutation) -> Result<()> {
        match ImmutabilityEnforcer::guard_write(&self.record, mutation) {
            WriteDecision::Allow => Ok(()),
            WriteDecision::Reject(reason) => Err(SpecError::ImmutabilityViolation {
                id: self.record.id.to_string(),
                reason,
            }),
        }
    }

    fn authorize_ledger_write(&self, actor: Actor, mutation: &RecordMutation) -> Result<()> {
        if !actor.may_write_ledger() {
            warn!(spec = %self.record.id, actor = %actor, "Rejected ledger write");
            return Err(SpecError::validation(format!(
                "The {actor} actor may not write the task ledger"
            )));
        }
        self.ensure_writable(mutation)
    }

    fn set_obstacle(&mut self, obstacle: Option<Obstacle>) {
        self.record.obstacle = obstacle;
        self.touch();
    }

    fn touch(&mut self) {
        self.record.updated_at = chrono::Utc::now();
    }
}
