//! specflow - verification-gated specification workflow engine
//!
//! Coordinates cooperating workers through a disciplined lifecycle for units
//! of work ("specification records"), with at most one verifier per stack,
//! a transient failure report per record, and frozen completed records.
//!
//! # Architecture
//!
//! The crate is organized leaf-first:
//!
//! - [`ledger`] - Task checklists with derived completion counters
//! - [`record`] - Specification records, features, status and lineage fields
//! - [`immutability`] - Write gate for completed records
//! - [`guard`] - Per-stack verification leases
//! - [`verification`] - Check batteries, the gateway and stack detection
//! - [`audit`] - Transient failure-report lifecycle
//! - [`workflow`] - Per-record state machine
//! - [`registry`] - Identity assignment, lineage queries, record persistence
//! - [`journal`] - Hash-chained transition log
//! - [`config`] - Project configuration
//! - [`project`] - On-disk project tying the above together
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use specflow::project::Project;
//! use specflow::workflow::{Actor, FixedReviewer, ReviewVerdict, Verdict};
//! use specflow::verification::ChangeSet;
//!
//! let mut project = Project::open(".")?;
//! let id = project.create("add-login", "Login form", Priority::High, vec![])?;
//!
//! let mut engine = project.engine(&id)?;
//! engine.submit_for_review(&FixedReviewer::new(ReviewVerdict::new(Verdict::Go))).await?;
//! engine.start_implementation()?;
//! let task = engine.add_task(Actor::Implementation, None, "Render form")?;
//! engine.complete_task(Actor::Implementation, None, task)?;
//!
//! let gateway = project.config().build_gateway();
//! engine.verify(&gateway, "rust", &ChangeSet::new(project.root())).await?;
//! project.commit(engine)?;
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod guard;
pub mod immutability;
pub mod journal;
pub mod ledger;
pub mod project;
pub mod record;
pub mod registry;
pub mod verification;
pub mod workflow;

// Re-export commonly used types
pub use error::{Result, SpecError};

pub use audit::{AuditTrail, FileReportStore, MemoryReportStore, ReportStore};
pub use config::ProjectConfig;
pub use guard::{ConcurrencyGuard, Lease, LeaseGuard};
pub use immutability::{ImmutabilityEnforcer, WriteDecision};
pub use journal::{JournalEntry, JournalVerification, TransitionJournal};
pub use ledger::{LedgerCounters, Task, TaskId, TaskLedger};
pub use project::Project;
pub use record::{
    Feature, FeatureId, MutationOutcome, Obstacle, Priority, RecordMutation, SpecId, SpecStatus,
    SpecificationRecord, StatusTransition,
};
pub use registry::{RecordStore, SpecRegistry};
pub use verification::{
    ChangeSet, Check, CheckOutcome, CheckResult, CommandCheck, GatewayConfig, Outcome,
    StackDetector, VerificationGateway, VerificationReport, Verifier,
};
pub use workflow::{
    Actor, FixedReviewer, ReviewVerdict, Reviewer, Verdict, VerifyOutcome, WorkflowEngine,
    WorkflowSettings,
};
