//! On-disk project: configuration, records, reports and journal under one root.
//!
//! ```text
//! <project>/.specflow/
//!   ├── config.toml
//!   ├── specs/NNN-slug.json
//!   ├── reports/NNN-slug.json   (only while the last verification failed)
//!   ├── leases/<stack>.lock     (held while a verification runs)
//!   └── journal.jsonl
//! ```
//!
//! A [`Project`] hands out [`WorkflowEngine`]s for stored records and takes
//! them back through [`Project::commit`], which persists the record and
//! journals every transition the engine made. Every write re-reads the
//! documents under the store's exclusive lock, so separate processes on the
//! same root never overwrite each other's changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::audit::{FileReportStore, ReportStore};
use crate::config::ProjectConfig;
use crate::error::{Result, SpecError};
use crate::guard::ConcurrencyGuard;
use crate::journal::{JournalEntry, TransitionJournal};
use crate::record::{MutationOutcome, Priority, RecordMutation, SpecId};
use crate::registry::{RecordStore, SpecRegistry};
use crate::verification::VerificationReport;
use crate::workflow::WorkflowEngine;

/// A loaded project.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    config: ProjectConfig,
    registry: SpecRegistry,
    store: RecordStore,
    reports: Arc<FileReportStore>,
    journal: TransitionJournal,
    guard: Arc<ConcurrencyGuard>,
}

impl Project {
    /// Open the project at `root`, loading its configuration and records.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or any record document is invalid.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config = ProjectConfig::load(&root)?;
        Self::with_config(root, config)
    }

    /// Open the project at `root` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any record document is invalid.
    pub fn with_config(root: impl AsRef<Path>, config: ProjectConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(SpecError::not_found("project directory", root.display()));
        }
        let store = RecordStore::new(config.specs_dir(&root));
        let registry = store.load_all()?;
        let reports = Arc::new(FileReportStore::new(config.reports_dir(&root)));
        let journal = TransitionJournal::new(config.journal_path(&root));
        let guard = Arc::new(ConcurrencyGuard::with_lock_dir(config.leases_dir(&root)));
        debug!(root = %root.display(), records = registry.len(), "Opened project");

        Ok(Self {
            root,
            config,
            registry,
            store,
            reports,
            journal,
            guard,
        })
    }

    /// Project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Loaded records.
    #[must_use]
    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    /// Transition journal.
    #[must_use]
    pub fn journal(&self) -> &TransitionJournal {
        &self.journal
    }

    /// Lease table shared by engines from this project.
    #[must_use]
    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    /// Resolve a user-supplied record reference.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if nothing matches.
    pub fn resolve(&self, reference: &str) -> Result<SpecId> {
        self.registry.resolve(reference)
    }

    /// Create and persist a new draft.
    ///
    /// The ordinal is assigned against the documents on disk, not the
    /// snapshot loaded at open.
    ///
    /// # Errors
    ///
    /// See [`SpecRegistry::create`]; also fails if the document cannot be written.
    pub fn create(
        &mut self,
        slug: &str,
        description: &str,
        priority: Priority,
        builds_on: Vec<SpecId>,
    ) -> Result<SpecId> {
        let (id, registry) = self
            .store
            .transact(|registry| registry.create(slug, description, priority, builds_on))?;
        self.registry = registry;
        Ok(id)
    }

    /// Apply a direct mutation (description, priority, features, relations)
    /// and persist.
    ///
    /// Status changes and ledger writes go through [`Project::engine`], which
    /// checks the actor and the lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] for transitions and ledger writes,
    /// or whatever the registry returns.
    pub fn apply(&mut self, id: &SpecId, mutation: RecordMutation) -> Result<MutationOutcome> {
        if matches!(
            mutation,
            RecordMutation::Transition { .. }
                | RecordMutation::AddTask { .. }
                | RecordMutation::CompleteTask { .. }
        ) {
            return Err(SpecError::validation(
                "Ledger writes and status changes must go through the workflow engine",
            ));
        }
        let (outcome, registry) = self
            .store
            .transact(|registry| registry.apply(id, mutation))?;
        self.registry = registry;
        Ok(outcome)
    }

    /// Engine over a copy of the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] for an unknown id.
    pub fn engine(&self, id: &SpecId) -> Result<WorkflowEngine> {
        let record = self.registry.get(id)?.clone();
        let reports: Arc<dyn ReportStore> = self.reports.clone();
        Ok(WorkflowEngine::new(record, Arc::clone(&self.guard), reports)
            .with_settings(self.config.workflow_settings()))
    }

    /// Take an engine's record back: store it, persist it and journal every
    /// transition made since it was handed out.
    ///
    /// The save only goes through if the stored document still matches the
    /// copy the engine started from.
    ///
    /// # Errors
    ///
    /// - [`SpecError::StaleRecord`] if another writer changed the record
    ///   since the engine was handed out
    /// - a storage error if the record cannot be stored or journaled
    pub fn commit(&mut self, engine: WorkflowEngine) -> Result<Vec<JournalEntry>> {
        let (origin, record) = engine.into_parts();
        let new_transitions = record
            .history
            .get(origin.history.len()..)
            .unwrap_or_default()
            .to_vec();
        let id = record.id.clone();

        let ((), registry) = self.store.transact(|registry| {
            if registry.get(&id)? != &origin {
                warn!(spec = %id, "Stored record changed under the engine");
                return Err(SpecError::StaleRecord { id: id.to_string() });
            }
            registry.update(record)
        })?;
        self.registry = registry;
        self.journal.append_all(&id, &new_transitions)
    }

    /// The stored failure report for a record, if its last verification failed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn current_report(&self, id: &SpecId) -> Result<Option<VerificationReport>> {
        self.reports.get(id)
    }
}
