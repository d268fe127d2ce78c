//! Transient verification-failure reports.
//!
//! Each record has at most one stored report: the most recent failure.
//!
//! - no report exists while verification passes
//! - the first failure creates it
//! - each later failure overwrites it whole
//! - the next passing run deletes it
//!
//! Storage sits behind [`ReportStore`] so the workflow can run against an
//! in-memory store in tests and a directory of JSON files in the CLI.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Result, SpecError};
use crate::record::SpecId;
use crate::verification::VerificationReport;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

// ============================================================================
// Report Store
// ============================================================================

/// Backend holding one transient report per record.
pub trait ReportStore: Send + Sync {
    /// Store `report` for `spec`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot persist the report.
    fn put(&self, spec: &SpecId, report: &VerificationReport) -> Result<()>;

    /// Fetch the stored report for `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, spec: &SpecId) -> Result<Option<VerificationReport>>;

    /// Remove the stored report for `spec`. Removing nothing is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn remove(&self, spec: &SpecId) -> Result<()>;
}

/// In-process report store.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<SpecId, VerificationReport>>,
}

impl MemoryReportStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether no reports are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> SpecError {
    SpecError::Other(anyhow::anyhow!("report store lock poisoned"))
}

impl ReportStore for MemoryReportStore {
    fn put(&self, spec: &SpecId, report: &VerificationReport) -> Result<()> {
        let mut reports = self.reports.lock().map_err(|_| poisoned())?;
        reports.insert(spec.clone(), report.clone());
        Ok(())
    }

    fn get(&self, spec: &SpecId) -> Result<Option<VerificationReport>> {
        let reports = self.reports.lock().map_err(|_| poisoned())?;
        Ok(reports.get(spec).cloned())
    }

    fn remove(&self, spec: &SpecId) -> Result<()> {
        let mut reports = self.reports.lock().map_err(|_| poisoned())?;
        reports.remove(spec);
        Ok(())
    }
}

/// Report store writing `<dir>/<spec-id>.json` atomically.
#[derive(Debug, Clone)]
pub struct FileReportStore {
    dir: PathBuf,
}

impl FileReportStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the report path for a record.
    #[must_use]
    pub fn report_path(&self, spec: &SpecId) -> PathBuf {
        self.dir.join(format!("{spec}.json"))
    }

    fn lock_path(&self, spec: &SpecId) -> PathBuf {
        self.dir.join(format!("{spec}.json{LOCK_SUFFIX}"))
    }

    fn tmp_path(&self, spec: &SpecId) -> PathBuf {
        self.dir.join(format!("{spec}.json{TMP_SUFFIX}"))
    }

    fn lock(&self, spec: &SpecId) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.lock_path(spec))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| {
            SpecError::Other(anyhow::anyhow!("Failed to acquire report lock: {e}"))
        })?;
        Ok(lock_file)
    }
}

impl ReportStore for FileReportStore {
    fn put(&self, spec: &SpecId, report: &VerificationReport) -> Result<()> {
        let _lock = self.lock(spec)?;

        let tmp_path = self.tmp_path(spec);
        let json = serde_json::to_string_pretty(report)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.report_path(spec))?;
        Ok(())
    }

    fn get(&self, spec: &SpecId) -> Result<Option<VerificationReport>> {
        let path = self.report_path(spec);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!(
                    "Corrupted report file at {}: {}. Treating as absent.",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    fn remove(&self, spec: &SpecId) -> Result<()> {
        let _lock = self.lock(spec)?;
        match fs::remove_file(self.report_path(spec)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = fs::remove_file(self.lock_path(spec));
        Ok(())
    }
}

// ============================================================================
// Audit Trail
// ============================================================================

/// The transient failure report of one record.
#[derive(Clone)]
pub struct AuditTrail {
    spec: SpecId,
    store: Arc<dyn ReportStore>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").field("spec", &self.spec).finish()
    }
}

impl AuditTrail {
    /// Audit trail for `spec` backed by `store`.
    pub fn new(spec: SpecId, store: Arc<dyn ReportStore>) -> Self {
        Self { spec, store }
    }

    /// Keep `report` as the record's only failure report.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] for a passing report, or a storage error.
    pub fn record_failure(&self, report: &VerificationReport) -> Result<()> {
        if report.passed() {
            return Err(SpecError::validation(
                "Only failing reports belong in the audit trail",
            ));
        }
        self.store.put(&self.spec, report)?;
        debug!(
            spec = %self.spec,
            failed = ?report.failed_checks(),
            "Recorded verification failure"
        );
        Ok(())
    }

    /// Delete the stored report, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(&self.spec)?;
        debug!(spec = %self.spec, "Cleared verification report");
        Ok(())
    }

    /// The stored report, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn current(&self) -> Result<Option<VerificationReport>> {
        self.store.get(&self.spec)
    }

    /// Record this trail belongs to.
    #[must_use]
    pub fn spec(&self) -> &SpecId {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::CheckResult;
    use tempfile::TempDir;

    fn spec() -> SpecId {
        SpecId::new(1, "login").unwrap()
    }

    fn failing(diag: &str) -> VerificationReport {
        VerificationReport::new(
            "rust",
            vec![CheckResult::pass("fmt"), CheckResult::fail("test", diag)],
        )
    }

    fn passing() -> VerificationReport {
        VerificationReport::new("rust", vec![CheckResult::pass("fmt")])
    }

    fn lifecycle(store: Arc<dyn ReportStore>) {
        let trail = AuditTrail::new(spec(), store);
        assert!(trail.current().unwrap().is_none());

        trail.record_failure(&failing("first")).unwrap();
        trail.record_failure(&failing("second")).unwrap();
        let stored = trail.current().unwrap().unwrap();
        assert_eq!(stored.checks.len(), 2);
        assert_eq!(stored.checks[1].diagnostic.as_deref(), Some("second"));

        trail.clear().unwrap();
        assert!(trail.current().unwrap().is_none());
        trail.clear().unwrap();
    }

    #[test]
    fn test_memory_lifecycle() {
        lifecycle(Arc::new(MemoryReportStore::new()));
    }

    #[test]
    fn test_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        lifecycle(Arc::new(FileReportStore::new(dir.path().join("reports"))));
    }

    #[test]
    fn test_passing_report_is_rejected() {
        let trail = AuditTrail::new(spec(), Arc::new(MemoryReportStore::new()));
        assert!(trail.record_failure(&passing()).is_err());
        assert!(trail.current().unwrap().is_none());
    }

    #[test]
    fn test_file_store_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = FileReportStore::new(dir.path());
        store.put(&spec(), &failing("x")).unwrap();
        assert!(store.report_path(&spec()).exists());
        store.remove(&spec()).unwrap();
        assert!(!store.report_path(&spec()).exists());
    }

    #[test]
    fn test_corrupted_report_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileReportStore::new(dir.path());
        fs::write(store.report_path(&spec()), "{not json").unwrap();
        assert!(store.get(&spec()).unwrap().is_none());
    }

    #[test]
    fn test_trails_are_per_record() {
        let store: Arc<dyn ReportStore> = Arc::new(MemoryReportStore::new());
        let a = AuditTrail::new(spec(), Arc::clone(&store));
        let b = AuditTrail::new(SpecId::new(2, "other").unwrap(), store);
        a.record_failure(&failing("a")).unwrap();
        assert!(b.current().unwrap().is_none());
        b.clear().unwrap();
        assert!(a.current().unwrap().is_some());
    }
}
