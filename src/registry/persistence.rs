//! Record persistence layer: one pretty-printed JSON document per record.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use super::SpecRegistry;
use crate::error::{Result, SpecError};
use crate::record::{SpecId, SpecificationRecord};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file guarding the whole directory.
const LOCK_FILE: &str = ".specs.lock";

/// Stores records as `<dir>/NNN-slug.json`.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory the documents live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the document path for a record.
    #[must_use]
    pub fn path_for(&self, id: &SpecId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock(&self, exclusive: bool) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&lock_file)
        } else {
            FileExt::lock_shared(&lock_file)
        };
        locked.map_err(|e| {
            SpecError::Other(anyhow::anyhow!("Failed to acquire record lock: {e}"))
        })?;
        Ok(lock_file)
    }

    /// Saves one record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn save(&self, record: &SpecificationRecord) -> Result<()> {
        let _lock = self.lock(true)?;
        self.write_document(record)
    }

    /// Saves every record in `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any document cannot be written.
    pub fn save_all(&self, registry: &SpecRegistry) -> Result<()> {
        let _lock = self.lock(true)?;
        for record in registry.iter() {
            self.write_document(record)?;
        }
        Ok(())
    }

    /// Read-modify-write against the documents on disk.
    ///
    /// Under the exclusive directory lock, reloads every record, runs `f` on
    /// the fresh registry, and writes each record `f` added or changed. The
    /// fresh registry is returned alongside `f`'s value.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns (nothing is written then), a
    /// [`SpecError::Validation`] if a new record would overwrite an existing
    /// document or break the lineage graph, or a storage error.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut SpecRegistry) -> Result<T>,
    ) -> Result<(T, SpecRegistry)> {
        let _lock = self.lock(true)?;
        let before = self.read_all()?;
        let mut registry = before.clone();
        let value = f(&mut registry)?;
        registry.validate_graph()?;

        for record in registry.iter() {
            match before.get(&record.id) {
                Ok(old) if old == record => continue,
                Ok(_) => {}
                Err(_) if self.path_for(&record.id).exists() => {
                    return Err(SpecError::validation(format!(
                        "Refusing to overwrite existing document for {}",
                        record.id
                    )));
                }
                Err(_) => {}
            }
            self.write_document(record)?;
        }
        Ok((value, registry))
    }

    fn write_document(&self, record: &SpecificationRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let tmp_path = self.dir.join(format!("{}.json{TMP_SUFFIX}", record.id));
        let json = serde_json::to_string_pretty(record)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        debug!(spec = %record.id, path = %path.display(), "Saved record");
        Ok(())
    }

    /// Loads one document.
    ///
    /// # Errors
    ///
    /// - [`SpecError::NotFound`] if no document exists for `id`
    /// - [`SpecError::Validation`] if the document is malformed
    pub fn load(&self, id: &SpecId) -> Result<SpecificationRecord> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(SpecError::not_found("record", id));
        }
        let _lock = self.lock(false)?;
        read_document(&path)
    }

    /// Loads every document into a registry and validates the lineage graph.
    ///
    /// A missing directory yields an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] for any malformed document, a file
    /// name that does not match its record id, or a broken lineage graph.
    pub fn load_all(&self) -> Result<SpecRegistry> {
        if !self.dir.exists() {
            return Ok(SpecRegistry::new());
        }
        let _lock = self.lock(false)?;
        self.read_all()
    }

    fn read_all(&self) -> Result<SpecRegistry> {
        let mut registry = SpecRegistry::new();
        if !self.dir.exists() {
            return Ok(registry);
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let record = read_document(&path)?;
            let expected = format!("{}.json", record.id);
            if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                return Err(SpecError::validation(format!(
                    "{} holds record {}",
                    path.display(),
                    record.id
                )));
            }
            registry.insert_loaded(record)?;
        }

        registry.validate_graph()?;
        debug!(count = registry.len(), dir = %self.dir.display(), "Loaded records");
        Ok(registry)
    }
}

fn read_document(path: &Path) -> Result<SpecificationRecord> {
    let contents = fs::read_to_string(path)?;
    let record: SpecificationRecord = serde_json::from_str(&contents).map_err(|e| {
        SpecError::validation(format!("Invalid record document {}: {e}", path.display()))
    })?;
    record.validate()?;
    Ok(record)
}
