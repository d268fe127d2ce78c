//! Append-only journal of record transitions.
//!
//! Every status change of every record is appended to a JSONL file as a
//! hash-chained entry, so the history of a project can be reconstructed and
//! tampering detected after the fact.
//!
//! - Each entry carries the SHA-256 of its own fields and of its predecessor
//! - The first entry chains to a fixed genesis hash
//! - [`TransitionJournal::verify`] walks the whole chain
//!
//! # Example
//!
//! ```rust,ignore
//! use specflow::journal::TransitionJournal;
//!
//! let journal = TransitionJournal::new(".specflow/journal.jsonl");
//! journal.append(&record.id, &record.history[0])?;
//! assert!(journal.verify()?.is_valid);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, SpecError};
use crate::record::{SpecId, SpecStatus, StatusTransition};

/// Seed for the hash the first entry chains to.
const GENESIS_SEED: &str = "specflow-journal-genesis-v1";

// ============================================================================
// Entries
// ============================================================================

/// One journaled transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, from 0
    pub sequence: u64,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Record that transitioned
    pub spec: String,
    /// State before
    pub from: SpecStatus,
    /// State after
    pub to: SpecStatus,
    /// Reason given for the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Hash of the previous entry (hex)
    pub previous_hash: String,
    /// Hash of this entry's other fields (hex)
    pub hash: String,
}

impl JournalEntry {
    /// Hash over every field except `hash`.
    ///
    /// Each variable-length field is prefixed with its length, so moving
    /// bytes from one field into its neighbour changes the hash.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        field(&mut hasher, self.timestamp.to_rfc3339().as_bytes());
        field(&mut hasher, self.spec.as_bytes());
        field(&mut hasher, self.from.to_string().as_bytes());
        field(&mut hasher, self.to.to_string().as_bytes());
        match &self.reason {
            Some(reason) => {
                hasher.update([1u8]);
                field(&mut hasher, reason.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        field(&mut hasher, self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash matches the contents.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Result of walking the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalVerification {
    /// Whether the whole chain checked out
    pub is_valid: bool,
    /// Entries checked before stopping
    pub entries_verified: u64,
    /// Sequence of the first bad entry
    pub first_invalid_entry: Option<u64>,
    /// What was wrong with it
    pub error_description: Option<String>,
}

impl JournalVerification {
    fn valid(entries_verified: u64) -> Self {
        Self {
            is_valid: true,
            entries_verified,
            first_invalid_entry: None,
            error_description: None,
        }
    }

    fn invalid(entries_verified: u64, entry: u64, error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            entries_verified,
            first_invalid_entry: Some(entry),
            error_description: Some(error.into()),
        }
    }
}

// ============================================================================
// Journal
// ============================================================================

/// Hash-chained JSONL journal at a fixed path.
#[derive(Debug, Clone)]
pub struct TransitionJournal {
    path: PathBuf,
}

impl TransitionJournal {
    /// Journal stored at `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one transition of `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or written.
    pub fn append(&self, spec: &SpecId, transition: &StatusTransition) -> Result<JournalEntry> {
        let mut entries = self.append_all(spec, std::slice::from_ref(transition))?;
        entries
            .pop()
            .ok_or_else(|| SpecError::Other(anyhow::anyhow!("journal append wrote nothing")))
    }

    /// Append several transitions of `spec` in order, under one file lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or written.
    pub fn append_all(
        &self,
        spec: &SpecId,
        transitions: &[StatusTransition],
    ) -> Result<Vec<JournalEntry>> {
        if transitions.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            SpecError::Other(anyhow::anyhow!("Failed to lock journal: {e}"))
        })?;

        let existing = self.entries()?;
        let mut sequence = existing.last().map_or(0, |e| e.sequence + 1);
        let mut previous_hash = existing
            .last()
            .map_or_else(genesis_hash, |e| e.hash.clone());

        let mut written = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let mut entry = JournalEntry {
                sequence,
                timestamp: transition.timestamp,
                spec: spec.to_string(),
                from: transition.from,
                to: transition.to,
                reason: transition.reason.clone(),
                previous_hash,
                hash: String::new(),
            };
            entry.hash = entry.compute_hash();
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;

            debug!(
                sequence,
                spec = %spec,
                from = %entry.from,
                to = %entry.to,
                "Journaled transition"
            );
            previous_hash = entry.hash.clone();
            sequence += 1;
            written.push(entry);
        }
        file.sync_all()?;
        FileExt::unlock(&file)?;

        Ok(written)
    }

    /// All entries, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line does not parse.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line).map_err(|e| {
                SpecError::validation(format!(
                    "Failed to parse journal entry at line {}: {e}",
                    line_num + 1
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entries for one record, in order.
    ///
    /// # Errors
    ///
    /// Same as [`TransitionJournal::entries`].
    pub fn entries_for(&self, spec: &SpecId) -> Result<Vec<JournalEntry>> {
        let id = spec.to_string();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.spec == id)
            .collect())
    }

    /// Walk the chain and report the first inconsistency.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub fn verify(&self) -> Result<JournalVerification> {
        let entries = self.entries()?;
        let genesis = genesis_hash();

        for (i, entry) in entries.iter().enumerate() {
            let index = i as u64;
            if entry.sequence != index {
                return Ok(JournalVerification::invalid(
                    index,
                    entry.sequence,
                    format!("Sequence mismatch: expected {i}, got {}", entry.sequence),
                ));
            }
            if !entry.verify_hash() {
                return Ok(JournalVerification::invalid(
                    index,
                    entry.sequence,
                    "Entry hash verification failed",
                ));
            }
            let expected_previous = if i == 0 { &genesis } else { &entries[i - 1].hash };
            if &entry.previous_hash != expected_previous {
                return Ok(JournalVerification::invalid(
                    index,
                    entry.sequence,
                    "Chain hash mismatch: previous_hash doesn't match",
                ));
            }
        }

        Ok(JournalVerification::valid(entries.len() as u64))
    }
}

fn genesis_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(GENESIS_SEED.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec() -> SpecId {
        SpecId::new(1, "login").unwrap()
    }

    fn journal(dir: &TempDir) -> TransitionJournal {
        TransitionJournal::new(dir.path().join(".specflow/journal.jsonl"))
    }

    fn lifecycle() -> Vec<StatusTransition> {
        vec![
            StatusTransition::new(SpecStatus::Drafting, SpecStatus::Reviewed, Some("go".into())),
            StatusTransition::new(SpecStatus::Reviewed, SpecStatus::Implementing, None),
            StatusTransition::new(SpecStatus::Implementing, SpecStatus::Verifying, None),
        ]
    }

    #[test]
    fn test_empty_journal_is_valid() {
        let dir = TempDir::new().unwrap();
        let result = journal(&dir).verify().unwrap();
        assert!(result.is_valid);
        assert_eq!(result.entries_verified, 0);
    }

    #[test]
    fn test_entries_form_a_chain() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir);
        journal.append_all(&spec(), &lifecycle()).unwrap();
        journal
            .append(
                &SpecId::new(2, "billing").unwrap(),
                &StatusTransition::new(SpecStatus::Drafting, SpecStatus::Blocked, None),
            )
            .unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].previous_hash, genesis_hash());
        for pair in entries.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }
        assert_eq!(journal.entries_for(&spec()).unwrap().len(), 3);
        assert!(journal.verify().unwrap().is_valid);
    }

    #[test]
    fn test_tampered_entry_is_detected() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir);
        journal.append_all(&spec(), &lifecycle()).unwrap();

        let content = fs::read_to_string(journal.path()).unwrap();
        let tampered = content.replacen("\"Verifying\"", "\"Completed\"", 1);
        fs::write(journal.path(), tampered).unwrap();

        let result = journal.verify().unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.first_invalid_entry, Some(2));
    }

    #[test]
    fn test_broken_chain_is_detected() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir);
        journal.append_all(&spec(), &lifecycle()).unwrap();

        let content = fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        let mut entry: JournalEntry = serde_json::from_str(lines[1]).unwrap();
        entry.previous_hash = "0".repeat(64);
        entry.hash = entry.compute_hash();
        let rewritten = format!(
            "{}\n{}\n{}\n",
            lines[0],
            serde_json::to_string(&entry).unwrap(),
            lines[2]
        );
        fs::write(journal.path(), rewritten).unwrap();

        let result = journal.verify().unwrap();
        assert!(!result.is_valid);
        assert!(result.error_description.unwrap().contains("Chain hash"));
    }

    #[test]
    fn test_shifting_bytes_between_fields_changes_hash() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir);
        journal.append_all(&spec(), &lifecycle()).unwrap();
        let original = journal.entries().unwrap().remove(1);

        let mut shifted = original.clone();
        shifted.reason = Some("a".to_string());
        shifted.previous_hash = format!("a{}", original.previous_hash);
        let mut moved = original.clone();
        moved.reason = Some("aa".to_string());
        moved.previous_hash = original.previous_hash.clone();
        assert_ne!(shifted.compute_hash(), moved.compute_hash());

        let mut empty_reason = original.clone();
        empty_reason.reason = Some(String::new());
        assert_eq!(original.reason, None);
        assert_ne!(empty_reason.compute_hash(), original.compute_hash());
    }

    #[test]
    fn test_dropped_entry_breaks_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir);
        journal.append_all(&spec(), &lifecycle()).unwrap();

        let content = fs::read_to_string(journal.path()).unwrap();
        let kept: Vec<&str> = content.lines().filter(|l| !l.contains("\"sequence\":1")).collect();
        fs::write(journal.path(), kept.join("\n")).unwrap();

        let result = journal.verify().unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.first_invalid_entry, Some(2));
    }
}
