//! Child feature records.
//!
//! Features form the second (and last) level of a record's tree. Each owns
//! its own ledger and may depend on sibling features.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use super::validate_slug;
use crate::error::{Result, SpecError};
use crate::ledger::TaskLedger;

/// Slug identifying a feature within its parent record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    /// Create a feature id, validating the slug.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] if the slug is not kebab-case.
    pub fn new(slug: impl Into<String>) -> Result<Self> {
        let slug = slug.into();
        validate_slug(&slug)?;
        Ok(Self(slug))
    }

    /// The slug.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeatureId {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A feature owned by a specification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    /// Identity within the parent record
    pub id: FeatureId,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// The feature's checklist
    pub ledger: TaskLedger,
    /// Sibling features that must land first
    #[serde(default)]
    pub depends_on: Vec<FeatureId>,
}

impl Feature {
    /// Create a feature with an empty ledger.
    #[must_use]
    pub fn new(id: FeatureId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            ledger: TaskLedger::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder method to declare sibling dependencies.
    #[must_use]
    pub fn with_depends_on(mut self, deps: Vec<FeatureId>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Check that feature ids are unique and that `depends_on` only references
/// existing siblings without self-references or cycles.
pub(crate) fn validate_features(features: &[Feature]) -> Result<()> {
    let mut ids = HashSet::new();
    for feature in features {
        if !ids.insert(&feature.id) {
            return Err(SpecError::validation(format!(
                "Duplicate feature id: {}",
                feature.id
            )));
        }
    }

    for feature in features {
        for dep in &feature.depends_on {
            if dep == &feature.id {
                return Err(SpecError::validation(format!(
                    "Feature {} depends on itself",
                    feature.id
                )));
            }
            if !ids.contains(dep) {
                return Err(SpecError::not_found("feature", dep));
            }
        }
    }

    let graph: HashMap<&FeatureId, &[FeatureId]> = features
        .iter()
        .map(|f| (&f.id, f.depends_on.as_slice()))
        .collect();

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut marks: HashMap<&FeatureId, u8> = HashMap::new();
    for feature in features {
        if has_cycle(&feature.id, &graph, &mut marks) {
            return Err(SpecError::validation(format!(
                "Feature dependency cycle through {}",
                feature.id
            )));
        }
    }

    Ok(())
}

fn has_cycle<'a>(
    node: &'a FeatureId,
    graph: &HashMap<&'a FeatureId, &'a [FeatureId]>,
    marks: &mut HashMap<&'a FeatureId, u8>,
) -> bool {
    match marks.get(node).copied().unwrap_or(0) {
        1 => return true,
        2 => return false,
        _ => {}
    }
    marks.insert(node, 1);
    let deps = graph.get(node).copied().unwrap_or(&[]);
    for dep in deps {
        if has_cycle(dep, graph, marks) {
            return true;
        }
    }
    marks.insert(node, 2);
    false
}
