//! Review seam: the gate between Drafting and Reviewed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpecError;
use crate::record::SpecificationRecord;

/// A reviewer's decision on a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Proceed to implementation
    Go,
    /// Do not proceed
    Stop,
    /// Needs human clarification first
    Clarify,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Go => write!(f, "Go"),
            Verdict::Stop => write!(f, "Stop"),
            Verdict::Clarify => write!(f, "Clarify"),
        }
    }
}

impl FromStr for Verdict {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "go" => Ok(Verdict::Go),
            "stop" => Ok(Verdict::Stop),
            "clarify" => Ok(Verdict::Clarify),
            other => Err(SpecError::validation(format!(
                "Unknown verdict '{other}': expected go, stop or clarify"
            ))),
        }
    }
}

/// Verdict plus the reviewer's optional reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// The decision
    pub verdict: Verdict,
    /// Why, if the reviewer said
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ReviewVerdict {
    /// A verdict without reasoning.
    #[must_use]
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            reasoning: None,
        }
    }

    /// Builder method to attach reasoning.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Anything that can judge a draft: an agent, a human at a prompt, a policy.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Review `record` and return a verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if the reviewer could not produce a verdict. The
    /// record is left untouched in that case.
    async fn review(&self, record: &SpecificationRecord) -> anyhow::Result<ReviewVerdict>;
}

/// Reviewer that always returns the same verdict.
///
/// Used by the CLI, where the verdict is supplied on the command line.
#[derive(Debug, Clone)]
pub struct FixedReviewer {
    verdict: ReviewVerdict,
}

impl FixedReviewer {
    /// Reviewer returning `verdict`.
    #[must_use]
    pub fn new(verdict: ReviewVerdict) -> Self {
        Self { verdict }
    }
}

#[async_trait]
impl Reviewer for FixedReviewer {
    async fn review(&self, _record: &SpecificationRecord) -> anyhow::Result<ReviewVerdict> {
        Ok(self.verdict.clone())
    }
}
