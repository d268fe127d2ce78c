//! Structured verification results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pass/fail outcome of a check or a whole battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Check succeeded
    Pass,
    /// Check failed or could not run
    Fail,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name, unique within a battery
    pub name: String,
    /// Pass or Fail
    pub outcome: Outcome,
    /// Tool output or crash reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Wall-clock time spent
    #[serde(default)]
    pub duration_ms: u64,
}

impl CheckResult {
    /// A passing result.
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::Pass,
            diagnostic: None,
            duration_ms: 0,
        }
    }

    /// A failing result with a diagnostic.
    pub fn fail(name: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::Fail,
            diagnostic: Some(diagnostic.into()),
            duration_ms: 0,
        }
    }

    /// Add duration.
    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Whether the check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Format a one-line summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::Pass => format!("✅ {}: PASSED ({}ms)", self.name, self.duration_ms),
            Outcome::Fail => format!("❌ {}: FAILED ({}ms)", self.name, self.duration_ms),
        }
    }
}

/// Full result of one verification run for one stack.
///
/// Regenerated from scratch on every run; never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Stack the battery ran for
    pub stack_key: String,
    /// When the run finished
    pub timestamp: DateTime<Utc>,
    /// Check results in battery order
    pub checks: Vec<CheckResult>,
    /// Pass iff every check passed
    pub outcome: Outcome,
}

impl VerificationReport {
    /// Build a report, deriving the overall outcome from the checks.
    ///
    /// An empty battery passes.
    pub fn new(stack_key: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let outcome = if checks.iter().all(CheckResult::passed) {
            Outcome::Pass
        } else {
            Outcome::Fail
        };
        Self {
            stack_key: stack_key.into(),
            timestamp: Utc::now(),
            checks,
            outcome,
        }
    }

    /// Whether the whole battery passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Names of failing checks, in battery order.
    #[must_use]
    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Total time across all checks in milliseconds.
    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.checks.iter().map(|c| c.duration_ms).sum()
    }

    /// Format the report for display.
    #[must_use]
    pub fn format(&self) -> String {
        let mut output = format!("## Verification: {}\n\n", self.stack_key);

        for check in &self.checks {
            output.push_str(&check.summary());
            output.push('\n');
            if let Some(ref diag) = check.diagnostic {
                for line in diag.lines() {
                    output.push_str("    ");
                    output.push_str(line);
                    output.push('\n');
                }
            }
        }

        output.push_str(&format!("\n**Total time**: {}ms\n", self.total_duration_ms()));
        if self.passed() {
            output.push_str("\n✅ **All checks passed**\n");
        } else {
            output.push_str(&format!(
                "\n❌ **{} check(s) failed**: {}\n",
                self.failed_checks().len(),
                self.failed_checks().join(", ")
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_derived_from_checks() {
        let report = VerificationReport::new(
            "rust",
            vec![CheckResult::pass("fmt"), CheckResult::fail("test", "1 failed")],
        );
        assert_eq!(report.outcome, Outcome::Fail);
        assert_eq!(report.failed_checks(), vec!["test"]);
    }

    #[test]
    fn test_empty_battery_passes() {
        assert!(VerificationReport::new("rust", vec![]).passed());
    }

    #[test]
    fn test_format_lists_diagnostics() {
        let report = VerificationReport::new(
            "go",
            vec![
                CheckResult::pass("vet").with_duration(5),
                CheckResult::fail("test", "FAIL: TestParse\nexpected 2").with_duration(10),
            ],
        );
        let text = report.format();
        assert!(text.contains("✅ vet: PASSED (5ms)"));
        assert!(text.contains("    expected 2"));
        assert!(text.contains("**Total time**: 15ms"));
        assert!(text.contains("1 check(s) failed"));
    }
}
