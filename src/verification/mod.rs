//! Verification gateway: runs a stack's check battery and normalizes the
//! results into a [`VerificationReport`].
//!
//! The gateway always runs every check in the battery, even after a failure,
//! so one report carries the full failure picture for a Fix cycle. Check
//! order is the registration order and is preserved in the report whether
//! checks run sequentially or concurrently.
//!
//! A check that errors, panics, or exceeds its timeout is recorded as a
//! `Fail` with the reason as diagnostic. A check whose required tool is not
//! on `PATH` is recorded the same way rather than skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! use specflow::verification::{ChangeSet, GatewayConfig, VerificationGateway};
//!
//! let gateway = VerificationGateway::with_defaults(GatewayConfig::default());
//! let report = gateway.run("rust", &ChangeSet::new(".")).await?;
//! println!("{}", report.format());
//! ```

mod command;
mod report;
pub mod stacks;

pub use command::CommandCheck;
pub use report::{CheckResult, Outcome, VerificationReport};
pub use stacks::{default_battery, StackDetector, KNOWN_STACKS};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Result, SpecError};

// ============================================================================
// Change Set
// ============================================================================

/// The resources a verification run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Directory checks run in
    pub root: PathBuf,
    /// Changed paths, relative to `root`
    pub paths: Vec<PathBuf>,
}

impl ChangeSet {
    /// A change set rooted at `root` with no explicit paths.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            paths: Vec::new(),
        }
    }

    /// Builder method to list changed paths.
    #[must_use]
    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

// ============================================================================
// Check Trait
// ============================================================================

/// What a single check reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Whether the check passed
    pub passed: bool,
    /// Tool output worth showing to the fixer
    pub diagnostic: Option<String>,
}

impl CheckOutcome {
    /// A passing outcome.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostic: None,
        }
    }

    /// A failing outcome with a diagnostic.
    pub fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// One entry in a verification battery.
///
/// Implementations must be `Send + Sync`; checks may run concurrently with
/// each other. A check future is dropped when it exceeds its timeout, so any
/// process it owns must die with it.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use specflow::verification::{ChangeSet, Check, CheckOutcome};
///
/// struct NoTodo;
///
/// #[async_trait]
/// impl Check for NoTodo {
///     fn name(&self) -> &str { "no-todo" }
///
///     async fn run(&self, change_set: &ChangeSet) -> anyhow::Result<CheckOutcome> {
///         Ok(CheckOutcome::pass())
///     }
/// }
/// ```
#[async_trait]
pub trait Check: Send + Sync {
    /// Name shown in the report.
    fn name(&self) -> &str;

    /// Run the check.
    ///
    /// # Errors
    ///
    /// Returns an error if the check could not execute (not if it failed).
    async fn run(&self, change_set: &ChangeSet) -> anyhow::Result<CheckOutcome>;

    /// External tool that must be on `PATH`, if any.
    fn required_tool(&self) -> Option<&str> {
        None
    }
}

/// Checks if a tool binary is available in the system PATH.
#[must_use]
pub fn is_tool_available(tool_name: &str) -> bool {
    which::which(tool_name).is_ok()
}

// ============================================================================
// Verifier Trait
// ============================================================================

/// Seam between the workflow engine and whatever runs verification.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Run the battery for `stack` over `change_set`.
    ///
    /// # Errors
    ///
    /// Returns an error only when no battery exists for `stack`; failing
    /// checks are reported inside the report.
    async fn run(&self, stack: &str, change_set: &ChangeSet) -> Result<VerificationReport>;
}

// ============================================================================
// Gateway Configuration
// ============================================================================

/// Configuration for the verification gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Timeout for each check.
    pub check_timeout: Duration,
    /// Run checks concurrently (order in the report is unaffected).
    pub concurrent_checks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(600),
            concurrent_checks: false,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-check timeout.
    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Enable/disable concurrent check execution.
    #[must_use]
    pub fn with_concurrent_checks(mut self, enabled: bool) -> Self {
        self.concurrent_checks = enabled;
        self
    }
}

// ============================================================================
// Verification Gateway
// ============================================================================

/// Runs registered batteries per stack key.
#[derive(Clone, Default)]
pub struct VerificationGateway {
    batteries: BTreeMap<String, Vec<Arc<dyn Check>>>,
    config: GatewayConfig,
}

impl std::fmt::Debug for VerificationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let batteries: BTreeMap<&str, Vec<&str>> = self
            .batteries
            .iter()
            .map(|(k, v)| (k.as_str(), v.iter().map(|c| c.name()).collect()))
            .collect();
        f.debug_struct("VerificationGateway")
            .field("batteries", &batteries)
            .field("config", &self.config)
            .finish()
    }
}

impl VerificationGateway {
    /// Gateway with no batteries.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            batteries: BTreeMap::new(),
            config,
        }
    }

    /// Gateway with the standard battery for every known stack.
    #[must_use]
    pub fn with_defaults(config: GatewayConfig) -> Self {
        let mut gateway = Self::new(config);
        for stack in KNOWN_STACKS {
            if let Some(battery) = default_battery(stack) {
                gateway.register(*stack, battery);
            }
        }
        gateway
    }

    /// Replace the battery for `stack`.
    pub fn register(&mut self, stack: impl Into<String>, checks: Vec<Arc<dyn Check>>) {
        self.batteries.insert(stack.into(), checks);
    }

    /// Append a caller-supplied check to `stack`'s battery (creating it if needed).
    pub fn add_check(&mut self, stack: impl Into<String>, check: Arc<dyn Check>) {
        self.batteries.entry(stack.into()).or_default().push(check);
    }

    /// Names of the checks registered for `stack`, in order.
    #[must_use]
    pub fn battery_names(&self, stack: &str) -> Option<Vec<String>> {
        self.batteries
            .get(stack)
            .map(|b| b.iter().map(|c| c.name().to_string()).collect())
    }

    /// Stacks with a registered battery.
    pub fn stacks(&self) -> impl Iterator<Item = &str> {
        self.batteries.keys().map(String::as_str)
    }

    /// The gateway's configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn run_battery(&self, stack: &str, change_set: &ChangeSet) -> Result<VerificationReport> {
        let battery = self
            .batteries
            .get(stack)
            .ok_or_else(|| SpecError::not_found("stack battery", stack))?;

        let timeout = self.config.check_timeout;
        let checks = if self.config.concurrent_checks {
            let futures = battery
                .iter()
                .map(|check| run_single_check(Arc::clone(check), change_set.clone(), timeout));
            join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(battery.len());
            for check in battery {
                let result = run_single_check(Arc::clone(check), change_set.clone(), timeout);
                results.push(result.await);
            }
            results
        };

        let report = VerificationReport::new(stack, checks);
        info!(
            stack = %stack,
            outcome = %report.outcome,
            checks = report.checks.len(),
            failed = report.failed_checks().len(),
            "Verification finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl Verifier for VerificationGateway {
    async fn run(&self, stack: &str, change_set: &ChangeSet) -> Result<VerificationReport> {
        self.run_battery(stack, change_set).await
    }
}

/// Run one check as its own task with a timeout, folding every kind of
/// execution failure into a `Fail` result. A timed-out task is aborted and
/// awaited, so the check's processes are gone before this returns.
async fn run_single_check(
    check: Arc<dyn Check>,
    change_set: ChangeSet,
    timeout: Duration,
) -> CheckResult {
    let name = check.name().to_string();
    let start = Instant::now();

    if let Some(tool) = check.required_tool() {
        if !is_tool_available(tool) {
            warn!(check = %name, tool = %tool, "Required tool not found in PATH");
            return CheckResult::fail(name, format!("required tool '{tool}' not found in PATH"));
        }
    }

    let mut task = tokio::spawn(async move { check.run(&change_set).await });
    let result = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => Ok(joined),
        Err(elapsed) => {
            task.abort();
            let _ = task.await;
            Err(elapsed)
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let result = match result {
        Ok(Ok(Ok(outcome))) => {
            if outcome.passed {
                CheckResult::pass(&name)
            } else {
                CheckResult::fail(
                    &name,
                    outcome.diagnostic.unwrap_or_else(|| "check failed".to_string()),
                )
            }
        }
        Ok(Ok(Err(e))) => CheckResult::fail(&name, format!("check could not run: {e:#}")),
        Ok(Err(e)) => CheckResult::fail(&name, format!("check panicked: {e}")),
        Err(_elapsed) => CheckResult::fail(
            &name,
            format!("check timed out after {}ms", timeout.as_millis()),
        ),
    };

    debug!(check = %name, outcome = %result.outcome, duration_ms, "Check finished");
    result.with_duration(duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted check for tests.
    struct FakeCheck {
        name: String,
        behavior: Behavior,
    }

    #[derive(Clone)]
    enum Behavior {
        Pass,
        Fail(&'static str),
        Error(&'static str),
        Panic,
        Sleep(Duration),
    }

    impl FakeCheck {
        fn arc(name: &str, behavior: Behavior) -> Arc<dyn Check> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
            })
        }
    }

    #[async_trait]
    impl Check for FakeCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _change_set: &ChangeSet) -> anyhow::Result<CheckOutcome> {
            match &self.behavior {
                Behavior::Pass => Ok(CheckOutcome::pass()),
                Behavior::Fail(msg) => Ok(CheckOutcome::fail(*msg)),
                Behavior::Error(msg) => Err(anyhow::anyhow!(*msg)),
                Behavior::Panic => panic!("check exploded"),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(CheckOutcome::pass())
                }
            }
        }
    }

    fn five_checks(fail_at: Option<usize>) -> Vec<Arc<dyn Check>> {
        ["format", "lint", "type-check", "test", "build"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if Some(i) == fail_at {
                    FakeCheck::arc(name, Behavior::Fail("boom"))
                } else {
                    FakeCheck::arc(name, Behavior::Pass)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_checks_run_after_failure() {
        let mut gateway = VerificationGateway::new(GatewayConfig::default());
        gateway.register("rust", five_checks(Some(1)));

        let report = gateway.run("rust", &ChangeSet::new(".")).await.unwrap();
        assert_eq!(report.checks.len(), 5);
        assert_eq!(report.outcome, Outcome::Fail);
        assert_eq!(report.failed_checks(), vec!["lint"]);
        assert_eq!(report.checks[1].diagnostic.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_order_preserved_when_concurrent() {
        let config = GatewayConfig::new().with_concurrent_checks(true);
        let mut gateway = VerificationGateway::new(config);
        gateway.register(
            "rust",
            vec![
                FakeCheck::arc("slow", Behavior::Sleep(Duration::from_millis(50))),
                FakeCheck::arc("fast", Behavior::Pass),
                FakeCheck::arc("broken", Behavior::Fail("x")),
            ],
        );

        let report = gateway.run("rust", &ChangeSet::new(".")).await.unwrap();
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast", "broken"]);
    }

    #[tokio::test]
    async fn test_crashing_checks_are_recorded_as_fail() {
        let mut gateway = VerificationGateway::new(GatewayConfig::default());
        gateway.register(
            "rust",
            vec![
                FakeCheck::arc("errors", Behavior::Error("spawn failed")),
                FakeCheck::arc("panics", Behavior::Panic),
                FakeCheck::arc("ok", Behavior::Pass),
            ],
        );

        let report = gateway.run("rust", &ChangeSet::new(".")).await.unwrap();
        assert_eq!(report.checks.len(), 3);
        assert!(report.checks[0]
            .diagnostic
            .as_deref()
            .unwrap()
            .contains("spawn failed"));
        assert!(report.checks[1]
            .diagnostic
            .as_deref()
            .unwrap()
            .contains("panicked"));
        assert!(report.checks[2].passed());
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_fail() {
        let config = GatewayConfig::new().with_check_timeout(Duration::from_millis(20));
        let mut gateway = VerificationGateway::new(config);
        gateway.register(
            "go",
            vec![FakeCheck::arc("hangs", Behavior::Sleep(Duration::from_millis(300)))],
        );

        let report = gateway.run("go", &ChangeSet::new(".")).await.unwrap();
        assert!(!report.passed());
        assert!(report.checks[0]
            .diagnostic
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_command_does_not_outlive_report() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = GatewayConfig::new().with_check_timeout(Duration::from_millis(50));
        let mut gateway = VerificationGateway::new(config);
        gateway.add_check(
            "shell",
            Arc::new(CommandCheck::new("slow", "sh", &["-c", "sleep 0.8; touch finished"])),
        );

        let report = gateway.run("shell", &ChangeSet::new(dir.path())).await.unwrap();
        assert!(!report.passed());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!dir.path().join("finished").exists());
    }

    #[tokio::test]
    async fn test_missing_tool_is_fail_not_skip() {
        let mut gateway = VerificationGateway::new(GatewayConfig::default());
        gateway.add_check(
            "custom",
            Arc::new(CommandCheck::new("ghost", "definitely-not-a-real-tool-xyz", &[])),
        );

        let report = gateway.run("custom", &ChangeSet::new(".")).await.unwrap();
        assert_eq!(report.checks.len(), 1);
        assert!(report.checks[0]
            .diagnostic
            .as_deref()
            .unwrap()
            .contains("not found in PATH"));
    }

    #[tokio::test]
    async fn test_unknown_stack_is_not_found() {
        let gateway = VerificationGateway::new(GatewayConfig::default());
        let err = gateway.run("cobol", &ChangeSet::new(".")).await.unwrap_err();
        assert!(matches!(err, SpecError::NotFound { .. }));
    }

    #[test]
    fn test_custom_checks_append_to_defaults() {
        let mut gateway = VerificationGateway::with_defaults(GatewayConfig::default());
        gateway.add_check("rust", FakeCheck::arc("no-todo", Behavior::Pass));
        let names = gateway.battery_names("rust").unwrap();
        assert_eq!(names.len(), 7);
        assert_eq!(names.last().map(String::as_str), Some("no-todo"));
    }
}
