//! Project configuration.
//!
//! Configuration is read from the first of these that exists:
//!
//! 1. **Project** - `<project>/.specflow/config.toml`
//! 2. **User** - `<config dir>/specflow/config.toml` (e.g. `~/.config/specflow/config.toml`)
//! 3. Built-in defaults
//!
//! ```toml
//! storage_dir = ".specflow"
//!
//! [verification]
//! check_timeout_ms = 600000
//! concurrent_checks = false
//!
//! [workflow]
//! max_fix_cycles = 5
//!
//! [stacks.rust]
//! globs = ["build.rs"]
//!
//! [[stacks.rust.checks]]
//! name = "no-todo"
//! program = "sh"
//! args = ["-c", "! grep -rn TODO src"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SpecError};
use crate::verification::{
    Check, CommandCheck, GatewayConfig, StackDetector, VerificationGateway,
};
use crate::workflow::WorkflowSettings;

/// Directory name used for project-local state.
pub const DEFAULT_STORAGE_DIR: &str = ".specflow";

/// Config file name inside the storage directory.
pub const CONFIG_FILE: &str = "config.toml";

// ============================================================================
// Sections
// ============================================================================

/// `[verification]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSection {
    /// Per-check timeout in milliseconds
    pub check_timeout_ms: u64,
    /// Run a battery's checks concurrently
    pub concurrent_checks: bool,
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            check_timeout_ms: 600_000,
            concurrent_checks: false,
        }
    }
}

/// `[workflow]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// Fix cycles before a record is parked; absent means unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fix_cycles: Option<u32>,
}

/// A custom check declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Name shown in reports
    pub name: String,
    /// Program to run
    pub program: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Append the change set's paths to the arguments
    #[serde(default)]
    pub pass_paths: bool,
}

impl CheckConfig {
    fn to_check(&self) -> CommandCheck {
        CommandCheck::from_parts(&self.name, &self.program, self.args.clone())
            .with_paths(self.pass_paths)
    }
}

/// `[stacks.<key>]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSection {
    /// Extra path globs that select this stack
    pub globs: Vec<String>,
    /// Checks appended to the stack's battery
    pub checks: Vec<CheckConfig>,
    /// Drop the built-in battery and run only `checks`
    pub replace_defaults: bool,
}

// ============================================================================
// Project Config
// ============================================================================

/// Fully resolved configuration for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Storage directory, relative to the project root
    pub storage_dir: PathBuf,
    /// Verification settings
    pub verification: VerificationSection,
    /// Workflow settings
    pub workflow: WorkflowSection,
    /// Per-stack customisation
    pub stacks: BTreeMap<String, StackSection>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            verification: VerificationSection::default(),
            workflow: WorkflowSection::default(),
            stacks: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Load configuration for `project_dir`, falling back to the user config
    /// and then to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Config`] if a config file exists but is invalid.
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_with_user_path(project_dir, Self::default_user_path().as_deref())
    }

    /// Like [`ProjectConfig::load`] with an explicit user config path.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Config`] if a config file exists but is invalid.
    pub fn load_with_user_path(project_dir: &Path, user_path: Option<&Path>) -> Result<Self> {
        let project_path = Self::project_path(project_dir);
        if project_path.exists() {
            debug!(path = %project_path.display(), "Loading project config");
            return Self::from_file(&project_path);
        }
        if let Some(user_path) = user_path.filter(|p| p.exists()) {
            debug!(path = %user_path.display(), "Loading user config");
            return Self::from_file(user_path);
        }
        debug!("Using default config");
        Ok(Self::default())
    }

    /// Parse and validate one config file.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Config`] for unreadable, unparsable or invalid files.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpecError::config_with_path(format!("Failed to read config: {e}"), path.to_path_buf())
        })?;
        let config: ProjectConfig = toml::from_str(&content).map_err(|e| {
            SpecError::config_with_path(format!("Failed to parse config: {e}"), path.to_path_buf())
        })?;
        config
            .validate()
            .map_err(|message| SpecError::config_with_path(message, path.to_path_buf()))?;
        Ok(config)
    }

    /// Project config path.
    #[must_use]
    pub fn project_path(project_dir: &Path) -> PathBuf {
        project_dir.join(DEFAULT_STORAGE_DIR).join(CONFIG_FILE)
    }

    /// User config path, if the platform has a config dir.
    #[must_use]
    pub fn default_user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("specflow").join(CONFIG_FILE))
    }

    /// Check values that parse but make no sense.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.verification.check_timeout_ms == 0 {
            return Err("verification.check_timeout_ms must be greater than 0".to_string());
        }
        if self.workflow.max_fix_cycles == Some(0) {
            return Err("workflow.max_fix_cycles must be at least 1 when set".to_string());
        }
        for (stack, section) in &self.stacks {
            if stack.trim().is_empty() {
                return Err("stack keys must not be empty".to_string());
            }
            let mut seen = std::collections::HashSet::new();
            for check in &section.checks {
                if check.name.trim().is_empty() || check.program.trim().is_empty() {
                    return Err(format!(
                        "checks in stacks.{stack} need a name and a program"
                    ));
                }
                if !seen.insert(check.name.as_str()) {
                    return Err(format!(
                        "duplicate check '{}' in stacks.{stack}",
                        check.name
                    ));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    /// Absolute storage directory for `project_dir`.
    #[must_use]
    pub fn storage_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.storage_dir)
    }

    /// Where record documents live.
    #[must_use]
    pub fn specs_dir(&self, project_dir: &Path) -> PathBuf {
        self.storage_path(project_dir).join("specs")
    }

    /// Where transient failure reports live.
    #[must_use]
    pub fn reports_dir(&self, project_dir: &Path) -> PathBuf {
        self.storage_path(project_dir).join("reports")
    }

    /// Where per-stack verification lease locks live.
    #[must_use]
    pub fn leases_dir(&self, project_dir: &Path) -> PathBuf {
        self.storage_path(project_dir).join("leases")
    }

    /// The transition journal file.
    #[must_use]
    pub fn journal_path(&self, project_dir: &Path) -> PathBuf {
        self.storage_path(project_dir).join("journal.jsonl")
    }

    // ------------------------------------------------------------------------
    // Derived components
    // ------------------------------------------------------------------------

    /// Gateway tunables.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new()
            .with_check_timeout(Duration::from_millis(self.verification.check_timeout_ms))
            .with_concurrent_checks(self.verification.concurrent_checks)
    }

    /// Workflow tunables.
    #[must_use]
    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings::default().with_max_fix_cycles(self.workflow.max_fix_cycles)
    }

    /// Gateway with the built-in batteries plus configured checks.
    #[must_use]
    pub fn build_gateway(&self) -> VerificationGateway {
        let mut gateway = VerificationGateway::with_defaults(self.gateway_config());
        for (stack, section) in &self.stacks {
            if section.replace_defaults {
                gateway.register(stack.clone(), Vec::new());
            }
            for check in &section.checks {
                gateway.add_check(stack.clone(), Arc::new(check.to_check()) as Arc<dyn Check>);
            }
        }
        gateway
    }

    /// Detector with the built-in globs plus configured ones.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Config`] for an invalid glob.
    pub fn stack_detector(&self) -> Result<StackDetector> {
        let extra = self
            .stacks
            .iter()
            .filter(|(_, s)| !s.globs.is_empty())
            .map(|(k, s)| (k.clone(), s.globs.clone()))
            .collect();
        StackDetector::with_globs(extra)
    }
}
