//! Default check batteries and stack detection.
//!
//! Each known stack gets the standard battery in a fixed order:
//! format, lint, type-check, test, build, security.
//!
//! | Stack        | Tooling                                              |
//! |--------------|------------------------------------------------------|
//! | `rust`       | cargo fmt / clippy / check / test / build, cargo-audit |
//! | `python`     | ruff, mypy, pytest, compileall, bandit               |
//! | `typescript` | prettier, eslint, tsc, npm test / build / audit      |
//! | `go`         | gofmt, golangci-lint, go vet / test / build, govulncheck |

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::{Check, CommandCheck};
use crate::error::{Result, SpecError};

/// Stack keys with a built-in battery.
pub const KNOWN_STACKS: &[&str] = &["rust", "python", "typescript", "go"];

/// Standard battery for a stack, or `None` for an unknown key.
#[must_use]
pub fn default_battery(stack: &str) -> Option<Vec<Arc<dyn Check>>> {
    let checks: Vec<CommandCheck> = match stack {
        "rust" => vec![
            CommandCheck::new("format", "cargo", &["fmt", "--all", "--", "--check"]),
            CommandCheck::new(
                "lint",
                "cargo",
                &["clippy", "--all-targets", "--", "-D", "warnings"],
            ),
            CommandCheck::new("type-check", "cargo", &["check", "--all-targets"]),
            CommandCheck::new("test", "cargo", &["test"]),
            CommandCheck::new("build", "cargo", &["build"]),
            CommandCheck::new("security", "cargo", &["audit"]),
        ],
        "python" => vec![
            CommandCheck::new("format", "ruff", &["format", "--check", "."]),
            CommandCheck::new("lint", "ruff", &["check", "."]),
            CommandCheck::new("type-check", "mypy", &["."]),
            CommandCheck::new("test", "pytest", &["-q"]),
            CommandCheck::new("build", "python3", &["-m", "compileall", "-q", "."]),
            CommandCheck::new("security", "bandit", &["-r", ".", "-q"]),
        ],
        "typescript" => vec![
            CommandCheck::new("format", "npx", &["prettier", "--check", "."]),
            CommandCheck::new("lint", "npx", &["eslint", "."]),
            CommandCheck::new("type-check", "npx", &["tsc", "--noEmit"]),
            CommandCheck::new("test", "npm", &["test", "--silent"]),
            CommandCheck::new("build", "npm", &["run", "build"]),
            CommandCheck::new("security", "npm", &["audit", "--audit-level=high"]),
        ],
        "go" => vec![
            CommandCheck::new("format", "gofmt", &["-l", "."]).with_fail_on_output(true),
            CommandCheck::new("lint", "golangci-lint", &["run"]),
            CommandCheck::new("type-check", "go", &["vet", "./..."]),
            CommandCheck::new("test", "go", &["test", "./..."]),
            CommandCheck::new("build", "go", &["build", "./..."]),
            CommandCheck::new("security", "govulncheck", &["./..."]),
        ],
        _ => return None,
    };

    Some(
        checks
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn Check>)
            .collect(),
    )
}

/// Default path globs that put a changed file into a stack.
#[must_use]
pub fn default_globs(stack: &str) -> &'static [&'static str] {
    match stack {
        "rust" => &["**/*.rs", "**/Cargo.toml", "**/Cargo.lock"],
        "python" => &["**/*.py", "**/pyproject.toml", "**/requirements*.txt"],
        "typescript" => &[
            "**/*.ts",
            "**/*.tsx",
            "**/*.js",
            "**/*.jsx",
            "**/package.json",
            "**/tsconfig.json",
        ],
        "go" => &["**/*.go", "**/go.mod", "**/go.sum"],
        _ => &[],
    }
}

/// Maps changed paths to the stack keys whose verification they require.
#[derive(Debug, Clone)]
pub struct StackDetector {
    matchers: BTreeMap<String, GlobSet>,
}

impl StackDetector {
    /// Detector for the built-in stacks only.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in globs; the `Result` mirrors
    /// [`StackDetector::with_globs`].
    pub fn standard() -> Result<Self> {
        Self::with_globs(BTreeMap::new())
    }

    /// Detector for built-in stacks plus `extra` globs per stack key.
    ///
    /// Extra globs for a known stack are added to its defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Config`] for an invalid glob.
    pub fn with_globs(extra: BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut patterns: BTreeMap<String, Vec<String>> = KNOWN_STACKS
            .iter()
            .map(|s| {
                (
                    (*s).to_string(),
                    default_globs(s).iter().map(|g| (*g).to_string()).collect(),
                )
            })
            .collect();
        for (stack, globs) in extra {
            patterns.entry(stack).or_default().extend(globs);
        }

        let mut matchers = BTreeMap::new();
        for (stack, globs) in patterns {
            let mut builder = GlobSetBuilder::new();
            for pattern in &globs {
                let glob = Glob::new(pattern).map_err(|e| {
                    SpecError::config(format!("Invalid glob '{pattern}' for stack '{stack}': {e}"))
                })?;
                builder.add(glob);
            }
            let set = builder
                .build()
                .map_err(|e| SpecError::config(format!("Invalid globs for '{stack}': {e}")))?;
            matchers.insert(stack, set);
        }

        Ok(Self { matchers })
    }

    /// Stack keys touched by `paths`, sorted.
    pub fn detect<P: AsRef<Path>>(&self, paths: &[P]) -> BTreeSet<String> {
        let mut stacks = BTreeSet::new();
        for path in paths {
            let path = path.as_ref();
            for (stack, set) in &self.matchers {
                if set.is_match(path) {
                    stacks.insert(stack.clone());
                }
            }
        }
        stacks
    }
}
