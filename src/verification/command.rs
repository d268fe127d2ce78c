//! Checks backed by external commands.
//!
//! A [`CommandCheck`] runs one program in the change set's root. Exit status
//! 0 passes; anything else fails with the tail of the tool output as the
//! diagnostic. The child is killed if the check future is dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;

use super::{ChangeSet, Check, CheckOutcome};

/// Lines of tool output kept in a diagnostic.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// A check that shells out to a tool.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    program: String,
    args: Vec<String>,
    append_paths: bool,
    fail_on_output: bool,
}

impl CommandCheck {
    /// Create a check that runs `program args...`.
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            append_paths: false,
            fail_on_output: false,
        }
    }

    /// Create a check from owned arguments (used for configured checks).
    pub fn from_parts(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            append_paths: false,
            fail_on_output: false,
        }
    }

    /// Pass the change set's paths as trailing arguments.
    #[must_use]
    pub fn with_paths(mut self, enabled: bool) -> Self {
        self.append_paths = enabled;
        self
    }

    /// Treat any stdout as failure (for tools like `gofmt -l` that exit 0).
    #[must_use]
    pub fn with_fail_on_output(mut self, enabled: bool) -> Self {
        self.fail_on_output = enabled;
        self
    }

    /// The command line, for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, change_set: &ChangeSet) -> Result<CheckOutcome> {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&change_set.root)
            .kill_on_drop(true);
        if self.append_paths {
            cmd.args(&change_set.paths);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run `{}`", self.command_line()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let printed = self.fail_on_output && !stdout.trim().is_empty();
        let failed = !output.status.success() || printed;
        if failed {
            let combined = format!("{}\n{}", stdout.trim_end(), stderr.trim_end());
            let mut diagnostic = tail(combined.trim(), DIAGNOSTIC_TAIL_LINES);
            if diagnostic.is_empty() {
                diagnostic = format!(
                    "`{}` exited with {}",
                    self.command_line(),
                    output.status
                );
            }
            Ok(CheckOutcome::fail(diagnostic))
        } else {
            Ok(CheckOutcome::pass())
        }
    }

    fn required_tool(&self) -> Option<&str> {
        Some(&self.program)
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
