//! Integration tests for the specflow CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::{Child, Stdio};
use tempfile::TempDir;

/// Get a Command for the specflow binary
fn specflow() -> Command {
    Command::new(cargo::cargo_bin!("specflow"))
}

/// Command already pointed at `dir`
fn in_project(dir: &Path) -> Command {
    let mut cmd = specflow();
    cmd.arg("--project").arg(dir);
    cmd
}

/// Project whose `shell` stack runs one check that fails while `broken` exists.
fn project_with_shell_stack() -> TempDir {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join(".specflow");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        r#"
[verification]
check_timeout_ms = 30000

[stacks.shell]
globs = ["*.sh"]
replace_defaults = true

[[stacks.shell.checks]]
name = "no-broken"
program = "sh"
args = ["-c", "test ! -f broken || { echo 'broken marker present'; exit 1; }"]
"#,
    )
    .unwrap();
    temp
}

/// Create `login`, review it Go, start implementing and finish one task.
fn ready_to_verify(dir: &Path) {
    in_project(dir)
        .args(["new", "login", "--description", "Add login"])
        .assert()
        .success();
    in_project(dir)
        .args(["review", "1", "--verdict", "go"])
        .assert()
        .success();
    in_project(dir).args(["implement", "login"]).assert().success();
    in_project(dir)
        .args(["task", "add", "001-login", "Render form"])
        .assert()
        .success();
    in_project(dir)
        .args(["task", "done", "1", "1"])
        .assert()
        .success();
}

/// Start the binary in the background, pointed at `dir`.
fn spawn_in_project(dir: &Path, args: &[&str]) -> Child {
    std::process::Command::new(cargo::cargo_bin!("specflow"))
        .arg("--project")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

#[test]
fn test_help() {
    specflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Verification-gated specification workflow"));
}

#[test]
fn test_version() {
    specflow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_new_assigns_sequential_ids() {
    let temp = TempDir::new().unwrap();

    in_project(temp.path())
        .args(["new", "login", "--priority", "high"])
        .assert()
        .success()
        .stdout(predicate::str::contains("001-login"));
    in_project(temp.path())
        .args(["new", "logout", "--builds-on", "login"])
        .assert()
        .success()
        .stdout(predicate::str::contains("002-logout"));

    assert!(temp.path().join(".specflow/specs/001-login.json").exists());
    assert!(temp.path().join(".specflow/specs/002-logout.json").exists());

    in_project(temp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("001-login"))
        .stdout(predicate::str::contains("002-logout"))
        .stdout(predicate::str::contains("high"));
}

#[test]
fn test_new_rejects_bad_slug() {
    let temp = TempDir::new().unwrap();

    in_project(temp.path())
        .args(["new", "Bad_Slug"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid slug"));
}

#[test]
fn test_unknown_record_is_not_found() {
    let temp = TempDir::new().unwrap();

    in_project(temp.path())
        .args(["show", "nothing"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn test_review_stop_keeps_draft_until_resumed() {
    let temp = TempDir::new().unwrap();
    in_project(temp.path()).args(["new", "login"]).assert().success();

    in_project(temp.path())
        .args(["review", "1", "--verdict", "stop", "--reason", "too vague"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drafting"))
        .stdout(predicate::str::contains("too vague"));

    in_project(temp.path())
        .args(["implement", "1"])
        .assert()
        .failure()
        .code(1);

    in_project(temp.path())
        .args(["resume", "1", "Only email login for now"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drafting"))
        .stdout(predicate::str::contains("Obstacle").not());
}

#[test]
fn test_feature_tasks_roll_up() {
    let temp = TempDir::new().unwrap();
    in_project(temp.path()).args(["new", "login"]).assert().success();
    in_project(temp.path())
        .args(["feature", "add", "1", "form", "--description", "Login form"])
        .assert()
        .success();
    in_project(temp.path())
        .args(["task", "add", "1", "Draw fields", "--feature", "form"])
        .assert()
        .success();
    in_project(temp.path())
        .args(["task", "add", "1", "Wire route"])
        .assert()
        .success();

    in_project(temp.path())
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Feature form"))
        .stdout(predicate::str::contains("Draw fields"))
        .stdout(predicate::str::contains("0/2"));
}

#[test]
fn test_task_done_outside_implementing_is_rejected() {
    let temp = TempDir::new().unwrap();
    in_project(temp.path()).args(["new", "login"]).assert().success();
    in_project(temp.path())
        .args(["task", "add", "1", "Render form"])
        .assert()
        .success();

    in_project(temp.path())
        .args(["task", "done", "1", "#1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Drafting"));
}

#[test]
fn test_verify_fail_fix_then_complete() {
    let temp = project_with_shell_stack();
    let dir = temp.path();
    ready_to_verify(dir);

    fs::write(dir.join("broken"), "").unwrap();
    in_project(dir)
        .args(["verify", "1", "--stack", "shell"])
        .assert()
        .failure()
        .code(6)
        .stdout(predicate::str::contains("no-broken"))
        .stdout(predicate::str::contains("broken marker present"));

    assert!(dir.join(".specflow/reports/001-login.json").exists());
    in_project(dir)
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fixing"))
        .stdout(predicate::str::contains("no-broken"));

    in_project(dir)
        .args(["fix", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Implementing"));

    // No ledger progress since the failed attempt.
    in_project(dir)
        .args(["verify", "1", "--stack", "shell"])
        .assert()
        .failure()
        .code(1);

    in_project(dir)
        .args(["task", "add", "1", "Remove marker"])
        .assert()
        .success();
    in_project(dir)
        .args(["task", "done", "1", "2"])
        .assert()
        .success();
    fs::remove_file(dir.join("broken")).unwrap();

    in_project(dir)
        .args(["verify", "1", "run.sh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All checks passed"))
        .stdout(predicate::str::contains("Completed"));

    assert!(!dir.join(".specflow/reports/001-login.json").exists());

    in_project(dir)
        .args(["task", "add", "1", "Too late"])
        .assert()
        .failure()
        .code(3);

    in_project(dir)
        .args(["journal", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Journal intact"));
}

#[test]
fn test_verify_without_detectable_stack() {
    let temp = project_with_shell_stack();
    ready_to_verify(temp.path());

    in_project(temp.path())
        .args(["verify", "1", "notes.txt"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--stack"));
}

#[test]
fn test_block_and_resume() {
    let temp = TempDir::new().unwrap();
    in_project(temp.path()).args(["new", "login"]).assert().success();

    in_project(temp.path())
        .args(["block", "1", "waiting on design"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Blocked"));
    in_project(temp.path())
        .args(["list", "--status", "blocked"])
        .assert()
        .success()
        .stdout(predicate::str::contains("001-login"));
    in_project(temp.path())
        .args(["resume", "1", "design is in"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drafting"));

    in_project(temp.path())
        .args(["journal", "show", "--spec", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drafting -> Blocked"))
        .stdout(predicate::str::contains("Blocked -> Drafting"));
}

#[test]
fn test_lineage_and_relations() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    in_project(dir).args(["new", "base"]).assert().success();
    in_project(dir)
        .args(["new", "middle", "--builds-on", "base"])
        .assert()
        .success();
    in_project(dir)
        .args(["new", "top", "--builds-on", "middle"])
        .assert()
        .success();

    in_project(dir)
        .args(["lineage", "top"])
        .assert()
        .success()
        .stdout(predicate::str::contains("002-middle"))
        .stdout(predicate::str::contains("001-base"));

    in_project(dir)
        .args(["relate", "base", "top"])
        .assert()
        .success();
    in_project(dir)
        .args(["show", "base", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"related_specs\""))
        .stdout(predicate::str::contains("003-top"));
}

#[test]
fn test_tampered_journal_is_reported() {
    let temp = TempDir::new().unwrap();
    in_project(temp.path()).args(["new", "login"]).assert().success();
    in_project(temp.path())
        .args(["block", "1", "hold"])
        .assert()
        .success();

    let journal = temp.path().join(".specflow/journal.jsonl");
    let contents = fs::read_to_string(&journal).unwrap();
    fs::write(&journal, contents.replace("hold", "held")).unwrap();

    in_project(temp.path())
        .args(["journal", "verify"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Journal broken"));
}

#[test]
fn test_concurrent_verifications_of_one_stack() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let config_dir = dir.join(".specflow");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        r#"
[stacks.shell]
globs = ["*.sh"]
replace_defaults = true

[[stacks.shell.checks]]
name = "slow"
program = "sh"
args = ["-c", "sleep 2"]
"#,
    )
    .unwrap();

    for (slug, number) in [("login", "1"), ("logout", "2")] {
        in_project(dir).args(["new", slug]).assert().success();
        in_project(dir)
            .args(["review", number, "--verdict", "go"])
            .assert()
            .success();
        in_project(dir).args(["implement", number]).assert().success();
        in_project(dir)
            .args(["task", "add", number, "Do it"])
            .assert()
            .success();
        in_project(dir)
            .args(["task", "done", number, "1"])
            .assert()
            .success();
    }

    let first = spawn_in_project(dir, &["verify", "1", "--stack", "shell"]);
    let second = spawn_in_project(dir, &["verify", "2", "--stack", "shell"]);
    let mut codes = vec![
        first.wait_with_output().unwrap().status.code(),
        second.wait_with_output().unwrap().status.code(),
    ];
    codes.sort();
    assert_eq!(codes, vec![Some(0), Some(5)]);

    // The loser stays in Implementing and can try again.
    in_project(dir)
        .args(["list", "--status", "implementing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-log"));
    in_project(dir)
        .args(["journal", "verify"])
        .assert()
        .success();
}

#[test]
fn test_concurrent_new_assigns_distinct_ids() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let slugs = ["alpha", "beta", "gamma", "delta"];

    let children: Vec<Child> = slugs
        .iter()
        .map(|slug| spawn_in_project(dir, &["new", slug]))
        .collect();
    for child in children {
        assert!(child.wait_with_output().unwrap().status.success());
    }

    let listed = in_project(dir).arg("list").assert().success();
    let stdout = String::from_utf8(listed.get_output().stdout.clone()).unwrap();
    for ordinal in ["001-", "002-", "003-", "004-"] {
        assert_eq!(stdout.matches(ordinal).count(), 1, "{stdout}");
    }
    for slug in slugs {
        assert!(stdout.contains(slug));
    }
}
