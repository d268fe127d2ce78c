//! specflow - verification-gated specification workflow
//!
//! Thin command-line entry point over the `specflow` library.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use specflow::ledger::TaskId;
use specflow::record::{Feature, FeatureId, Priority, RecordMutation, SpecStatus};
use specflow::verification::ChangeSet;
use specflow::workflow::{Actor, FixedReviewer, ReviewVerdict, Verdict};
use specflow::{Project, Result, SpecError, SpecificationRecord};

#[derive(Parser)]
#[command(name = "specflow")]
#[command(version = "0.1.0")]
#[command(about = "Verification-gated specification workflow", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new draft record
    New {
        /// Slug (lowercase kebab-case)
        slug: String,

        /// Description of the work
        #[arg(short, long, default_value = "")]
        description: String,

        /// Priority
        #[arg(long, value_enum, default_value = "medium")]
        priority: Priority,

        /// Records this one builds on
        #[arg(long = "builds-on", value_name = "SPEC")]
        builds_on: Vec<String>,
    },

    /// Manage a record's task ledgers
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Manage a record's features
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },

    /// Submit a draft for review with a verdict
    Review {
        /// Record reference
        spec: String,

        /// Verdict: go, stop or clarify
        #[arg(long)]
        verdict: Verdict,

        /// Reviewer's reasoning
        #[arg(long)]
        reason: Option<String>,
    },

    /// Start implementing a reviewed record
    Implement {
        /// Record reference
        spec: String,
    },

    /// Run the verification battery for a stack
    Verify {
        /// Record reference
        spec: String,

        /// Stack key (detected from PATHS when omitted)
        #[arg(long)]
        stack: Option<String>,

        /// Changed paths, relative to the project
        paths: Vec<PathBuf>,
    },

    /// Return a failing record to implementation, or abandon the fix loop
    Fix {
        /// Record reference
        spec: String,

        /// Stop fixing and park the record with this reason
        #[arg(long, value_name = "REASON")]
        abandon: Option<String>,
    },

    /// Park a record until a human resumes it
    Block {
        /// Record reference
        spec: String,

        /// Why the record is blocked
        reason: String,
    },

    /// Resume a blocked record or a halted review with new input
    Resume {
        /// Record reference
        spec: String,

        /// The clarification
        input: String,
    },

    /// Annotate a record with a related record
    Relate {
        /// Record reference
        spec: String,

        /// Related record reference
        other: String,
    },

    /// Show a record
    Show {
        /// Record reference
        spec: String,

        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },

    /// List records
    List {
        /// Only records in this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Print a record's ancestors
    Lineage {
        /// Record reference
        spec: String,
    },

    /// Inspect the transition journal
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Append a task
    Add {
        /// Record reference
        spec: String,

        /// Task description
        description: String,

        /// Target feature (root ledger when omitted)
        #[arg(long)]
        feature: Option<FeatureId>,
    },

    /// Mark a task done
    Done {
        /// Record reference
        spec: String,

        /// Task id (`3` or `#3`)
        task: TaskId,

        /// Target feature (root ledger when omitted)
        #[arg(long)]
        feature: Option<FeatureId>,
    },
}

#[derive(Subcommand)]
enum FeatureAction {
    /// Attach a feature with its own ledger
    Add {
        /// Record reference
        spec: String,

        /// Feature id (lowercase kebab-case)
        id: FeatureId,

        /// Description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Sibling features this one depends on
        #[arg(long = "depends-on", value_name = "FEATURE")]
        depends_on: Vec<FeatureId>,
    },
}

#[derive(Subcommand)]
enum JournalAction {
    /// Verify the hash chain
    Verify,

    /// Print journal entries
    Show {
        /// Only entries for this record
        #[arg(long)]
        spec: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "specflow=debug,info"
    } else {
        "specflow=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command, project_path).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
    Ok(())
}

async fn run(command: Commands, project_path: PathBuf) -> Result<()> {
    let mut project = Project::open(&project_path)?;

    match command {
        Commands::New {
            slug,
            description,
            priority,
            builds_on,
        } => {
            let builds_on = builds_on
                .iter()
                .map(|r| project.resolve(r))
                .collect::<Result<Vec<_>>>()?;
            let id = project.create(&slug, &description, priority, builds_on)?;
            println!("{} Created {}", "OK".green().bold(), id.to_string().bold());
        }

        Commands::Task { action } => match action {
            TaskAction::Add {
                spec,
                description,
                feature,
            } => {
                let id = project.resolve(&spec)?;
                let mut engine = project.engine(&id)?;
                let task = engine.add_task(Actor::Implementation, feature, description)?;
                project.commit(engine)?;
                println!("{} Added task {} to {}", "OK".green().bold(), task, id);
            }
            TaskAction::Done {
                spec,
                task,
                feature,
            } => {
                let id = project.resolve(&spec)?;
                let mut engine = project.engine(&id)?;
                let changed = engine.complete_task(Actor::Implementation, feature, task)?;
                let counters = engine.record().counters();
                project.commit(engine)?;
                if changed {
                    println!("{} Task {} done", "OK".green().bold(), task);
                } else {
                    println!("{} Task {} was already done", "Note:".yellow(), task);
                }
                println!(
                    "  {}/{} complete ({}%)",
                    counters.completed,
                    counters.total(),
                    counters.completion_percentage
                );
            }
        },

        Commands::Feature { action } => match action {
            FeatureAction::Add {
                spec,
                id: feature_id,
                description,
                depends_on,
            } => {
                let id = project.resolve(&spec)?;
                let feature =
                    Feature::new(feature_id.clone(), description).with_depends_on(depends_on);
                project.apply(&id, RecordMutation::AddFeature(feature))?;
                println!("{} Added feature {} to {}", "OK".green().bold(), feature_id, id);
            }
        },

        Commands::Review {
            spec,
            verdict,
            reason,
        } => {
            let id = project.resolve(&spec)?;
            let mut review = ReviewVerdict::new(verdict);
            if let Some(reason) = reason {
                review = review.with_reasoning(reason);
            }
            let mut engine = project.engine(&id)?;
            engine.submit_for_review(&FixedReviewer::new(review)).await?;
            let record = engine.record().clone();
            project.commit(engine)?;
            print_status(&record);
        }

        Commands::Implement { spec } => {
            let id = project.resolve(&spec)?;
            let mut engine = project.engine(&id)?;
            engine.start_implementation()?;
            let record = engine.record().clone();
            project.commit(engine)?;
            print_status(&record);
        }

        Commands::Verify { spec, stack, paths } => {
            let id = project.resolve(&spec)?;
            let stack = match stack {
                Some(stack) => stack,
                None => {
                    let detected = project.config().stack_detector()?.detect(&paths);
                    let mut detected = detected.into_iter();
                    match (detected.next(), detected.next()) {
                        (Some(only), None) => only,
                        (None, _) => {
                            return Err(SpecError::validation(
                                "No stack detected from the given paths; pass --stack",
                            ))
                        }
                        (Some(_), Some(_)) => {
                            return Err(SpecError::validation(
                                "Paths span several stacks; verify one --stack at a time",
                            ))
                        }
                    }
                }
            };

            let gateway = project.config().build_gateway();
            let change_set = ChangeSet::new(project.root()).with_paths(paths);
            let mut engine = project.engine(&id)?;
            let result = engine.verify(&gateway, &stack, &change_set).await;
            project.commit(engine)?;

            let outcome = result?;
            println!("{}", outcome.report.format());
            if !outcome.report.passed() {
                return Err(SpecError::VerificationFailure {
                    failed: outcome.report.failed_checks(),
                });
            }
            let record = project.registry().get(&id)?;
            print_status(record);
        }

        Commands::Fix { spec, abandon } => {
            let id = project.resolve(&spec)?;
            let mut engine = project.engine(&id)?;
            match abandon {
                Some(reason) => engine.abandon(reason)?,
                None => {
                    engine.resume_fixing()?;
                }
            }
            let record = engine.record().clone();
            project.commit(engine)?;
            print_status(&record);
        }

        Commands::Block { spec, reason } => {
            let id = project.resolve(&spec)?;
            let mut engine = project.engine(&id)?;
            engine.block(reason)?;
            let record = engine.record().clone();
            project.commit(engine)?;
            print_status(&record);
        }

        Commands::Resume { spec, input } => {
            let id = project.resolve(&spec)?;
            let mut engine = project.engine(&id)?;
            engine.resume(input)?;
            let record = engine.record().clone();
            project.commit(engine)?;
            print_status(&record);
        }

        Commands::Relate { spec, other } => {
            let id = project.resolve(&spec)?;
            let other = project.resolve(&other)?;
            project.apply(&id, RecordMutation::AddRelatedSpec(other.clone()))?;
            println!("{} {} relates to {}", "OK".green().bold(), id, other);
        }

        Commands::Show { spec, json } => {
            let id = project.resolve(&spec)?;
            let record = project.registry().get(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(record)?);
            } else {
                print_record(record);
                if let Some(report) = project.current_report(&id)? {
                    println!();
                    println!("{}", report.format());
                }
            }
        }

        Commands::List { status } => {
            let status = status.map(|s| parse_status(&s)).transpose()?;
            let mut shown = 0;
            for record in project.registry().iter() {
                if status.is_some_and(|s| s != record.status) {
                    continue;
                }
                let counters = record.counters();
                println!(
                    "{:<28} {:<13} {:<9} {:>3}%",
                    record.id.to_string(),
                    status_label(record.status),
                    record.priority.to_string(),
                    counters.completion_percentage
                );
                shown += 1;
            }
            if shown == 0 {
                println!("{}", "No records".dimmed());
            }
        }

        Commands::Lineage { spec } => {
            let id = project.resolve(&spec)?;
            let lineage = project.registry().lineage(&id)?;
            println!("{}", id.to_string().bold());
            if lineage.is_empty() {
                println!("  {}", "(no ancestors)".dimmed());
            }
            for ancestor in lineage {
                let record = project.registry().get(&ancestor)?;
                println!("  <- {} [{}]", ancestor, status_label(record.status));
            }
        }

        Commands::Journal { action } => match action {
            JournalAction::Verify => {
                let result = project.journal().verify()?;
                if result.is_valid {
                    println!(
                        "{} Journal intact ({} entries)",
                        "OK".green().bold(),
                        result.entries_verified
                    );
                } else {
                    return Err(SpecError::validation(format!(
                        "Journal broken at entry {}: {}",
                        result.first_invalid_entry.unwrap_or_default(),
                        result.error_description.unwrap_or_default()
                    )));
                }
            }
            JournalAction::Show { spec } => {
                let entries = match spec {
                    Some(spec) => {
                        let id = project.resolve(&spec)?;
                        project.journal().entries_for(&id)?
                    }
                    None => project.journal().entries()?,
                };
                for entry in entries {
                    println!(
                        "{:>4} {} {} {} -> {}{}",
                        entry.sequence,
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.spec,
                        entry.from,
                        entry.to,
                        entry
                            .reason
                            .as_deref()
                            .map(|r| format!(" ({r})"))
                            .unwrap_or_default()
                    );
                }
            }
        },
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<SpecStatus> {
    let status = match s.to_ascii_lowercase().as_str() {
        "drafting" => SpecStatus::Drafting,
        "reviewed" => SpecStatus::Reviewed,
        "implementing" => SpecStatus::Implementing,
        "verifying" => SpecStatus::Verifying,
        "fixing" => SpecStatus::Fixing,
        "completed" => SpecStatus::Completed,
        "blocked" => SpecStatus::Blocked,
        other => {
            return Err(SpecError::validation(format!("Unknown status '{other}'")));
        }
    };
    Ok(status)
}

fn status_label(status: SpecStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        SpecStatus::Completed => text.green(),
        SpecStatus::Fixing | SpecStatus::Blocked => text.red(),
        SpecStatus::Verifying => text.yellow(),
        _ => text.normal(),
    }
}

fn print_status(record: &SpecificationRecord) {
    println!("{} is {}", record.id.to_string().bold(), status_label(record.status));
    if let Some(obstacle) = &record.obstacle {
        println!("  {} {}", "Obstacle:".yellow(), obstacle);
    }
}

fn print_record(record: &SpecificationRecord) {
    let counters = record.counters();
    println!("{}", record.id.to_string().bold());
    println!("  Status:   {}", status_label(record.status));
    println!("  Priority: {}", record.priority);
    if !record.description.is_empty() {
        println!("  {}", record.description);
    }
    if !record.builds_on.is_empty() {
        let ids: Vec<String> = record.builds_on.iter().map(ToString::to_string).collect();
        println!("  Builds on: {}", ids.join(", "));
    }
    if !record.related_specs.is_empty() {
        let ids: Vec<String> = record.related_specs.iter().map(ToString::to_string).collect();
        println!("  Related:   {}", ids.join(", "));
    }
    if let Some(obstacle) = &record.obstacle {
        println!("  {} {}", "Obstacle:".yellow(), obstacle);
    }
    println!(
        "  Progress: {}/{} ({}%)",
        counters.completed,
        counters.total(),
        counters.completion_percentage
    );

    for task in record.ledger.tasks() {
        print_task(task.done, &task.id.to_string(), &task.description);
    }
    for feature in &record.features {
        let c = feature.ledger.counters();
        println!(
            "  Feature {} ({}%){}",
            feature.id.to_string().bold(),
            c.completion_percentage,
            if feature.depends_on.is_empty() {
                String::new()
            } else {
                let deps: Vec<String> =
                    feature.depends_on.iter().map(ToString::to_string).collect();
                format!(" depends on {}", deps.join(", "))
            }
        );
        for task in feature.ledger.tasks() {
            print_task(task.done, &format!("  {}", task.id), &task.description);
        }
    }
}

fn print_task(done: bool, id: &str, description: &str) {
    let mark = if done { "[x]".green() } else { "[ ]".normal() };
    println!("  {mark} {id} {description}");
}
