//! Course checker CLI
//!
//! The `checker` command tests student submissions and maintains the public
//! course repository.
//!
//! ## Commands
//!
//! - `validate`: Check configs, schedule, templates and pipelines without running anything
//! - `check`: Test the reference solutions (instructor view, verbose)
//! - `grade`: Test a student submission and report scores (student view)
//! - `export`: Publish public files and filled templates
//! - `classify`: Compute a final grade from per-task scores

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use checker_ci::{PipelineResult, Tester, TesterOptions, TestingReport};
use checker_core::config::{CHECKER_CONFIG_FILE, MANYTASK_CONFIG_FILE};
use checker_core::{
    classify, CheckerConfig, Course, Exporter, FileSystemTask, ManytaskConfig, StudentStats,
};

#[derive(Parser)]
#[command(name = "checker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Course checker: test, grade and export programming tasks", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration, schedule, templates and pipelines
    Validate {
        /// Course repository root
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Reference (private) repository root (default: ROOT)
        #[arg(long)]
        reference_root: Option<PathBuf>,
    },

    /// Run task pipelines against the reference solutions
    Check {
        /// Course repository root
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Reference (private) repository root (default: ROOT)
        #[arg(long)]
        reference_root: Option<PathBuf>,

        /// Only check these tasks
        #[arg(short, long)]
        task: Vec<String>,

        /// Only check tasks of these groups
        #[arg(short, long)]
        group: Vec<String>,

        /// Test tasks concurrently
        #[arg(long)]
        parallelize: bool,

        /// Worker count with --parallelize (default: available CPUs)
        #[arg(long)]
        num_processes: Option<usize>,

        /// Log stages without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Test the tasks changed by a submission and report scores
    Grade {
        /// Student repository root
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Reference (private) repository root (default: ROOT)
        #[arg(long)]
        reference_root: Option<PathBuf>,

        /// Run the report pipeline for real
        #[arg(long)]
        submit_score: bool,

        /// Submission time (RFC 3339) used for deadline credit
        #[arg(long)]
        timestamp: Option<String>,

        /// Student username
        #[arg(long, env = "CHECKER_USERNAME", default_value = "")]
        username: String,

        /// Branch name used when HEAD is detached
        #[arg(long, env = "CHECKER_BRANCH")]
        branch: Option<String>,

        /// Score server token, exposed to pipelines as `parameters.report_token`
        #[arg(long, env = "CHECKER_REPORT_TOKEN", hide_env_values = true)]
        report_token: Option<String>,

        /// Log stages without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Export public files into the public repository folder
    Export {
        /// Reference (private) repository root
        #[arg(default_value = ".")]
        reference_root: PathBuf,

        /// Target folder
        #[arg(long, default_value = "./export")]
        export_root: PathBuf,

        /// Commit and push the export
        #[arg(long)]
        commit: bool,

        /// Export into a throwaway folder and never commit
        #[arg(long)]
        dry_run: bool,
    },

    /// Classify a student's scores with the course grade table
    Classify {
        /// YAML or JSON mapping task name → score
        #[arg(long)]
        scores: PathBuf,

        /// Reference (private) repository root
        #[arg(long, default_value = ".")]
        reference_root: PathBuf,

        /// Evaluation time (RFC 3339; default: now)
        #[arg(long)]
        timestamp: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    checker_core::init_tracing(cli.json, level);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Validate {
            root,
            reference_root,
        } => cmd_validate(&root, reference_root.as_deref()),
        Commands::Check {
            root,
            reference_root,
            task,
            group,
            parallelize,
            num_processes,
            dry_run,
        } => {
            let workers = if parallelize {
                num_processes.unwrap_or_else(default_workers)
            } else {
                1
            };
            cmd_check(
                &root,
                reference_root.as_deref(),
                &task,
                &group,
                workers,
                dry_run,
                &cancel,
            )
            .await
        }
        Commands::Grade {
            root,
            reference_root,
            submit_score,
            timestamp,
            username,
            branch,
            report_token,
            dry_run,
        } => {
            let options = GradeOptions {
                submit_score,
                timestamp: timestamp.as_deref().map(parse_timestamp).transpose()?,
                username,
                branch,
                report_token,
                dry_run,
            };
            cmd_grade(&root, reference_root.as_deref(), options, &cancel).await
        }
        Commands::Export {
            reference_root,
            export_root,
            commit,
            dry_run,
        } => cmd_export(&reference_root, &export_root, commit, dry_run),
        Commands::Classify {
            scores,
            reference_root,
            timestamp,
        } => {
            let now = match timestamp.as_deref() {
                Some(raw) => parse_timestamp(raw)?,
                None => Utc::now(),
            };
            cmd_classify(&scores, &reference_root, now).map(|_| ())
        }
    }
}

/// Configs and course layout of one checkout.
struct Loaded {
    checker: CheckerConfig,
    course: Course,
}

/// Read `.checker.yml` and `.manytask.yml` from the reference root and
/// discover the course tree.
fn load_course(root: &Path, reference_root: Option<&Path>) -> Result<Loaded> {
    let reference_root = reference_root.unwrap_or(root);
    let checker_path = reference_root.join(CHECKER_CONFIG_FILE);
    let checker = CheckerConfig::from_yaml(&checker_path)
        .with_context(|| format!("Failed to load {}", checker_path.display()))?;
    let manytask_path = reference_root.join(MANYTASK_CONFIG_FILE);
    let manytask = ManytaskConfig::from_yaml(&manytask_path)
        .with_context(|| format!("Failed to load {}", manytask_path.display()))?;
    let course = Course::discover(manytask.schedule.clone(), root, Some(reference_root))
        .context("Failed to discover course layout")?;
    Ok(Loaded { checker, course })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {raw}"))
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

/// Validate configuration, schedule, templates and pipelines
fn cmd_validate(root: &Path, reference_root: Option<&Path>) -> Result<()> {
    let loaded = load_course(root, reference_root)?;
    validate_loaded(&loaded)?;
    println!("✓ Course configuration is valid");
    Ok(())
}

fn validate_loaded(loaded: &Loaded) -> Result<()> {
    Exporter::new(
        &loaded.course,
        loaded.checker.structure.clone(),
        loaded.checker.export.clone(),
    )
    .validate()
    .context("Course validation failed")?;

    let options = TesterOptions {
        verbose: true,
        ..Default::default()
    };
    Tester::new(loaded.course.clone(), loaded.checker.clone(), options)?
        .validate()
        .context("Pipeline validation failed")?;
    Ok(())
}

/// Copy the files tests run against into a fresh temporary folder.
fn prepare_testing_dir(loaded: &Loaded) -> Result<tempfile::TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("checker-")
        .tempdir()
        .context("Failed to create testing folder")?;
    Exporter::new(
        &loaded.course,
        loaded.checker.structure.clone(),
        loaded.checker.export.clone(),
    )
    .export_for_testing(dir.path())
    .context("Failed to prepare testing folder")?;
    Ok(dir)
}

/// Resolve `--task` / `--group` filters; no filters means every enabled task.
fn select_tasks(tester: &Tester, tasks: &[String], groups: &[String]) -> Result<Vec<FileSystemTask>> {
    if tasks.is_empty() && groups.is_empty() {
        return Ok(tester.enabled_tasks());
    }
    let course = tester.course();
    let mut selected: Vec<FileSystemTask> = Vec::new();
    let mut select = |task: &FileSystemTask| {
        if !selected.iter().any(|t| t.name == task.name) {
            selected.push(task.clone());
        }
    };
    for name in tasks {
        let task = course
            .find_task(name)
            .with_context(|| format!("Unknown task: {name}"))?;
        select(task);
    }
    for name in groups {
        let group = course
            .find_group(name)
            .with_context(|| format!("Unknown group: {name}"))?;
        for task in group.tasks.iter().filter_map(|t| course.find_task(t)) {
            select(task);
        }
    }
    Ok(selected)
}

/// Test reference solutions
async fn cmd_check(
    root: &Path,
    reference_root: Option<&Path>,
    tasks: &[String],
    groups: &[String],
    num_workers: usize,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let loaded = load_course(root, reference_root)?;
    validate_loaded(&loaded)?;
    let testing_dir = prepare_testing_dir(&loaded)?;

    let options = TesterOptions {
        verbose: true,
        dry_run,
        report: false,
        num_workers,
        ..Default::default()
    };
    let tester = Tester::new(loaded.course, loaded.checker, options)?;
    let selected = select_tasks(&tester, tasks, groups)?;
    info!(tasks = selected.len(), workers = num_workers, "Checking tasks");

    let report = tester
        .run(testing_dir.path(), selected, cancel)
        .await
        .context("Testing run aborted")?;
    print_report(&report);
    finish(&report)
}

struct GradeOptions {
    submit_score: bool,
    timestamp: Option<DateTime<Utc>>,
    username: String,
    branch: Option<String>,
    report_token: Option<String>,
    dry_run: bool,
}

/// Test a student submission
async fn cmd_grade(
    root: &Path,
    reference_root: Option<&Path>,
    options: GradeOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut loaded = load_course(root, reference_root)?;
    loaded.course = loaded.course.with_branch_override(options.branch);
    if let Some(token) = options.report_token {
        loaded
            .checker
            .default_parameters
            .insert("report_token".to_string(), Value::String(token));
    }

    let changed: Vec<FileSystemTask> = loaded
        .course
        .detect_changes(loaded.checker.testing.changes_detection)
        .context("Failed to detect changed tasks")?
        .into_iter()
        .cloned()
        .collect();
    if changed.is_empty() {
        println!("No tasks to test");
        return Ok(());
    }
    let names: Vec<&str> = changed.iter().map(|t| t.name.as_str()).collect();
    println!("Testing tasks: {}", names.join(", "));

    let testing_dir = prepare_testing_dir(&loaded)?;
    let tester_options = TesterOptions {
        verbose: false,
        dry_run: options.dry_run,
        report: options.submit_score,
        num_workers: 1,
        timestamp: options.timestamp,
        username: options.username,
    };
    let tester = Tester::new(loaded.course, loaded.checker, tester_options)?;
    let report = tester
        .run(testing_dir.path(), changed, cancel)
        .await
        .context("Testing run aborted")?;
    print_report(&report);
    finish(&report)
}

/// Export public files
fn cmd_export(reference_root: &Path, export_root: &Path, commit: bool, dry_run: bool) -> Result<()> {
    let loaded = load_course(reference_root, None)?;
    let exporter = Exporter::new(
        &loaded.course,
        loaded.checker.structure.clone(),
        loaded.checker.export.clone(),
    );
    exporter.validate().context("Course validation failed")?;

    let scratch;
    let target = if dry_run {
        scratch = tempfile::tempdir().context("Failed to create scratch folder")?;
        scratch.path()
    } else {
        export_root
    };

    let written = exporter
        .export_public(target, Utc::now())
        .context("Export failed")?;
    println!("Exported {} files to {}", written.len(), target.display());

    if commit && !dry_run {
        let pushed = exporter.commit(target).context("Failed to commit export")?;
        if pushed {
            println!("✓ Pushed export");
        } else {
            println!("Nothing to commit");
        }
    }
    Ok(())
}

/// Classify scores with the grade table and print the grade.
fn cmd_classify(scores: &Path, reference_root: &Path, now: DateTime<Utc>) -> Result<i64> {
    let manytask_path = reference_root.join(MANYTASK_CONFIG_FILE);
    let manytask = ManytaskConfig::from_yaml(&manytask_path)
        .with_context(|| format!("Failed to load {}", manytask_path.display()))?;
    let content = std::fs::read_to_string(scores)
        .with_context(|| format!("Failed to read {}", scores.display()))?;
    let scores: BTreeMap<String, f64> =
        serde_yaml::from_str(&content).context("Scores must map task names to numbers")?;

    let stats = StudentStats::compute(&manytask.schedule, &scores, now);
    let grade = classify(&manytask.grades, &stats).context("No grade rule matched")?;

    println!("{}", serde_json::to_string_pretty(stats.as_value())?);
    println!("Grade: {grade}");
    Ok(grade)
}

fn print_pipeline(title: &str, result: &PipelineResult) {
    let status = if result.success() { "✓ PASSED" } else { "✗ FAILED" };
    println!("{title}: {status} ({:.2}s)", result.elapsed.as_secs_f64());
    for stage in &result.stage_results {
        let mark = if stage.skipped {
            "-"
        } else if stage.failed {
            "✗"
        } else {
            "✓"
        };
        println!(
            "  {mark} {} ({:.2}s, {:.0}%)",
            stage.name,
            stage.elapsed.as_secs_f64(),
            stage.percentage * 100.0
        );
        for line in stage.output.lines() {
            println!("      {line}");
        }
    }
}

fn print_report(report: &TestingReport) {
    if let Some(global) = &report.global {
        print_pipeline("Global pipeline", global);
        println!();
    }
    for task in &report.tasks {
        print_pipeline(&format!("Task {}", task.task), &task.task_result);
        if let Some(reported) = &task.report_result {
            print_pipeline(&format!("Report {}", task.task), reported);
        }
        println!();
    }
    let passed = report.tasks.iter().filter(|t| t.passed()).count();
    println!("Summary: {passed}/{} tasks passed", report.tasks.len());
}

fn finish(report: &TestingReport) -> Result<()> {
    if report.global_failed() {
        anyhow::bail!("Global pipeline failed");
    }
    let failed = report.failed_tasks();
    if !failed.is_empty() {
        anyhow::bail!("Task pipelines failed: {}", failed.join(", "));
    }
    println!("\n✓ All tasks passed!");
    Ok(())
}
