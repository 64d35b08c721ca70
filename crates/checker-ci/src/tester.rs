//! Task testing: global pipeline once, then task and report pipelines per task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use checker_core::{
    CheckerConfig, CheckerError, Course, ExecutionContext, FileSystemTask, GlobalVariables,
    Result, TaskVariables,
};

use crate::pipeline::{PipelineResult, PipelineRunner};
use crate::plugin::PluginRegistry;

/// Run-wide tester settings.
#[derive(Debug, Clone)]
pub struct TesterOptions {
    /// Print private detail (instructor runs).
    pub verbose: bool,
    /// Log stages without invoking plugins.
    pub dry_run: bool,
    /// Run the report pipeline for real; otherwise it is always a dry run.
    pub report: bool,
    /// Maximum number of tasks tested concurrently.
    pub num_workers: usize,
    /// Submission time used for deadline credit; defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    pub username: String,
}

impl Default for TesterOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            dry_run: false,
            report: false,
            num_workers: 1,
            timestamp: None,
            username: String::new(),
        }
    }
}

/// Outcome for one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: String,
    pub group: Option<String>,
    /// Deadline credit at submission time.
    pub score_percent: f64,
    pub task_result: PipelineResult,
    /// `None` when the task pipeline failed and reporting was skipped.
    pub report_result: Option<PipelineResult>,
}

impl TaskReport {
    pub fn passed(&self) -> bool {
        self.task_result.success()
    }
}

/// Outcome for a whole run.
#[derive(Debug, Clone, Default)]
pub struct TestingReport {
    /// `None` when there is no global pipeline to run.
    pub global: Option<PipelineResult>,
    /// In the order tasks were requested.
    pub tasks: Vec<TaskReport>,
}

impl TestingReport {
    pub fn global_failed(&self) -> bool {
        self.global.as_ref().is_some_and(|g| g.failed)
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| !t.passed())
            .map(|t| t.task.as_str())
            .collect()
    }

    pub fn success(&self) -> bool {
        !self.global_failed() && self.tasks.iter().all(TaskReport::passed)
    }
}

/// Read-only state shared by concurrent task runs.
#[derive(Debug)]
struct Shared {
    course: Course,
    config: CheckerConfig,
    registry: Arc<PluginRegistry>,
    options: TesterOptions,
}

/// Runs course pipelines over a prepared testing directory.
#[derive(Debug, Clone)]
pub struct Tester {
    shared: Arc<Shared>,
    global_pipeline: PipelineRunner,
}

impl Tester {
    /// Tester with the built-in plugins plus every executable found in the
    /// `testing.search_plugins` folders (relative to the reference root).
    pub fn new(course: Course, config: CheckerConfig, options: TesterOptions) -> Result<Self> {
        let mut registry = PluginRegistry::with_builtins();
        for dir in &config.testing.search_plugins {
            let dir = course.reference_root.join(dir);
            let added = registry.load_external(&dir)?;
            info!(dir = %dir.display(), added, "Loaded external plugins");
        }
        Self::with_registry(course, config, registry, options)
    }

    pub fn with_registry(
        course: Course,
        config: CheckerConfig,
        registry: PluginRegistry,
        options: TesterOptions,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let global_pipeline = PipelineRunner::new(
            config.testing.global_pipeline.clone(),
            Arc::clone(&registry),
            options.verbose,
        )?;
        Ok(Self {
            shared: Arc::new(Shared {
                course,
                config,
                registry,
                options,
            }),
            global_pipeline,
        })
    }

    pub fn course(&self) -> &Course {
        &self.shared.course
    }

    pub fn options(&self) -> &TesterOptions {
        &self.shared.options
    }

    /// Enabled tasks of the schedule that exist on disk.
    pub fn enabled_tasks(&self) -> Vec<FileSystemTask> {
        self.shared
            .course
            .get_tasks(Some(true), None, self.now())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Resolve every pipeline of every enabled task without running anything.
    pub fn validate(&self) -> Result<()> {
        let tasks = self.enabled_tasks();
        let global = self.global_variables(&self.shared.course.reference_root, &tasks);
        let mut global_ctx = ExecutionContext::new(&global, &self.shared.config.default_parameters);

        debug!("Validating global pipeline");
        self.global_pipeline.validate(&mut global_ctx)?;

        for task in &tasks {
            debug!(task = %task.name, "Validating task pipelines");
            let (task_pipeline, report_pipeline, mut ctx) =
                self.shared.task_pipelines(task, &global_ctx, PathBuf::new())?;
            task_pipeline.validate(&mut ctx)?;
            report_pipeline.validate(&mut ctx)?;
        }
        Ok(())
    }

    /// Test `tasks` against the prepared tree at `origin`.
    ///
    /// A failing global pipeline skips every task. Task pipelines run on a
    /// bounded pool, each with its own context and scratch directory; the
    /// report pipeline only runs for tasks that passed.
    #[instrument(skip(self, tasks, cancel), fields(origin = %origin.display(), tasks = tasks.len()))]
    pub async fn run(
        &self,
        origin: &Path,
        tasks: Vec<FileSystemTask>,
        cancel: &CancellationToken,
    ) -> Result<TestingReport> {
        let global = self.global_variables(origin, &tasks);
        info!(run_id = %global.run_id, "Starting test run");
        let mut global_ctx = ExecutionContext::new(&global, &self.shared.config.default_parameters);
        let mut report = TestingReport::default();

        if !self.global_pipeline.is_empty() {
            info!("Running global pipeline");
            let result = self
                .global_pipeline
                .run(&mut global_ctx, self.shared.options.dry_run, cancel)
                .await?;
            let failed = result.failed;
            report.global = Some(result);
            if failed {
                warn!("Global pipeline failed, skipping tasks");
                return Ok(report);
            }
        }

        let global_ctx = Arc::new(global_ctx);
        let sem = Arc::new(Semaphore::new(self.shared.options.num_workers.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let shared = Arc::clone(&self.shared);
            let global_ctx = Arc::clone(&global_ctx);
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                if cancel.is_cancelled() {
                    return Err(CheckerError::Cancelled);
                }
                shared.run_task(&task, &global_ctx, &cancel).await
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(task_report)) => report.tasks.push(task_report),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(CheckerError::Worker(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let failed = report.failed_tasks();
        if failed.is_empty() {
            info!(tasks = report.tasks.len(), "All task pipelines passed");
        } else {
            warn!(failed = ?failed, "Task pipelines failed");
        }
        Ok(report)
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.options.timestamp.unwrap_or_else(Utc::now)
    }

    fn global_variables(&self, origin: &Path, tasks: &[FileSystemTask]) -> GlobalVariables {
        let course = &self.shared.course;
        GlobalVariables {
            ref_dir: absolute(&course.reference_root),
            repo_dir: absolute(&course.repository_root),
            temp_dir: absolute(origin),
            task_names: tasks.iter().map(|t| t.name.clone()).collect(),
            task_sub_paths: tasks.iter().map(|t| t.relative_path.clone()).collect(),
            username: self.shared.options.username.clone(),
            run_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Shared {
    /// Task and report pipelines in force for `task`, plus its context.
    fn task_pipelines(
        &self,
        task: &FileSystemTask,
        global_ctx: &ExecutionContext,
        work_dir: PathBuf,
    ) -> Result<(PipelineRunner, PipelineRunner, ExecutionContext)> {
        let effective = self.course.effective_config(&self.config, task)?;
        let now = self.options.timestamp.unwrap_or_else(Utc::now);
        let variables = TaskVariables {
            task_name: task.name.clone(),
            task_sub_path: task.relative_path.clone(),
            task_group: self.course.group_of(task).unwrap_or_default(),
            task_score_percent: self.course.schedule.credit_for(&task.name, now),
            work_dir,
        };
        let ctx = global_ctx.for_task(&variables, &effective.default_parameters);
        let verbose = self.options.verbose;
        Ok((
            PipelineRunner::new(effective.task_pipeline, Arc::clone(&self.registry), verbose)?,
            PipelineRunner::new(effective.report_pipeline, Arc::clone(&self.registry), verbose)?,
            ctx,
        ))
    }

    async fn run_task(
        &self,
        task: &FileSystemTask,
        global_ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<TaskReport> {
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("checker-{}-", task.name))
            .tempdir()?;
        let (task_pipeline, report_pipeline, mut ctx) =
            self.task_pipelines(task, global_ctx, work_dir.path().to_path_buf())?;
        let score_percent = ctx
            .namespace("task")
            .and_then(|t| t.get("task_score_percent"))
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_default();

        info!(task = %task.name, "Running task pipeline");
        let dry_run = self.options.dry_run;
        let task_result = task_pipeline.run(&mut ctx, dry_run, cancel).await?;

        let report_result = if task_result.success() {
            let dry_report = dry_run || !self.options.report;
            info!(task = %task.name, dry_run = dry_report, "Running report pipeline");
            Some(report_pipeline.run(&mut ctx, dry_report, cancel).await?)
        } else {
            warn!(task = %task.name, "Task pipeline failed, not reporting");
            None
        };

        Ok(TaskReport {
            task: task.name.clone(),
            group: task.group.clone(),
            score_percent,
            task_result,
            report_result,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_requires_global_and_tasks() {
        let passed = TaskReport {
            task: "hello".into(),
            group: None,
            score_percent: 1.0,
            task_result: PipelineResult::default(),
            report_result: None,
        };
        let failed = TaskReport {
            task: "sum".into(),
            task_result: PipelineResult {
                failed: true,
                ..Default::default()
            },
            ..passed.clone()
        };

        let report = TestingReport {
            global: None,
            tasks: vec![passed.clone(), failed],
        };
        assert!(!report.success());
        assert_eq!(report.failed_tasks(), vec!["sum"]);

        let report = TestingReport {
            global: Some(PipelineResult {
                failed: true,
                ..Default::default()
            }),
            tasks: vec![passed],
        };
        assert!(report.global_failed());
        assert!(!report.success());
    }

    #[test]
    fn test_default_options_are_student_safe() {
        let options = TesterOptions::default();
        assert!(!options.verbose);
        assert!(!options.report);
        assert_eq!(options.num_workers, 1);
    }
}
