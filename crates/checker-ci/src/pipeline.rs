//! Sequential stage execution with `run_if`, templated args and fail policies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use checker_core::template::{render, resolve_value};
use checker_core::{
    CheckerError, ExecutionContext, FailPolicy, PipelineStageResult, Result, StageSpec,
};

use crate::plugin::{Invocation, PluginError, PluginRegistry};

/// Argument consumed by the executor rather than the plugin.
pub const PARTIALLY_SCORED: &str = "partially_scored";

/// Extra time a plugin gets past `parameters.timeout` before the executor
/// abandons the call. Process-spawning plugins enforce the limit themselves.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Result of running one pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineResult {
    pub failed: bool,
    pub stage_results: Vec<PipelineStageResult>,
    pub elapsed: Duration,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        !self.failed
    }

    /// Number of stages that ran and passed.
    pub fn passed_count(&self) -> usize {
        self.stage_results
            .iter()
            .filter(|s| !s.failed && !s.skipped)
            .count()
    }

    /// Number of stages that failed, whatever their policy.
    pub fn failed_count(&self) -> usize {
        self.stage_results.iter().filter(|s| s.failed).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.stage_results.iter().filter(|s| s.skipped).count()
    }
}

/// What to do after a stage finished.
enum Verdict {
    Continue,
    /// Pipeline is failed, keep running.
    Fail,
    /// Pipeline is failed, skip the rest.
    Abort,
}

fn verdict(policy: FailPolicy) -> Verdict {
    match policy {
        FailPolicy::Fast => Verdict::Abort,
        FailPolicy::AfterAll => Verdict::Fail,
        FailPolicy::Never => Verdict::Continue,
    }
}

/// One configured pipeline bound to a plugin registry.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    stages: Vec<StageSpec>,
    registry: Arc<PluginRegistry>,
    verbose: bool,
}

impl PipelineRunner {
    /// Fails when a stage names a plugin the registry does not know.
    pub fn new(stages: Vec<StageSpec>, registry: Arc<PluginRegistry>, verbose: bool) -> Result<Self> {
        for stage in &stages {
            if !registry.contains(&stage.run) {
                return Err(CheckerError::config(format!(
                    "stage '{}' uses unknown plugin '{}' (available: {})",
                    stage.name,
                    stage.run,
                    registry.names().join(", ")
                )));
            }
        }
        Ok(Self {
            stages,
            registry,
            verbose,
        })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Resolve every `run_if` and argument set against `ctx` and check them
    /// against plugin schemas. Registered outputs are stood in by placeholder
    /// results written to `ctx`, so later stages and pipelines may reference
    /// them.
    pub fn validate(&self, ctx: &mut ExecutionContext) -> Result<()> {
        for stage in &self.stages {
            run_condition(stage, ctx)?;
            let mut args = resolve_args(stage, ctx)?;
            take_partially_scored(stage, &mut args)?;
            self.registry.validate(&stage.run, &args)?;
            if let Some(name) = &stage.register_output {
                ctx.register_output(name, &PipelineStageResult::skipped(&stage.name));
            }
        }
        Ok(())
    }

    /// Run all stages in order against `ctx`, appending registered outputs.
    ///
    /// Stage failures are reported through [`PipelineResult`]; `Err` means
    /// the run could not continue at all (bad configuration or cancellation).
    #[instrument(skip(self, ctx, cancel), fields(stages = self.stages.len()))]
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        let mut result = PipelineResult::default();
        let mut abort = false;

        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(CheckerError::Cancelled);
            }
            if abort {
                debug!(stage = %stage.name, "Skipping stage after failure");
                result
                    .stage_results
                    .push(PipelineStageResult::skipped(&stage.name));
                continue;
            }

            let stage_start = Instant::now();
            let outcome = match run_condition(stage, ctx) {
                Ok(false) => {
                    info!(stage = %stage.name, "Skipping stage (run_if is false)");
                    continue;
                }
                Ok(true) => self.execute(stage, ctx, dry_run, cancel).await?,
                Err(CheckerError::TemplateResolution(e)) => {
                    StageOutcome::failed(&stage.name, e.to_string())
                }
                Err(e) => return Err(e),
            };
            let stage_result = outcome.result.with_elapsed(stage_start.elapsed());

            if stage_result.failed {
                warn!(stage = %stage.name, policy = %stage.fail, "Stage failed");
                match (outcome.config_error, verdict(stage.fail)) {
                    (_, Verdict::Abort) => {
                        result.failed = true;
                        abort = true;
                    }
                    (true, _) | (_, Verdict::Fail) => result.failed = true,
                    (false, Verdict::Continue) => {}
                }
            } else {
                info!(stage = %stage.name, percentage = stage_result.percentage, "Stage passed");
            }

            if let Some(name) = &stage.register_output {
                ctx.register_output(name, &stage_result);
            }
            result.stage_results.push(stage_result);
        }

        result.elapsed = start.elapsed();
        Ok(result)
    }

    async fn execute(
        &self,
        stage: &StageSpec,
        ctx: &ExecutionContext,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let mut args = match resolve_args(stage, ctx) {
            Ok(args) => args,
            Err(e) => return Ok(StageOutcome::failed(&stage.name, e.to_string())),
        };
        let partial = match take_partially_scored(stage, &mut args) {
            Ok(partial) => partial,
            Err(e) => return Ok(StageOutcome::invalid(&stage.name, e.to_string())),
        };

        if dry_run {
            info!(stage = %stage.name, plugin = %stage.run, "Dry run, not executing stage");
            return Ok(StageOutcome::passed(PipelineStageResult::success(
                &stage.name,
                "[dry run]",
                1.0,
            )));
        }

        info!(stage = %stage.name, plugin = %stage.run, "Executing stage");
        let limit = stage_timeout(ctx);
        let invocation = Invocation::new(self.verbose)
            .with_timeout(limit)
            .with_cancel(cancel.clone());
        let call = self.registry.invoke(&stage.run, args, &invocation);
        let bounded = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit + TIMEOUT_GRACE, call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(PluginError::Timeout {
                            limit_secs: limit.as_secs_f64(),
                            output: String::new(),
                        })
                    }),
                None => call.await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CheckerError::Cancelled),
            outcome = bounded => outcome,
        };

        match outcome {
            Ok(output) => Ok(StageOutcome::passed(PipelineStageResult::success(
                &stage.name,
                output.output,
                output.percentage,
            ))),
            Err(PluginError::Cancelled) => Err(CheckerError::Cancelled),
            Err(e @ (PluginError::UnknownPlugin(_) | PluginError::DuplicatePlugin(_))) => {
                Err(e.into())
            }
            Err(e @ PluginError::ArgsValidation { .. }) => {
                Ok(StageOutcome::invalid(&stage.name, e.to_string()))
            }
            Err(e) if partial => {
                info!(stage = %stage.name, "Stage failure ignored (partially scored)");
                Ok(StageOutcome::passed(PipelineStageResult::success(
                    &stage.name,
                    e.output(),
                    e.percentage(),
                )))
            }
            Err(e) => Ok(StageOutcome {
                result: PipelineStageResult::failure(&stage.name, e.output(), e.percentage()),
                config_error: false,
            }),
        }
    }
}

struct StageOutcome {
    result: PipelineStageResult,
    /// Broken stage arguments. These fail the pipeline under every policy.
    config_error: bool,
}

impl StageOutcome {
    fn passed(result: PipelineStageResult) -> Self {
        Self {
            result,
            config_error: false,
        }
    }

    fn failed(name: &str, output: String) -> Self {
        Self {
            result: PipelineStageResult::failure(name, output, 0.0),
            config_error: false,
        }
    }

    fn invalid(name: &str, output: String) -> Self {
        Self {
            result: PipelineStageResult::failure(name, output, 0.0),
            config_error: true,
        }
    }
}

/// Evaluate `run_if`. Template errors come back as
/// [`CheckerError::TemplateResolution`]; values that are not booleans are
/// configuration errors.
fn run_condition(stage: &StageSpec, ctx: &ExecutionContext) -> Result<bool> {
    let value = match &stage.run_if {
        None => return Ok(true),
        Some(Value::String(expr)) => render(expr, ctx)?,
        Some(other) => other.clone(),
    };
    match value {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(CheckerError::config(format!(
            "stage '{}': run_if must be a boolean, got {other}",
            stage.name
        ))),
    }
}

fn resolve_args(stage: &StageSpec, ctx: &ExecutionContext) -> Result<Value> {
    let raw = Value::Object(stage.args.clone().into_iter().collect::<Map<_, _>>());
    Ok(resolve_value(&raw, ctx)?)
}

/// Remove `partially_scored` from resolved args.
fn take_partially_scored(stage: &StageSpec, args: &mut Value) -> Result<bool> {
    let Some(map) = args.as_object_mut() else {
        return Ok(false);
    };
    match map.remove(PARTIALLY_SCORED) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(b),
        Some(other) => Err(CheckerError::ArgsValidation {
            plugin: stage.run.clone(),
            reason: format!("`{PARTIALLY_SCORED}` must be a boolean, got {other}"),
        }),
    }
}

/// `parameters.timeout` in seconds, if set and positive.
fn stage_timeout(ctx: &ExecutionContext) -> Option<Duration> {
    ctx.namespace("parameters")
        .and_then(|p| p.get("timeout"))
        .and_then(Value::as_f64)
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
