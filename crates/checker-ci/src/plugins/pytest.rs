//! `run_pytest`: run a pytest target and score it by the share of passed tests.
//!
//! Tests run under `python -I` so a submission's `sitecustomize` or user
//! site-packages cannot patch the interpreter. Results come from the
//! `pytest-json-report` file written into a scratch folder outside `origin`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};
use crate::plugins::scripts::stage_timeout;
use crate::process::{run_process, EnvPolicy, ProcessSpec, Script};

const REPORT_FILE: &str = "report.json";

fn default_python() -> String {
    "python".to_string()
}

fn default_whitelist() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_true() -> bool {
    true
}

/// `coverage: true` collects coverage; a number also sets the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Coverage {
    Enabled(bool),
    FailUnder(u32),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPytestArgs {
    pub origin: PathBuf,
    /// Test file or folder, relative to `origin`.
    pub target: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default = "default_whitelist")]
    pub env_whitelist: Vec<String>,
    #[serde(default)]
    pub coverage: Option<Coverage>,
    /// Failed tests lower the percentage but do not fail the stage.
    #[serde(default)]
    pub allow_failures: bool,
    /// Score the stage by `passed / total` from the pytest report.
    #[serde(default = "default_true")]
    pub report_percentage: bool,
    #[serde(default = "default_python")]
    pub python: String,
}

#[derive(Debug, Deserialize)]
struct PytestReport {
    summary: ReportSummary,
}

#[derive(Debug, Default, Deserialize)]
struct ReportSummary {
    #[serde(default)]
    passed: u64,
    #[serde(default)]
    total: u64,
}

impl ReportSummary {
    fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64
    }
}

pub struct RunPytestPlugin;

#[async_trait]
impl Plugin for RunPytestPlugin {
    const NAME: &'static str = "run_pytest";
    type Args = RunPytestArgs;

    async fn run(&self, args: RunPytestArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let timeout = stage_timeout(Self::NAME, args.timeout, invocation)?;
        let report_dir = tempfile::Builder::new()
            .prefix("checker-pytest-")
            .tempdir()
            .map_err(|e| PluginError::failed(format!("cannot create report folder: {e}"), ""))?;
        let report_path = report_dir.path().join(REPORT_FILE);

        let argv = pytest_argv(&args, &report_path, invocation.verbose);
        debug!(argv = ?argv, "running pytest");
        let spec = ProcessSpec::new(Script::Argv(argv))
            .in_dir(&args.origin)
            .with_env(EnvPolicy {
                whitelist: Some(args.env_whitelist.clone()),
                ..Default::default()
            })
            .with_timeout(timeout);
        let finished = run_process(&spec, &invocation.cancel).await?;

        let percentage = if args.report_percentage {
            read_summary(&report_path)
                .map_err(|message| PluginError::failed(message, finished.output.clone()))?
                .percentage()
        } else {
            1.0
        };

        if finished.success() {
            return Ok(PluginOutput::new(finished.output).with_percentage(percentage));
        }
        let tests_failed = finished.exit_code == Some(1);
        if args.allow_failures && tests_failed {
            return Ok(PluginOutput::new(finished.output).with_percentage(percentage));
        }
        let message = match finished.exit_code {
            Some(1) => "Some tests failed".to_string(),
            Some(code) => format!("pytest failed with exit code {code}"),
            None => "pytest was killed by a signal".to_string(),
        };
        Err(PluginError::ExecutionFailed {
            message,
            output: finished.output,
            percentage: if tests_failed { percentage } else { 0.0 },
        })
    }
}

fn pytest_argv(args: &RunPytestArgs, report: &Path, verbose: bool) -> Vec<String> {
    let mut argv: Vec<String> = [args.python.as_str(), "-I", "-m", "pytest"]
        .map(String::from)
        .to_vec();
    if !verbose {
        argv.extend(["--no-header", "--tb=no"].map(String::from));
    }
    match args.coverage {
        None | Some(Coverage::Enabled(false)) => argv.extend(["-p", "no:cov"].map(String::from)),
        Some(coverage) => {
            argv.extend(["--cov-report", "term-missing", "--cov"].map(String::from));
            argv.push(args.target.clone());
            if let Coverage::FailUnder(min) = coverage {
                argv.push("--cov-fail-under".to_string());
                argv.push(min.to_string());
            }
        }
    }
    if args.report_percentage {
        argv.push("--json-report".to_string());
        argv.push("--json-report-file".to_string());
        argv.push(report.display().to_string());
    }
    argv.push(args.target.clone());
    argv
}

fn read_summary(path: &Path) -> Result<ReportSummary, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| "No report received from pytest (is pytest-json-report installed?)".to_string())?;
    let report: PytestReport =
        serde_json::from_str(&content).map_err(|e| format!("Invalid pytest report: {e}"))?;
    Ok(report.summary)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    use crate::plugin::DynPlugin;

    /// Stand-in interpreter: echoes its argv and writes `summary` to the
    /// `--json-report-file` path, then exits with `code`.
    fn fake_python(dir: &Path, summary: Option<&str>, code: i32) -> PathBuf {
        let path = dir.join("fake-python");
        let write = summary
            .map(|s| format!("[ -n \"$report\" ] && printf '%s' '{s}' > \"$report\""))
            .unwrap_or_default();
        let body = format!(
            "#!/bin/sh\nreport=\"\"\nprev=\"\"\nfor arg in \"$@\"; do\n  \
             [ \"$prev\" = \"--json-report-file\" ] && report=\"$arg\"\n  prev=\"$arg\"\ndone\n\
             echo \"argv: $*\"\n{write}\nexit {code}\n"
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn args(dir: &Path, python: &Path) -> serde_json::Value {
        json!({"origin": dir, "target": "tests", "python": python})
    }

    #[tokio::test]
    async fn test_all_passed_scores_full() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_python(dir.path(), Some(r#"{"summary": {"passed": 4, "total": 4}}"#), 0);
        let output = RunPytestPlugin
            .invoke(args(dir.path(), &python), &Invocation::new(false))
            .await
            .unwrap();
        assert_eq!(output.percentage, 1.0);
        assert!(output.output.contains("-I -m pytest --no-header --tb=no -p no:cov"));
        assert!(output.output.trim_end().ends_with("tests"));
    }

    #[tokio::test]
    async fn test_failed_tests_carry_partial_percentage() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_python(dir.path(), Some(r#"{"summary": {"passed": 3, "failed": 1, "total": 4}}"#), 1);
        let err = RunPytestPlugin
            .invoke(args(dir.path(), &python), &Invocation::new(false))
            .await
            .unwrap_err();
        assert_eq!(err.percentage(), 0.75);
        assert!(err.to_string().contains("Some tests failed"));

        let mut allowed = args(dir.path(), &python);
        allowed["allow_failures"] = json!(true);
        let output = RunPytestPlugin
            .invoke(allowed, &Invocation::new(false))
            .await
            .unwrap();
        assert_eq!(output.percentage, 0.75);
    }

    #[tokio::test]
    async fn test_missing_report_fails() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_python(dir.path(), None, 0);
        let err = RunPytestPlugin
            .invoke(args(dir.path(), &python), &Invocation::new(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No report received"));

        let mut unscored = args(dir.path(), &python);
        unscored["report_percentage"] = json!(false);
        let output = RunPytestPlugin
            .invoke(unscored, &Invocation::new(true))
            .await
            .unwrap();
        assert_eq!(output.percentage, 1.0);
        assert!(!output.output.contains("--json-report"));
        assert!(!output.output.contains("--tb=no"));
    }

    #[tokio::test]
    async fn test_coverage_threshold_failure_is_not_credited() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_python(dir.path(), Some(r#"{"summary": {"passed": 2, "total": 2}}"#), 2);
        let mut covered = args(dir.path(), &python);
        covered["coverage"] = json!(80);
        let err = RunPytestPlugin
            .invoke(covered, &Invocation::new(false))
            .await
            .unwrap_err();
        assert_eq!(err.percentage(), 0.0);
        assert!(err.output().contains("--cov tests --cov-fail-under 80"));
    }

    #[test]
    fn test_args_schema() {
        let plugin = RunPytestPlugin;
        assert!(plugin.validate(&json!({"origin": "/tmp", "target": "t"})).is_ok());
        assert!(plugin
            .validate(&json!({"origin": "/tmp", "target": "t", "coverage": true}))
            .is_ok());
        assert!(plugin.validate(&json!({"origin": "/tmp"})).is_err());
        assert!(plugin
            .validate(&json!({"origin": "/tmp", "target": "t", "coverage": "high"}))
            .is_err());
    }
}
