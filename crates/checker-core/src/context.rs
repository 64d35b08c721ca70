//! Variables visible to `${{ ... }}` expressions during one pipeline run.
//!
//! An [`ExecutionContext`] holds five namespaces: `global`, `task`,
//! `parameters`, `env` and `outputs`. Only `outputs` changes while a pipeline
//! runs, and only by appending stage results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run-wide variables shared by every task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariables {
    pub ref_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub task_names: Vec<String>,
    pub task_sub_paths: Vec<String>,
    pub username: String,
    pub run_id: String,
}

/// Per-task variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskVariables {
    pub task_name: String,
    pub task_sub_path: String,
    pub task_group: String,
    /// Deadline credit fraction at submission time.
    pub task_score_percent: f64,
    /// Scratch directory private to this task run.
    pub work_dir: PathBuf,
}

/// Result of one executed (or skipped) stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageResult {
    pub name: String,
    pub failed: bool,
    pub skipped: bool,
    pub percentage: f64,
    #[serde(with = "secs_f64")]
    pub elapsed: Duration,
    pub output: String,
}

impl PipelineStageResult {
    pub fn success(name: impl Into<String>, output: impl Into<String>, percentage: f64) -> Self {
        Self {
            name: name.into(),
            failed: false,
            skipped: false,
            percentage,
            elapsed: Duration::ZERO,
            output: output.into(),
        }
    }

    pub fn failure(name: impl Into<String>, output: impl Into<String>, percentage: f64) -> Self {
        Self {
            failed: true,
            ..Self::success(name, output, percentage)
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::success(name, "", 1.0)
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Expression scope for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    global: Value,
    task: Value,
    parameters: Value,
    env: Value,
    outputs: Value,
}

impl ExecutionContext {
    /// Context for the global pipeline; snapshots the process environment.
    pub fn new(global: &GlobalVariables, parameters: &BTreeMap<String, Value>) -> Self {
        Self {
            global: to_value(global),
            task: Value::Object(Map::new()),
            parameters: params_value(parameters),
            env: Value::Object(Map::new()),
            outputs: Value::Object(Map::new()),
        }
        .with_env(std::env::vars())
    }

    /// Fresh copy scoped to one task. Outputs registered so far are carried
    /// over as a snapshot; the env snapshot is shared.
    pub fn for_task(&self, task: &TaskVariables, parameters: &BTreeMap<String, Value>) -> Self {
        Self {
            global: self.global.clone(),
            task: to_value(task),
            parameters: params_value(parameters),
            env: self.env.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Replace the environment snapshot.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = Value::Object(
            env.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        );
        self
    }

    /// Root value of a namespace, `None` for unknown names.
    pub fn namespace(&self, name: &str) -> Option<&Value> {
        match name {
            "global" => Some(&self.global),
            "task" => Some(&self.task),
            "parameters" => Some(&self.parameters),
            "env" => Some(&self.env),
            "outputs" => Some(&self.outputs),
            _ => None,
        }
    }

    pub fn register_output(&mut self, name: &str, result: &PipelineStageResult) {
        if let Value::Object(outputs) = &mut self.outputs {
            outputs.insert(name.to_string(), to_value(result));
        }
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

fn params_value(parameters: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn global() -> GlobalVariables {
        GlobalVariables {
            temp_dir: PathBuf::from("/tmp/run"),
            username: "student".to_string(),
            task_names: vec!["hello".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_namespaces() {
        let params: BTreeMap<String, Value> = [("timeout".to_string(), json!(10))].into();
        let ctx = ExecutionContext::new(&global(), &params)
            .with_env([("HOME".to_string(), "/home/student".to_string())]);

        assert_eq!(ctx.namespace("global").unwrap()["username"], json!("student"));
        assert_eq!(ctx.namespace("parameters").unwrap()["timeout"], json!(10));
        assert_eq!(ctx.namespace("env").unwrap()["HOME"], json!("/home/student"));
        assert!(ctx.namespace("os").is_none());
    }

    #[test]
    fn test_registered_outputs_are_snapshotted_per_task() {
        let mut ctx = ExecutionContext::new(&global(), &BTreeMap::new());
        ctx.register_output("setup", &PipelineStageResult::success("setup", "ok", 1.0));

        let task = TaskVariables {
            task_name: "hello".to_string(),
            ..Default::default()
        };
        let mut task_ctx = ctx.for_task(&task, &BTreeMap::new());
        task_ctx.register_output(
            "tests",
            &PipelineStageResult::failure("tests", "1 failed", 0.5),
        );

        assert_eq!(task_ctx.output_names(), vec!["setup", "tests"]);
        assert_eq!(task_ctx.output("tests").unwrap()["percentage"], json!(0.5));
        assert_eq!(task_ctx.namespace("task").unwrap()["task_name"], json!("hello"));
        assert!(ctx.output("tests").is_none());
    }

    #[test]
    fn test_stage_result_serializes_elapsed_as_seconds() {
        let result = PipelineStageResult::success("build", "", 1.0)
            .with_elapsed(Duration::from_millis(1500));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["elapsed"], json!(1.5));
        assert_eq!(value["skipped"], json!(false));
    }
}
