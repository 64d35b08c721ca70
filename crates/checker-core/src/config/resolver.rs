//! Fold root, group and task configuration layers into one effective config.
//!
//! Each layer replaces whatever it sets explicitly. Lists (patterns,
//! pipelines) are replaced wholesale; only `parameters` merge key by key.

use std::collections::BTreeMap;

use serde_json::Value;

use super::checker::{ChangesDetection, CheckerConfig, StageSpec, StructureConfig, SubConfig};
use crate::domain::error::{CheckerError, Result};

/// Settings in force for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub structure: StructureConfig,
    pub default_parameters: BTreeMap<String, Value>,
    pub global_pipeline: Vec<StageSpec>,
    pub task_pipeline: Vec<StageSpec>,
    pub report_pipeline: Vec<StageSpec>,
    pub changes_detection: ChangesDetection,
}

impl EffectiveConfig {
    /// Effective config with no overrides applied.
    pub fn root(root: &CheckerConfig) -> Result<Self> {
        resolve(root, None, None)
    }

    /// Apply one more override layer on top of `self`.
    pub fn overlay(mut self, layer: &SubConfig) -> Result<Self> {
        if let Some(structure) = &layer.structure {
            validate_patterns(structure)?;
            self.structure = self.structure.overlay(structure);
        }
        if let Some(parameters) = &layer.parameters {
            for (key, value) in parameters {
                self.default_parameters.insert(key.clone(), value.clone());
            }
        }
        if let Some(pipeline) = &layer.task_pipeline {
            self.task_pipeline = pipeline.clone();
        }
        if let Some(pipeline) = &layer.report_pipeline {
            self.report_pipeline = pipeline.clone();
        }
        Ok(self)
    }

    /// Stage-level `timeout` default in seconds, if configured.
    pub fn timeout_secs(&self) -> Option<f64> {
        self.default_parameters.get("timeout").and_then(Value::as_f64)
    }
}

/// Resolve root → group → task.
pub fn resolve(
    root: &CheckerConfig,
    group: Option<&SubConfig>,
    task: Option<&SubConfig>,
) -> Result<EffectiveConfig> {
    validate_patterns(&root.structure)?;
    let base = EffectiveConfig {
        structure: root.structure.clone(),
        default_parameters: root.default_parameters.clone(),
        global_pipeline: root.testing.global_pipeline.clone(),
        task_pipeline: root.testing.task_pipeline.clone(),
        report_pipeline: root.testing.report_pipeline.clone(),
        changes_detection: root.testing.changes_detection,
    };

    [group, task]
        .into_iter()
        .flatten()
        .try_fold(base, |config, layer| config.overlay(layer))
}

/// Reject recursive (`**`) and malformed globs.
pub fn validate_patterns(structure: &StructureConfig) -> Result<()> {
    for pattern in structure.all_patterns() {
        if pattern.contains("**") {
            return Err(CheckerError::config(format!(
                "recursive glob `{pattern}` is not allowed in structure patterns"
            )));
        }
        glob::Pattern::new(pattern)
            .map_err(|e| CheckerError::config(format!("invalid glob `{pattern}`: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::checker::FailPolicy;
    use serde_json::json;

    fn root() -> CheckerConfig {
        CheckerConfig::from_yaml_str(
            r#"
version: 1
default_parameters:
  timeout: 10
  language: python
structure:
  ignore_patterns: [".git"]
  private_patterns: ["test_private.py"]
  public_patterns: ["*.py", "README.md"]
testing:
  changes_detection: branch_name
  global_pipeline:
    - {name: setup, run: run_script, args: {origin: ".", script: "true"}}
  task_pipeline:
    - {name: tests, run: run_script, args: {origin: ".", script: "pytest"}}
  report_pipeline:
    - {name: report, run: report_score_manytask, args: {origin: ".", score: 1.0}}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_root_only() {
        let config = EffectiveConfig::root(&root()).unwrap();
        assert_eq!(config.changes_detection, ChangesDetection::BranchName);
        assert_eq!(config.task_pipeline.len(), 1);
        assert_eq!(config.timeout_secs(), Some(10.0));
    }

    #[test]
    fn test_task_public_patterns_replace_group_list() {
        let group = SubConfig {
            structure: Some(StructureConfig {
                public_patterns: Some(vec!["*.cpp".into(), "*.h".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let task = SubConfig {
            structure: Some(StructureConfig {
                public_patterns: Some(vec!["main.cpp".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = resolve(&root(), Some(&group), Some(&task)).unwrap();
        assert_eq!(config.structure.public(), &["main.cpp".to_string()]);
        // untouched fields inherit from the root
        assert_eq!(config.structure.private(), &["test_private.py".to_string()]);
    }

    #[test]
    fn test_parameters_merge_per_key() {
        let group = SubConfig {
            parameters: Some([("timeout".to_string(), json!(30))].into()),
            ..Default::default()
        };
        let task = SubConfig {
            parameters: Some([("language".to_string(), json!("cpp"))].into()),
            ..Default::default()
        };

        let config = resolve(&root(), Some(&group), Some(&task)).unwrap();
        assert_eq!(config.default_parameters["timeout"], json!(30));
        assert_eq!(config.default_parameters["language"], json!("cpp"));
    }

    #[test]
    fn test_pipeline_override_replaces_wholesale() {
        let task = SubConfig {
            task_pipeline: Some(vec![
                StageSpec::new("lint", "check_regexps").with_fail(FailPolicy::Never),
                StageSpec::new("tests", "run_script"),
            ]),
            ..Default::default()
        };
        let config = resolve(&root(), None, Some(&task)).unwrap();
        assert_eq!(config.task_pipeline.len(), 2);
        assert_eq!(config.task_pipeline[0].name, "lint");
        assert_eq!(config.report_pipeline.len(), 1);
        assert_eq!(config.global_pipeline.len(), 1);
    }

    #[test]
    fn test_recursive_globs_are_rejected() {
        let task = SubConfig {
            structure: Some(StructureConfig {
                private_patterns: Some(vec!["tests/**/*.py".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = resolve(&root(), None, Some(&task)).unwrap_err();
        assert!(err.to_string().contains("recursive glob"));
    }
}
