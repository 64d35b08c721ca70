//! `.checker.yml` and `.task.yml` / `.group.yml` models.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ensure_version, read_yaml};
use crate::domain::error::Result;

/// Glob rules describing which files of a task are public, private or ignored.
///
/// Every field is optional so the same shape can act as an override layer;
/// `None` means "inherit from the parent layer".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructureConfig {
    #[serde(default)]
    pub ignore_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub private_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub public_patterns: Option<Vec<String>>,
}

impl StructureConfig {
    /// Overlay `other` on top of `self`; any list `other` sets replaces ours.
    pub fn overlay(&self, other: &StructureConfig) -> StructureConfig {
        StructureConfig {
            ignore_patterns: other
                .ignore_patterns
                .clone()
                .or_else(|| self.ignore_patterns.clone()),
            private_patterns: other
                .private_patterns
                .clone()
                .or_else(|| self.private_patterns.clone()),
            public_patterns: other
                .public_patterns
                .clone()
                .or_else(|| self.public_patterns.clone()),
        }
    }

    pub fn ignore(&self) -> &[String] {
        self.ignore_patterns.as_deref().unwrap_or_default()
    }

    pub fn private(&self) -> &[String] {
        self.private_patterns.as_deref().unwrap_or_default()
    }

    pub fn public(&self) -> &[String] {
        self.public_patterns.as_deref().unwrap_or_default()
    }

    /// All patterns declared in this layer.
    pub fn all_patterns(&self) -> impl Iterator<Item = &String> {
        self.ignore().iter().chain(self.private()).chain(self.public())
    }
}

/// What to do when a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Abort the remaining pipeline.
    #[default]
    Fast,
    /// Keep going, fail the pipeline at the end.
    AfterAll,
    /// Log only.
    Never,
}

impl std::fmt::Display for FailPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailPolicy::Fast => write!(f, "fast"),
            FailPolicy::AfterAll => write!(f, "after_all"),
            FailPolicy::Never => write!(f, "never"),
        }
    }
}

/// One pipeline entry: a plugin call plus policy and templating metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,

    /// Plugin key.
    pub run: String,

    /// Unevaluated arguments; strings may contain `${{ ... }}` expressions.
    #[serde(default)]
    pub args: BTreeMap<String, Value>,

    /// Expression or literal bool; absent means "always run".
    #[serde(default)]
    pub run_if: Option<Value>,

    #[serde(default)]
    pub fail: FailPolicy,

    #[serde(default)]
    pub register_output: Option<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            args: BTreeMap::new(),
            run_if: None,
            fail: FailPolicy::Fast,
            register_output: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_fail(mut self, fail: FailPolicy) -> Self {
        self.fail = fail;
        self
    }

    pub fn with_run_if(mut self, run_if: Value) -> Self {
        self.run_if = Some(run_if);
        self
    }

    pub fn registering(mut self, name: impl Into<String>) -> Self {
        self.register_output = Some(name.into());
        self
    }
}

/// How `grade` decides which tasks a submission touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesDetection {
    BranchName,
    CommitMessage,
    #[default]
    LastCommitChanges,
    /// Declared for compatibility, never implemented.
    #[serde(alias = "files_changed")]
    Files,
}

/// Templating strategy used when exporting a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    #[default]
    Search,
    Create,
    SearchOrCreate,
}

impl TemplateMode {
    pub fn uses_template_files(self) -> bool {
        matches!(self, TemplateMode::Search | TemplateMode::SearchOrCreate)
    }

    pub fn uses_template_comments(self) -> bool {
        matches!(self, TemplateMode::Create | TemplateMode::SearchOrCreate)
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_commit_message() -> String {
    "chore(auto): export new tasks".to_string()
}

/// Public repository export settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub templates: TemplateMode,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            destination: None,
            default_branch: default_branch(),
            commit_message: default_commit_message(),
            templates: TemplateMode::default(),
        }
    }
}

/// `testing` section of `.checker.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestingConfig {
    #[serde(default)]
    pub changes_detection: ChangesDetection,

    /// Extra directories scanned for external plugins.
    #[serde(default)]
    pub search_plugins: Vec<String>,

    #[serde(default)]
    pub global_pipeline: Vec<StageSpec>,

    #[serde(default, alias = "tasks_pipeline")]
    pub task_pipeline: Vec<StageSpec>,

    #[serde(default)]
    pub report_pipeline: Vec<StageSpec>,
}

/// Root `.checker.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckerConfig {
    pub version: Option<u32>,

    #[serde(default)]
    pub default_parameters: BTreeMap<String, Value>,

    #[serde(default)]
    pub structure: StructureConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub testing: TestingConfig,
}

impl CheckerConfig {
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let config: Self = read_yaml(path)?;
        ensure_version("CheckerConfig", config.version)?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = super::parse_yaml("<inline>", content)?;
        ensure_version("CheckerConfig", config.version)?;
        Ok(config)
    }
}

/// Override layer read from `.group.yml` / `.task.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubConfig {
    pub version: Option<u32>,

    #[serde(default)]
    pub structure: Option<StructureConfig>,

    #[serde(default)]
    pub parameters: Option<BTreeMap<String, Value>>,

    #[serde(default)]
    pub task_pipeline: Option<Vec<StageSpec>>,

    #[serde(default)]
    pub report_pipeline: Option<Vec<StageSpec>>,
}

impl SubConfig {
    /// Read a marker file; an empty file means "no overrides".
    pub fn from_marker(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = super::parse_yaml(&path.display().to_string(), &content)?;
        ensure_version("SubConfig", config.version)?;
        Ok(config)
    }
}
