//! Configuration file models and the layered resolver.
//!
//! * [`checker`]: `.checker.yml` plus `.group.yml` / `.task.yml` overrides
//! * [`manytask`]: `.manytask.yml` deadline schedule and grade table
//! * [`resolver`]: folds the layers into one [`EffectiveConfig`] per task

pub mod checker;
pub mod manytask;
pub mod resolver;

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::domain::error::{CheckerError, Result};

pub use checker::{
    ChangesDetection, CheckerConfig, ExportConfig, FailPolicy, StageSpec, StructureConfig,
    SubConfig, TemplateMode, TestingConfig,
};
pub use manytask::{
    DateOrDelta, DeadlineMode, DeadlineSchedule, DeadlineScheduleEntry, ManytaskConfig,
    ManytaskSettings,
};
pub use resolver::{resolve, EffectiveConfig};

/// Only supported config schema version.
pub const CONFIG_VERSION: u32 = 1;

/// File names the checker looks for.
pub const CHECKER_CONFIG_FILE: &str = ".checker.yml";
pub const MANYTASK_CONFIG_FILE: &str = ".manytask.yml";
pub const TASK_MARKER: &str = ".task.yml";
pub const GROUP_MARKER: &str = ".group.yml";

pub(crate) fn parse_yaml<T: DeserializeOwned>(origin: &str, content: &str) -> Result<T> {
    serde_yaml::from_str(content).map_err(|source| CheckerError::Yaml {
        path: origin.to_string(),
        source,
    })
}

pub(crate) fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CheckerError::config(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_yaml(&path.display().to_string(), &content)
}

pub(crate) fn ensure_version(kind: &str, version: Option<u32>) -> Result<()> {
    match version {
        None => Err(CheckerError::config(format!(
            "{kind}: `version` field is required"
        ))),
        Some(CONFIG_VERSION) => Ok(()),
        Some(other) => Err(CheckerError::config(format!(
            "{kind}: unsupported version {other}, expected {CONFIG_VERSION}"
        ))),
    }
}
