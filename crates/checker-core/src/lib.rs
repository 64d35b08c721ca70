//! Course checker core library
//!
//! Configuration loading and layering, `${{ }}` expression evaluation,
//! course discovery, deadline credit, grade classification and the
//! private → public export transform. Pipeline execution lives in
//! `checker-ci`.

pub mod config;
pub mod context;
pub mod course;
pub mod deadlines;
pub mod domain;
pub mod export;
pub mod git;
pub mod grades;
pub mod telemetry;
pub mod template;

pub use config::{
    resolve, ChangesDetection, CheckerConfig, EffectiveConfig, ExportConfig, FailPolicy,
    ManytaskConfig, StageSpec, StructureConfig, SubConfig, TemplateMode,
};
pub use context::{ExecutionContext, GlobalVariables, PipelineStageResult, TaskVariables};
pub use course::{Course, FileSystemGroup, FileSystemTask};
pub use deadlines::{
    effective_score, DeadlineMode, DeadlineSchedule, DeadlineScheduleEntry, ScheduleTask,
};
pub use domain::{CheckerError, Result, TemplateError};
pub use export::{export, Exporter};
pub use git::{capture_head_sha, is_git_repo};
pub use grades::{classify, GradeRule, StudentStats};
pub use telemetry::init_tracing;
