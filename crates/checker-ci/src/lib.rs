//! Course checker CI - pipeline execution for student submissions
//!
//! Provides:
//! - A plugin registry with typed argument schemas and the built-in plugins
//! - A subprocess runner with process-group timeouts and cancellation
//! - The pipeline executor (`run_if`, templated args, fail policies)
//! - The tester orchestrating global, task and report pipelines

pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod process;
pub mod tester;

// Re-export key types
pub use pipeline::{PipelineResult, PipelineRunner};
pub use plugin::{
    DynPlugin, Invocation, Plugin, PluginError, PluginOutput, PluginRegistry, PluginResult,
};
pub use process::{run_process, ProcessOutput, ProcessSpec, Script};
pub use tester::{TaskReport, Tester, TesterOptions, TestingReport};
