//! Plugin contract and registry.
//!
//! Built-in plugins implement the typed [`Plugin`] trait; the registry stores
//! them behind the object-safe [`DynPlugin`] so arguments are validated into
//! the plugin's `Args` type before the entry point ever runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use checker_core::CheckerError;

use crate::plugins;

/// Value returned by a successful plugin call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    pub output: String,
    #[serde(default = "full_percentage")]
    pub percentage: f64,
}

fn full_percentage() -> f64 {
    1.0
}

impl PluginOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            percentage: 1.0,
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = percentage;
        self
    }
}

/// Plugin failure taxonomy.
#[derive(Debug, Error, PartialEq)]
pub enum PluginError {
    #[error("invalid arguments for plugin '{plugin}': {reason}")]
    ArgsValidation { plugin: String, reason: String },

    #[error("{message}")]
    ExecutionFailed {
        message: String,
        output: String,
        percentage: f64,
    },

    #[error("timed out after {limit_secs}s")]
    Timeout { limit_secs: f64, output: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("duplicate plugin registration: {0}")]
    DuplicatePlugin(String),
}

impl PluginError {
    /// Execution failure with zero credit.
    pub fn failed(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            output: output.into(),
            percentage: 0.0,
        }
    }

    pub fn args(plugin: &str, reason: impl Into<String>) -> Self {
        Self::ArgsValidation {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    /// Text shown to the user for a failed stage.
    pub fn output(&self) -> String {
        match self {
            Self::ExecutionFailed {
                message, output, ..
            } if !output.is_empty() => format!("{output}\n{message}"),
            Self::Timeout { output, .. } if !output.is_empty() => format!("{output}\n{self}"),
            other => other.to_string(),
        }
    }

    /// Credit carried by the failure.
    pub fn percentage(&self) -> f64 {
        match self {
            Self::ExecutionFailed { percentage, .. } => *percentage,
            _ => 0.0,
        }
    }
}

impl From<PluginError> for CheckerError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::ArgsValidation { plugin, reason } => {
                CheckerError::ArgsValidation { plugin, reason }
            }
            PluginError::ExecutionFailed {
                message,
                output,
                percentage,
            } => CheckerError::PluginExecutionFailed {
                message,
                output,
                percentage,
            },
            PluginError::Timeout { limit_secs, .. } => CheckerError::Timeout {
                stage: String::new(),
                limit_secs,
            },
            PluginError::Cancelled => CheckerError::Cancelled,
            err @ (PluginError::UnknownPlugin(_) | PluginError::DuplicatePlugin(_)) => {
                CheckerError::ConfigValidation(err.to_string())
            }
        }
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Per-call settings handed to every plugin.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// `false` for student-facing runs: plugins must hide private detail.
    pub verbose: bool,
    /// Stage wall-clock limit, used by plugins that spawn processes.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Typed plugin. `Args` is the argument schema third parties code against.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: DeserializeOwned + Send + 'static;

    async fn run(&self, args: Self::Args, invocation: &Invocation) -> PluginResult<PluginOutput>;
}

/// Object-safe view of a plugin used by the registry.
#[async_trait]
pub trait DynPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Check raw arguments against the schema without running anything.
    fn validate(&self, args: &Value) -> PluginResult<()>;

    async fn invoke(&self, args: Value, invocation: &Invocation) -> PluginResult<PluginOutput>;
}

fn parse_args<P: Plugin>(args: Value) -> PluginResult<P::Args> {
    serde_json::from_value(args).map_err(|e| PluginError::args(P::NAME, e.to_string()))
}

#[async_trait]
impl<P: Plugin> DynPlugin for P {
    fn name(&self) -> &str {
        P::NAME
    }

    fn validate(&self, args: &Value) -> PluginResult<()> {
        parse_args::<P>(args.clone()).map(|_| ())
    }

    async fn invoke(&self, args: Value, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let args = parse_args::<P>(args)?;
        self.run(args, invocation).await
    }
}

/// Plugins available to a run, keyed by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn DynPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        let plugins = plugins::builtins()
            .into_iter()
            .map(|plugin| (plugin.name().to_string(), plugin))
            .collect();
        Self { plugins }
    }

    pub fn register(&mut self, plugin: impl DynPlugin + 'static) -> PluginResult<()> {
        self.register_arc(Arc::new(plugin))
    }

    pub fn register_arc(&mut self, plugin: Arc<dyn DynPlugin>) -> PluginResult<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(PluginError::DuplicatePlugin(name));
        }
        debug!(plugin = %name, "registered plugin");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Register every executable in `dir` as an external plugin named by its
    /// file stem. Returns how many were added.
    pub fn load_external(&mut self, dir: &Path) -> PluginResult<usize> {
        let mut added = 0;
        for plugin in plugins::external::discover(dir)? {
            self.register(plugin)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn validate(&self, name: &str, args: &Value) -> PluginResult<()> {
        self.lookup(name)?.validate(args)
    }

    /// Validate `args`, then run the plugin.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        invocation: &Invocation,
    ) -> PluginResult<PluginOutput> {
        let plugin = self.lookup(name)?;
        plugin.validate(&args)?;
        plugin.invoke(args, invocation).await
    }

    fn lookup(&self, name: &str) -> PluginResult<&Arc<dyn DynPlugin>> {
        self.plugins
            .get(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }
}
