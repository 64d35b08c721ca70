//! Domain-level error taxonomy for the checker.

/// Errors produced while resolving `${{ ... }}` expressions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("syntax error in expression `{expr}`: {reason}")]
    Syntax { expr: String, reason: String },

    #[error("undefined name `{name}` in expression `{expr}`")]
    Undefined { expr: String, name: String },

    #[error("type error in expression `{expr}`: {reason}")]
    Type { expr: String, reason: String },
}

/// Checker errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckerError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("template resolution failed: {0}")]
    TemplateResolution(#[from] TemplateError),

    #[error("invalid arguments for plugin '{plugin}': {reason}")]
    ArgsValidation { plugin: String, reason: String },

    #[error("plugin execution failed: {message}")]
    PluginExecutionFailed {
        message: String,
        output: String,
        percentage: f64,
    },

    #[error("stage '{stage}' timed out after {limit_secs}s")]
    Timeout { stage: String, limit_secs: f64 },

    #[error("export integrity error: {0}")]
    ExportIntegrity(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("grade classification error: {0}")]
    Grade(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("task worker failed: {0}")]
    Worker(String),

    #[error("yaml error in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckerError {
    /// Shorthand for [`CheckerError::ConfigValidation`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Whether this error means the configuration itself is broken, as opposed
    /// to a test failing.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ConfigValidation(_)
                | Self::TemplateResolution(_)
                | Self::ArgsValidation { .. }
                | Self::ExportIntegrity(_)
                | Self::Yaml { .. }
        )
    }
}

/// Result type for checker operations.
pub type Result<T> = std::result::Result<T, CheckerError>;
