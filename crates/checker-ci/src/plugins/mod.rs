//! Built-in plugins.

pub mod aggregate;
pub mod copy_files;
pub mod external;
pub mod gitlab;
pub mod manytask;
pub mod pytest;
pub mod regex;
pub mod sandbox;
pub mod scripts;

pub use aggregate::AggregatePlugin;
pub use copy_files::CopyFilesPlugin;
pub use external::ExternalPlugin;
pub use gitlab::MergeRequestPlugin;
pub use manytask::ReportScorePlugin;
pub use pytest::RunPytestPlugin;
pub use regex::CheckRegexpsPlugin;
pub use sandbox::SafeRunScriptPlugin;
pub use scripts::RunScriptPlugin;

use std::sync::Arc;

use crate::plugin::DynPlugin;

/// One instance of every built-in plugin.
pub fn builtins() -> Vec<Arc<dyn DynPlugin>> {
    vec![
        Arc::new(RunScriptPlugin),
        Arc::new(SafeRunScriptPlugin::default()),
        Arc::new(RunPytestPlugin),
        Arc::new(CheckRegexpsPlugin),
        Arc::new(AggregatePlugin),
        Arc::new(ReportScorePlugin::default()),
        Arc::new(MergeRequestPlugin::default()),
        Arc::new(CopyFilesPlugin),
    ]
}
