//! Executables found in `testing.search_plugins` folders.
//!
//! The resolved stage arguments arrive as a JSON object on stdin and
//! `CHECKER_VERBOSE` is `1` or `0`. The plugin prints either
//! `{"output": ..., "percentage": ...}` or plain text; a non-zero exit fails
//! the stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::scripts::execute;
use crate::plugin::{DynPlugin, Invocation, PluginError, PluginOutput, PluginResult};
use crate::process::{EnvPolicy, Input, ProcessSpec, Script};

pub const VERBOSE_ENV: &str = "CHECKER_VERBOSE";

#[derive(Debug, Clone)]
pub struct ExternalPlugin {
    name: String,
    program: PathBuf,
}

impl ExternalPlugin {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }
}

#[async_trait]
impl DynPlugin for ExternalPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, args: &Value) -> PluginResult<()> {
        if args.is_object() {
            Ok(())
        } else {
            Err(PluginError::args(&self.name, "arguments must be a mapping"))
        }
    }

    async fn invoke(&self, args: Value, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let payload = serde_json::to_vec(&args)
            .map_err(|e| PluginError::args(&self.name, e.to_string()))?;
        let verbose = if invocation.verbose { "1" } else { "0" };
        let spec = ProcessSpec::new(Script::Argv(vec![self.program.to_string_lossy().into_owned()]))
            .with_env(EnvPolicy {
                whitelist: None,
                additional: [(VERBOSE_ENV.to_string(), verbose.to_string())].into(),
            })
            .with_input(Input::Bytes(payload))
            .with_timeout(invocation.timeout);
        let raw = execute(&spec, invocation).await?;
        Ok(parse_output(&raw.output))
    }
}

fn parse_output(stdout: &str) -> PluginOutput {
    serde_json::from_str::<PluginOutput>(stdout.trim()).unwrap_or_else(|_| PluginOutput::new(stdout))
}

/// Executable files directly inside `dir`, named by file stem.
pub fn discover(dir: &Path) -> PluginResult<Vec<ExternalPlugin>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        PluginError::failed(format!("cannot read plugin dir {}: {e}", dir.display()), "")
    })?;
    let mut plugins = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_executable(&path) {
            continue;
        }
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        plugins.push(ExternalPlugin::new(stem, path));
    }
    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(plugins)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_: &Path) -> bool {
    true
}
