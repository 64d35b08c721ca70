//! `run_script`: run a shell command or argv list in a directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};
use crate::process::{run_process, EnvPolicy, Input, ProcessSpec, Script};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunScriptArgs {
    pub origin: PathBuf,
    pub script: Script,
    /// Seconds; falls back to the stage limit.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub env_additional: BTreeMap<String, String>,
    #[serde(default)]
    pub env_whitelist: Option<Vec<String>>,
    /// File fed to stdin.
    #[serde(default)]
    pub input: Option<PathBuf>,
}

pub struct RunScriptPlugin;

#[async_trait]
impl Plugin for RunScriptPlugin {
    const NAME: &'static str = "run_script";
    type Args = RunScriptArgs;

    async fn run(&self, args: RunScriptArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let timeout = stage_timeout(Self::NAME, args.timeout, invocation)?;
        let spec = ProcessSpec::new(args.script)
            .in_dir(args.origin)
            .with_env(EnvPolicy {
                whitelist: args.env_whitelist,
                additional: args.env_additional,
            })
            .with_input(args.input.map_or(Input::Null, Input::File))
            .with_timeout(timeout);
        execute(&spec, invocation).await
    }
}

/// Run `spec` and map a non-zero exit to an execution failure. Timeouts stay
/// [`PluginError::Timeout`].
pub(crate) async fn execute(spec: &ProcessSpec, invocation: &Invocation) -> PluginResult<PluginOutput> {
    let finished = run_process(spec, &invocation.cancel).await?;
    if finished.success() {
        return Ok(PluginOutput::new(finished.output));
    }
    let message = match finished.exit_code {
        Some(code) => format!("Script failed with exit code {code}"),
        None => "Script was killed by a signal".to_string(),
    };
    Err(PluginError::failed(message, finished.output))
}

/// Per-call limit: explicit argument first, then the stage limit.
pub(crate) fn stage_timeout(
    plugin: &str,
    seconds: Option<f64>,
    invocation: &Invocation,
) -> PluginResult<Option<Duration>> {
    match seconds {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|_| PluginError::args(plugin, format!("invalid timeout {secs}"))),
        None => Ok(invocation.timeout),
    }
}
