//! `safe_run_script`: `run_script` inside a firejail sandbox.
//!
//! Network is cut by default, the filesystem is narrowed to `origin` plus
//! whitelisted paths, and the environment is rebuilt from scratch. Resource
//! limits are passed per invocation, so one runaway submission cannot starve
//! its concurrently running siblings.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use super::scripts::{execute, stage_timeout};
use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};
use crate::process::{EnvPolicy, Input, ProcessSpec, Script};

const FIREJAIL: &str = "firejail";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafeRunScriptArgs {
    pub origin: String,
    pub script: Script,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub input: Option<PathBuf>,

    #[serde(default)]
    pub env_additional: BTreeMap<String, String>,
    #[serde(default)]
    pub env_whitelist: Vec<String>,
    #[serde(default)]
    pub paths_whitelist: Vec<String>,
    #[serde(default)]
    pub paths_blacklist: Vec<String>,
    #[serde(default = "default_true")]
    pub lock_network: bool,
    /// Run unsandboxed when firejail is missing instead of failing.
    #[serde(default)]
    pub allow_fallback: bool,

    /// Address space limit in bytes.
    #[serde(default)]
    pub rlimit_as: Option<u64>,
    /// CPU time limit in seconds.
    #[serde(default)]
    pub rlimit_cpu: Option<u64>,
    #[serde(default)]
    pub rlimit_nproc: Option<u64>,
}

pub struct SafeRunScriptPlugin {
    firejail: String,
}

impl Default for SafeRunScriptPlugin {
    fn default() -> Self {
        Self {
            firejail: FIREJAIL.to_string(),
        }
    }
}

impl SafeRunScriptPlugin {
    /// Use another sandbox binary (tests point this at a missing one).
    pub fn with_binary(firejail: impl Into<String>) -> Self {
        Self {
            firejail: firejail.into(),
        }
    }

    async fn available(&self) -> Result<(), String> {
        match Command::new(&self.firejail).arg("--version").output().await {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(String::from_utf8_lossy(&out.stderr).into_owned()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Full argv: firejail flags, `env -i` with the allowed variables, then
    /// the script itself.
    pub fn build_command(&self, args: &SafeRunScriptArgs) -> Vec<String> {
        let mut command = vec![
            self.firejail.clone(),
            "--quiet".to_string(),
            "--noprofile".to_string(),
            "--deterministic-exit-code".to_string(),
        ];
        if args.lock_network {
            command.push("--net=none".to_string());
        }
        for path in whitelist_paths(args) {
            command.push(format!("--whitelist={}", expand_home(&path)));
        }
        for path in &args.paths_blacklist {
            command.push(format!("--blacklist={}", expand_home(path)));
        }
        if let Some(bytes) = args.rlimit_as {
            command.push(format!("--rlimit-as={bytes}"));
        }
        if let Some(secs) = args.rlimit_cpu {
            command.push(format!("--rlimit-cpu={secs}"));
        }
        if let Some(count) = args.rlimit_nproc {
            command.push(format!("--rlimit-nproc={count}"));
        }

        command.push("env".to_string());
        command.push("-i".to_string());
        let mut env: BTreeMap<String, String> = args
            .env_whitelist
            .iter()
            .map(|name| (name.clone(), std::env::var(name).unwrap_or_default()))
            .collect();
        env.extend(args.env_additional.clone());
        command.extend(env.into_iter().map(|(k, v)| format!("{k}={v}")));

        match &args.script {
            Script::Shell(line) => {
                command.extend(["sh".to_string(), "-c".to_string(), line.clone()]);
            }
            Script::Argv(argv) => command.extend(argv.iter().cloned()),
        }
        command
    }
}

#[async_trait]
impl Plugin for SafeRunScriptPlugin {
    const NAME: &'static str = "safe_run_script";
    type Args = SafeRunScriptArgs;

    async fn run(&self, args: SafeRunScriptArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let timeout = stage_timeout(Self::NAME, args.timeout, invocation)?;
        let input = args.input.clone().map_or(Input::Null, Input::File);

        if let Err(reason) = self.available().await {
            if !args.allow_fallback {
                return Err(PluginError::failed("Firejail is not installed", reason));
            }
            warn!("firejail not available, running without sandbox");
            let spec = ProcessSpec::new(args.script)
                .in_dir(&args.origin)
                .with_env(EnvPolicy {
                    whitelist: Some(args.env_whitelist),
                    additional: args.env_additional,
                })
                .with_input(input)
                .with_timeout(timeout);
            let mut output = execute(&spec, invocation).await?;
            if invocation.verbose {
                output.output = format!(
                    "Firejail is not installed. Fallback to run_script.\n{}",
                    output.output
                );
            }
            return Ok(output);
        }

        let spec = ProcessSpec::new(Script::Argv(self.build_command(&args)))
            .in_dir(&args.origin)
            .with_input(input)
            .with_timeout(timeout);
        execute(&spec, invocation).await
    }
}

fn whitelist_paths(args: &SafeRunScriptArgs) -> Vec<String> {
    let mut paths: Vec<String> = args.paths_whitelist.clone();
    paths.push(args.origin.clone());
    paths.sort();
    paths.dedup();
    // firejail refuses a bare /tmp whitelist; ~/tmp stands in when it is alone
    if paths == ["/tmp"] {
        paths.push("~/tmp".to_string());
    }
    paths.retain(|p| p != "/tmp");
    paths
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}{rest}"),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::plugin::DynPlugin;

    fn args(value: serde_json::Value) -> SafeRunScriptArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_build_command_locks_network_and_scrubs_env() {
        std::env::set_var("CHECKER_SANDBOX_VAR", "kept");
        let plugin = SafeRunScriptPlugin::default();
        let command = plugin.build_command(&args(json!({
            "origin": "/work/task",
            "script": "pytest -q",
            "env_whitelist": ["CHECKER_SANDBOX_VAR"],
            "env_additional": {"MODE": "grade"},
            "paths_blacklist": ["/etc/secret"],
            "rlimit_as": 1073741824u64,
            "rlimit_cpu": 10,
        })));

        assert_eq!(command[0], "firejail");
        assert!(command.contains(&"--net=none".to_string()));
        assert!(command.contains(&"--whitelist=/work/task".to_string()));
        assert!(command.contains(&"--blacklist=/etc/secret".to_string()));
        assert!(command.contains(&"--rlimit-as=1073741824".to_string()));
        assert!(command.contains(&"--rlimit-cpu=10".to_string()));
        assert!(!command.iter().any(|c| c.starts_with("--rlimit-nproc")));

        let env_at = command.iter().position(|c| c == "env").unwrap();
        assert_eq!(command[env_at + 1], "-i");
        assert!(command.contains(&"CHECKER_SANDBOX_VAR=kept".to_string()));
        assert!(command.contains(&"MODE=grade".to_string()));
        assert_eq!(&command[command.len() - 3..], ["sh", "-c", "pytest -q"]);
    }

    #[test]
    fn test_network_can_stay_open() {
        let command = SafeRunScriptPlugin::default().build_command(&args(json!({
            "origin": "/work",
            "script": ["make", "test"],
            "lock_network": false,
        })));
        assert!(!command.contains(&"--net=none".to_string()));
        assert_eq!(&command[command.len() - 2..], ["make", "test"]);
    }

    #[test]
    fn test_tmp_whitelist_is_rewritten() {
        let paths = whitelist_paths(&args(json!({"origin": "/tmp", "script": "ls"})));
        assert!(!paths.contains(&"/tmp".to_string()));
        assert!(paths.contains(&"~/tmp".to_string()));
    }

    #[tokio::test]
    async fn test_missing_firejail_fails_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = SafeRunScriptPlugin::with_binary("firejail-missing-for-tests");
        let err = plugin
            .invoke(
                json!({"origin": dir.path(), "script": "echo hi"}),
                &Invocation::new(false),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Firejail is not installed"));
    }

    #[tokio::test]
    async fn test_missing_firejail_falls_back_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = SafeRunScriptPlugin::with_binary("firejail-missing-for-tests");
        let args = json!({
            "origin": dir.path(),
            "script": "echo hi",
            "env_whitelist": ["PATH"],
            "allow_fallback": true,
        });

        let quiet = plugin.invoke(args.clone(), &Invocation::new(false)).await.unwrap();
        assert_eq!(quiet.output.trim(), "hi");

        let loud = plugin.invoke(args, &Invocation::new(true)).await.unwrap();
        assert!(loud.output.starts_with("Firejail is not installed"));
    }
}
