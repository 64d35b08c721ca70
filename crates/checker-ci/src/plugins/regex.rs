//! `check_regexps`: fail when a file under `origin` matches a forbidden regex.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::bytes::Regex;
use serde::Deserialize;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckRegexpsArgs {
    pub origin: PathBuf,
    /// Globs relative to `origin`.
    pub patterns: Vec<String>,
    pub regexps: Vec<String>,
}

pub struct CheckRegexpsPlugin;

#[async_trait]
impl Plugin for CheckRegexpsPlugin {
    const NAME: &'static str = "check_regexps";
    type Args = CheckRegexpsArgs;

    async fn run(&self, args: CheckRegexpsArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        if !args.origin.exists() {
            return Err(PluginError::failed(
                format!("Origin '{}' does not exist", args.origin.display()),
                "",
            ));
        }
        let regexps = args
            .regexps
            .iter()
            .map(|r| {
                Regex::new(&format!("(?m){r}"))
                    .map_err(|e| PluginError::args(Self::NAME, format!("bad regexp `{r}`: {e}")))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        let mut checked = Vec::new();
        for file in matching_files(&args.origin, &args.patterns)? {
            // raw bytes: files that are not valid UTF-8 are still scanned
            let content = std::fs::read(&file).map_err(|e| {
                PluginError::failed(format!("Cannot read '{}': {e}", file.display()), "")
            })?;
            for (regex, source) in regexps.iter().zip(&args.regexps) {
                let Some(found) = regex.find(&content) else {
                    continue;
                };
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut output = format!("File '{name}' matches regexp '{source}'");
                if invocation.verbose {
                    let line = content[..found.start()].iter().filter(|b| **b == b'\n').count() + 1;
                    output = format!(
                        "{output}\n  {}:{line}: {}",
                        file.display(),
                        String::from_utf8_lossy(found.as_bytes()).trim()
                    );
                }
                return Err(PluginError::failed(
                    format!("File '{name}' matches regexp '{source}'"),
                    output,
                ));
            }
            checked.push(file);
        }

        let mut output = "No forbidden regexps found".to_string();
        if invocation.verbose {
            for file in &checked {
                output.push_str(&format!("\n  checked {}", file.display()));
            }
        }
        Ok(PluginOutput::new(output))
    }
}

fn matching_files(origin: &Path, patterns: &[String]) -> PluginResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = origin.join(pattern);
        let paths = glob::glob(&full.to_string_lossy()).map_err(|e| {
            PluginError::args(CheckRegexpsPlugin::NAME, format!("bad pattern `{pattern}`: {e}"))
        })?;
        files.extend(paths.flatten().filter(|p| p.is_file()));
    }
    files.sort();
    files.dedup();
    Ok(files)
}
