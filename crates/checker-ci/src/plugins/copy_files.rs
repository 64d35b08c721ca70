//! `copy_files`: copy glob matches from one directory into another.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyFilesArgs {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

pub struct CopyFilesPlugin;

#[async_trait]
impl Plugin for CopyFilesPlugin {
    const NAME: &'static str = "copy_files";
    type Args = CopyFilesArgs;

    async fn run(&self, args: CopyFilesArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let mut copied = Vec::new();
        copy_matching(
            &args.source_dir,
            &args.target_dir,
            &args.patterns,
            &args.ignore_patterns,
            &mut copied,
        )
        .map_err(|e| PluginError::failed(format!("Copy failed: {e}"), ""))?;

        let mut output = format!("Copied {} files", copied.len());
        if invocation.verbose {
            for path in &copied {
                output.push_str(&format!("\n  {}", path.display()));
            }
        }
        Ok(PluginOutput::new(output))
    }
}

fn glob_in(dir: &Path, pattern: &str) -> std::io::Result<Vec<PathBuf>> {
    let full = dir.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    Ok(paths.flatten().collect())
}

/// Patterns apply again inside every matched folder.
fn copy_matching(
    source: &Path,
    target: &Path,
    patterns: &[String],
    ignore_patterns: &[String],
    copied: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    let mut ignored = HashSet::new();
    for pattern in ignore_patterns {
        ignored.extend(glob_in(source, pattern)?);
    }
    for pattern in patterns {
        for entry in glob_in(source, pattern)? {
            if ignored.contains(&entry) {
                continue;
            }
            let Some(name) = entry.file_name() else {
                continue;
            };
            let destination = target.join(name);
            if entry.is_dir() {
                copy_matching(&entry, &destination, patterns, ignore_patterns, copied)?;
            } else if entry != destination {
                debug!(from = %entry.display(), to = %destination.display(), "copy");
                std::fs::copy(&entry, &destination)?;
                copied.push(destination);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::plugin::DynPlugin;

    #[tokio::test]
    async fn test_copies_matches_and_skips_ignored() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.py"), "a").unwrap();
        std::fs::write(source.path().join("secret.py"), "s").unwrap();
        std::fs::create_dir(source.path().join("pkg")).unwrap();
        std::fs::write(source.path().join("pkg/b.py"), "b").unwrap();
        std::fs::write(source.path().join("pkg/readme.md"), "r").unwrap();

        let output = CopyFilesPlugin
            .invoke(
                json!({
                    "source_dir": source.path(),
                    "target_dir": target.path().join("out"),
                    "patterns": ["*.py", "pkg"],
                    "ignore_patterns": ["secret.py"],
                }),
                &Invocation::new(false),
            )
            .await
            .unwrap();

        let out = target.path().join("out");
        assert!(out.join("a.py").exists());
        assert!(out.join("pkg/b.py").exists());
        assert!(!out.join("pkg/readme.md").exists());
        assert!(!out.join("secret.py").exists());
        assert_eq!(output.output, "Copied 2 files");
    }
}
