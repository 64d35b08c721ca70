//! Solution markers and `.template` artifacts.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::config::checker::TemplateMode;
use crate::domain::error::{CheckerError, Result};

pub const TEMPLATE_SUFFIX: &str = ".template";
pub const SOLUTION_BEGIN: &str = "SOLUTION BEGIN";
pub const SOLUTION_END: &str = "SOLUTION END";
pub const PLACEHOLDER: &str = "TODO: Your solution";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)SOLUTION BEGIN(.*?)SOLUTION END").expect("marker regex is valid")
    })
}

pub fn has_markers(content: &str) -> bool {
    content.contains(SOLUTION_BEGIN) || content.contains(SOLUTION_END)
}

/// Replace every marker pair and what it encloses with the placeholder.
///
/// The comment prefix in front of `SOLUTION BEGIN` survives, so
/// `# SOLUTION BEGIN ... # SOLUTION END` becomes `# TODO: Your solution`.
/// Content without markers is returned unchanged.
pub fn fill_markers(content: &str) -> String {
    marker_regex().replace_all(content, PLACEHOLDER).into_owned()
}

/// Whether nothing but whitespace is left once the marker blocks are cut.
pub fn is_fully_templated(content: &str) -> bool {
    has_markers(content) && marker_regex().replace_all(content, "").trim().is_empty()
}

/// Markers must be balanced and pairs must not nest.
pub fn validate_markers(task: &str, file: &Path, content: &str) -> Result<()> {
    let begins = content.matches(SOLUTION_BEGIN).count();
    let ends = content.matches(SOLUTION_END).count();
    if begins != ends {
        return Err(CheckerError::ExportIntegrity(format!(
            "task `{task}`: {} has {begins} `{SOLUTION_BEGIN}` but {ends} `{SOLUTION_END}`",
            file.display()
        )));
    }
    for pair in marker_regex().captures_iter(content) {
        let inner = pair.get(1).map_or("", |m| m.as_str());
        if inner.contains(SOLUTION_BEGIN) || inner.contains(SOLUTION_END) {
            return Err(CheckerError::ExportIntegrity(format!(
                "task `{task}`: {} has nested solution markers",
                file.display()
            )));
        }
    }
    Ok(())
}

/// Template artifacts found inside one task folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateScan {
    /// `.template` files and folders.
    pub template_paths: Vec<PathBuf>,
    /// Text files carrying solution markers.
    pub marker_files: Vec<PathBuf>,
}

impl TemplateScan {
    /// Walk `task_dir`, checking that every `x.template` has an `x` sibling
    /// and that marker pairs are well formed.
    pub fn scan(task: &str, task_dir: &Path) -> Result<Self> {
        let mut scan = Self::default();
        for entry in WalkDir::new(task_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| CheckerError::Io(e.into()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();

            if let Some(original) = name.strip_suffix(TEMPLATE_SUFFIX) {
                if !path.with_file_name(original).exists() {
                    return Err(CheckerError::ExportIntegrity(format!(
                        "task `{task}`: template {} has no original `{original}`",
                        path.display()
                    )));
                }
                scan.template_paths.push(path.to_path_buf());
            }

            if entry.file_type().is_file() {
                let Some(content) = read_text(path) else {
                    continue;
                };
                if has_markers(&content) {
                    validate_markers(task, path, &content)?;
                    scan.marker_files.push(path.to_path_buf());
                }
            }
        }
        Ok(scan)
    }

    pub fn has_templates(&self) -> bool {
        !self.template_paths.is_empty()
    }

    pub fn has_markers(&self) -> bool {
        !self.marker_files.is_empty()
    }

    /// Check the artifacts against the configured strategy.
    pub fn check_mode(&self, task: &str, mode: TemplateMode) -> Result<()> {
        let fail = |msg: String| Err(CheckerError::ExportIntegrity(format!("task `{task}`: {msg}")));
        match mode {
            TemplateMode::Search => {
                if self.has_markers() {
                    return fail("templating is `search` but solution markers are present".into());
                }
                if !self.has_templates() {
                    return fail("no `.template` file or folder found".into());
                }
            }
            TemplateMode::Create => {
                if self.has_templates() {
                    return fail("templating is `create` but `.template` artifacts are present".into());
                }
                if !self.has_markers() {
                    return fail(format!(
                        "no `{SOLUTION_BEGIN}` / `{SOLUTION_END}` pair found"
                    ));
                }
            }
            TemplateMode::SearchOrCreate => {
                if self.has_templates() && self.has_markers() {
                    return fail("cannot mix `.template` artifacts and solution markers".into());
                }
                if !self.has_templates() && !self.has_markers() {
                    return fail("no `.template` artifact and no solution markers found".into());
                }
            }
        }
        Ok(())
    }
}

/// File content if it is valid UTF-8 text.
pub fn read_text(path: &Path) -> Option<String> {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_markers_keeps_comment_prefix() {
        let content = "def f():\n    # SOLUTION BEGIN\n    return 42\n    # SOLUTION END\n";
        let filled = fill_markers(content);
        assert_eq!(filled, "def f():\n    # TODO: Your solution\n");
        assert_eq!(filled.matches(PLACEHOLDER).count(), 1);
        assert!(!filled.contains("42"));
    }

    #[test]
    fn test_fill_markers_is_non_greedy_and_idempotent() {
        let content = "a\n// SOLUTION BEGIN\nx\n// SOLUTION END\nb\n// SOLUTION BEGIN\ny\n// SOLUTION END\n";
        let filled = fill_markers(content);
        assert_eq!(filled.matches(PLACEHOLDER).count(), 2);
        assert!(filled.contains("\nb\n"));
        assert_eq!(fill_markers(&filled), filled);
    }

    #[test]
    fn test_fully_templated_detection() {
        assert!(is_fully_templated("SOLUTION BEGIN\nsecret\nSOLUTION END\n"));
        assert!(!is_fully_templated("# SOLUTION BEGIN\nsecret\n# SOLUTION END\n"));
        assert!(!is_fully_templated("plain file\n"));
    }

    #[test]
    fn test_validate_markers() {
        let path = Path::new("solution.py");
        assert!(validate_markers("t", path, "SOLUTION BEGIN x SOLUTION END").is_ok());

        let err = validate_markers("t", path, "SOLUTION BEGIN x").unwrap_err();
        assert!(matches!(err, CheckerError::ExportIntegrity(_)));

        let nested = "SOLUTION BEGIN a SOLUTION BEGIN b SOLUTION END c SOLUTION END";
        assert!(validate_markers("t", path, nested).is_err());
    }

    #[test]
    fn test_scan_and_mode_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("solution.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("solution.py.template"), "").unwrap();

        let scan = TemplateScan::scan("hello", dir.path()).unwrap();
        assert_eq!(scan.template_paths.len(), 1);
        scan.check_mode("hello", TemplateMode::Search).unwrap();
        scan.check_mode("hello", TemplateMode::SearchOrCreate).unwrap();
        assert!(scan.check_mode("hello", TemplateMode::Create).is_err());
    }

    #[test]
    fn test_orphan_template_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.cpp.template"), "int main() {}\n").unwrap();
        let err = TemplateScan::scan("hello", dir.path()).unwrap_err();
        assert!(err.to_string().contains("has no original"));
    }
}
