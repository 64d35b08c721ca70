//! Private → public repository export.
//!
//! Files are classified per directory level against the structure globs in
//! force there: `ignore` drops a path outright, `private` is never exported,
//! `public` is exported, anything else is "other". Entering a folder that
//! carries its own structure override restarts matching with that override.

pub mod templating;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::checker::{ExportConfig, StructureConfig, TemplateMode};
use crate::config::resolver::validate_patterns;
use crate::course::Course;
use crate::domain::error::{CheckerError, Result};
use crate::git;

pub use templating::{
    fill_markers, is_fully_templated, TemplateScan, PLACEHOLDER, SOLUTION_BEGIN, SOLUTION_END,
    TEMPLATE_SUFFIX,
};

/// Which classes of files one copy pass takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    pub public: bool,
    pub private: bool,
    pub other: bool,
    /// Apply templating; otherwise `.template` artifacts are dropped and
    /// markers left untouched.
    pub fill_templates: bool,
}

impl CopyPlan {
    pub const PUBLIC: CopyPlan = CopyPlan {
        public: true,
        private: false,
        other: true,
        fill_templates: true,
    };
}

/// Glob match from the right, like a relative path pattern: `b/*.py`
/// matches `a/b/c.py`; a plain pattern matches the file name.
pub fn path_matches(rel_path: &str, pattern: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_parts: Vec<&str> = rel_path.split('/').filter(|p| !p.is_empty()).collect();
    if pattern_parts.len() > path_parts.len() {
        return false;
    }
    let tail = &path_parts[path_parts.len() - pattern_parts.len()..];
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    pattern_parts.iter().zip(tail).all(|(pattern, part)| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches_with(part, options))
            .unwrap_or(false)
    })
}

fn matches_any(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| path_matches(rel_path, p))
}

/// Export a single task folder into `target`.
///
/// Returns the written files relative to `target`. Fails with
/// [`CheckerError::ExportIntegrity`] when the folder has no template
/// artifact for `mode`.
pub fn export(
    task_name: &str,
    task_dir: &Path,
    structure: &StructureConfig,
    mode: TemplateMode,
    target: &Path,
) -> Result<Vec<PathBuf>> {
    validate_patterns(structure)?;
    let scan = TemplateScan::scan(task_name, task_dir)?;
    scan.check_mode(task_name, mode)?;

    let copier = TreeCopier {
        mode,
        sub_configs: HashMap::new(),
        skip: Vec::new(),
        global_root: task_dir.to_path_buf(),
    };
    let plan = CopyPlan {
        other: false,
        ..CopyPlan::PUBLIC
    };
    let mut written = Vec::new();
    copier.copy_dir(task_dir, target, structure, plan, &mut written)?;

    Ok(written
        .into_iter()
        .map(|p| p.strip_prefix(target).map(Path::to_path_buf).unwrap_or(p))
        .collect())
}

/// Course-wide exporter.
pub struct Exporter<'a> {
    course: &'a Course,
    structure: StructureConfig,
    export: ExportConfig,
    sub_configs: HashMap<String, StructureConfig>,
}

impl<'a> Exporter<'a> {
    pub fn new(course: &'a Course, structure: StructureConfig, export: ExportConfig) -> Self {
        let now = Utc::now();
        let mut sub_configs = HashMap::new();
        for group in course.get_groups(Some(true), None, now) {
            if let Some(structure) = &group.config.structure {
                sub_configs.insert(group.relative_path.clone(), structure.clone());
            }
        }
        for task in course.get_tasks(Some(true), None, now) {
            if let Some(structure) = &task.config.structure {
                sub_configs.insert(task.relative_path.clone(), structure.clone());
            }
        }
        Self {
            course,
            structure,
            export,
            sub_configs,
        }
    }

    pub fn mode(&self) -> TemplateMode {
        self.export.templates
    }

    /// Course, pattern and per-task template checks.
    pub fn validate(&self) -> Result<()> {
        self.course.validate()?;
        validate_patterns(&self.structure)?;
        for structure in self.sub_configs.values() {
            validate_patterns(structure)?;
        }

        let root = &self.course.reference_root;
        for task in self.course.get_tasks(Some(true), None, Utc::now()) {
            let task_dir = root.join(&task.relative_path);
            let scan = TemplateScan::scan(&task.name, &task_dir)?;
            scan.check_mode(&task.name, self.export.templates)?;

            if self.export.templates == TemplateMode::Search {
                let structure = self.structure_for(&task.relative_path);
                if !has_public_file(&task_dir, &structure)? {
                    return Err(CheckerError::config(format!(
                        "task `{}` has no file matching public_patterns",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Copy the reference tree into `target` with templates filled, leaving
    /// out private files and disabled or not yet started groups and tasks.
    pub fn export_public(&self, target: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(target)?;
        let course = self.course;
        let mut skip: Vec<String> = Vec::new();
        for group in course
            .get_groups(Some(false), None, now)
            .into_iter()
            .chain(course.get_groups(None, Some(false), now))
        {
            skip.push(group.relative_path.clone());
        }
        for task in course
            .get_tasks(Some(false), None, now)
            .into_iter()
            .chain(course.get_tasks(None, Some(false), now))
        {
            skip.push(task.relative_path.clone());
        }

        info!(
            from = %course.reference_root.display(),
            to = %target.display(),
            skipped = skip.len(),
            "exporting public files"
        );
        let mut written = Vec::new();
        self.copier(&course.reference_root, skip).copy_dir(
            &course.reference_root,
            target,
            &self.structure,
            CopyPlan::PUBLIC,
            &mut written,
        )?;
        Ok(written)
    }

    /// Build the tree tests run against: the student's "other" files overlaid
    /// with the reference public and private files. Templates are not touched.
    pub fn export_for_testing(&self, target: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(target)?;
        let course = self.course;
        let mut written = Vec::new();

        info!(from = %course.repository_root.display(), to = %target.display(), "copying submission");
        self.copier(&course.repository_root, Vec::new()).copy_dir(
            &course.repository_root,
            target,
            &self.structure,
            CopyPlan {
                public: false,
                private: false,
                other: true,
                fill_templates: false,
            },
            &mut written,
        )?;

        info!(from = %course.reference_root.display(), to = %target.display(), "copying reference files");
        self.copier(&course.reference_root, Vec::new()).copy_dir(
            &course.reference_root,
            target,
            &self.structure,
            CopyPlan {
                public: true,
                private: true,
                other: false,
                fill_templates: false,
            },
            &mut written,
        )?;
        Ok(written)
    }

    /// Commit everything in `target` and push it to the export branch.
    pub fn commit(&self, target: &Path) -> Result<bool> {
        let pushed = git::commit_and_push(
            target,
            &self.export.commit_message,
            &self.export.default_branch,
        )?;
        if pushed {
            info!(branch = %self.export.default_branch, "pushed export");
        } else {
            info!("nothing to commit");
        }
        Ok(pushed)
    }

    fn copier(&self, root: &Path, skip: Vec<String>) -> TreeCopier {
        TreeCopier {
            mode: self.export.templates,
            sub_configs: self.sub_configs.clone(),
            skip,
            global_root: root.to_path_buf(),
        }
    }

    /// Structure rules in force inside `rel_dir`.
    fn structure_for(&self, rel_dir: &str) -> StructureConfig {
        let mut structure = self.structure.clone();
        let mut prefix = String::new();
        for part in rel_dir.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if let Some(layer) = self.sub_configs.get(&prefix) {
                structure = structure.overlay(layer);
            }
        }
        structure
    }
}

fn has_public_file(task_dir: &Path, structure: &StructureConfig) -> Result<bool> {
    for entry in walkdir::WalkDir::new(task_dir).min_depth(1) {
        let entry = entry.map_err(|e| CheckerError::Io(e.into()))?;
        let rel = relative(task_dir, entry.path());
        if entry.file_type().is_file()
            && !matches_any(&rel, structure.ignore())
            && matches_any(&rel, structure.public())
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Public,
    Private,
    Other,
}

struct TreeCopier {
    mode: TemplateMode,
    /// Structure overrides keyed by directory path relative to `global_root`.
    sub_configs: HashMap<String, StructureConfig>,
    /// Relative directories left out entirely.
    skip: Vec<String>,
    global_root: PathBuf,
}

impl TreeCopier {
    fn copy_dir(
        &self,
        root: &Path,
        destination: &Path,
        config: &StructureConfig,
        plan: CopyPlan,
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        self.copy_level(root, destination, config, plan, Class::Other, written)
    }

    /// Copy one directory level. Entries matching no pattern take the class
    /// of the folder they sit in (`inherited`).
    fn copy_level(
        &self,
        root: &Path,
        destination: &Path,
        config: &StructureConfig,
        plan: CopyPlan,
        inherited: Class,
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let rel_root = relative(&self.global_root, root);
        if !rel_root.is_empty() && self.skip.contains(&rel_root) {
            debug!(path = %rel_root, "skipped: disabled or not started");
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(root)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();

        let excluded = self.excluded_names(&entries, plan.fill_templates);

        for path in entries {
            let name = file_name(&path);
            let rel = relative(&self.global_root, &path);
            if excluded.contains(&name) {
                debug!(path = %rel, "skipped: replaced by templating");
                continue;
            }
            if matches_any(&rel, config.ignore()) {
                continue;
            }

            let class = if matches_any(&rel, config.private()) {
                Class::Private
            } else if matches_any(&rel, config.public()) {
                Class::Public
            } else {
                inherited
            };
            let is_dir = path.is_dir();
            let wanted = match class {
                Class::Private => plan.private,
                // folders are entered anyway, they may hold wanted files
                Class::Public => plan.public || (is_dir && plan.private),
                Class::Other => plan.other || is_dir,
            };
            if !wanted {
                continue;
            }

            let is_template = self.mode.uses_template_files() && name.ends_with(TEMPLATE_SUFFIX);
            let mut dest = destination.join(&name);
            if plan.fill_templates && is_template {
                if is_empty(&path)? {
                    debug!(path = %rel, "skipped: empty template removes the original");
                    continue;
                }
                dest = destination.join(name.trim_end_matches(TEMPLATE_SUFFIX));
            }

            if is_dir {
                let sub_config = match self.sub_configs.get(&rel) {
                    Some(layer) => config.overlay(layer),
                    None => config.clone(),
                };
                self.copy_level(&path, &dest, &sub_config, plan, class, written)?;
            } else {
                self.copy_file(&path, &dest, plan.fill_templates)?;
                written.push(dest);
            }
        }
        Ok(())
    }

    /// Names in one directory that templating hides.
    fn excluded_names(&self, entries: &[PathBuf], fill_templates: bool) -> Vec<String> {
        let mut excluded = Vec::new();
        if self.mode.uses_template_files() {
            for path in entries {
                let name = file_name(path);
                if let Some(original) = name.strip_suffix(TEMPLATE_SUFFIX) {
                    excluded.push(if fill_templates {
                        original.to_string()
                    } else {
                        name.clone()
                    });
                }
            }
        }
        if fill_templates && self.mode.uses_template_comments() {
            for path in entries.iter().filter(|p| p.is_file()) {
                if templating::read_text(path).is_some_and(|c| is_fully_templated(&c)) {
                    excluded.push(file_name(path));
                }
            }
        }
        excluded
    }

    fn copy_file(&self, from: &Path, to: &Path, fill_templates: bool) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if fill_templates && self.mode.uses_template_comments() {
            if let Some(content) = templating::read_text(from) {
                if templating::has_markers(&content) {
                    fs::write(to, fill_markers(&content))?;
                    return Ok(());
                }
            }
        }
        fs::copy(from, to)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_empty(path: &Path) -> Result<bool> {
    if path.is_dir() {
        Ok(fs::read_dir(path)?.next().is_none())
    } else {
        Ok(fs::metadata(path)?.len() == 0)
    }
}
