//! Course layout: which tasks and groups exist on disk and which of them a
//! submission touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::checker::{ChangesDetection, CheckerConfig, SubConfig};
use crate::config::resolver::{resolve, EffectiveConfig};
use crate::config::{GROUP_MARKER, TASK_MARKER};
use crate::deadlines::DeadlineSchedule;
use crate::domain::error::{CheckerError, Result};
use crate::git;

/// A folder carrying a `.task.yml` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemTask {
    pub name: String,
    /// Path relative to the course root, `/`-separated.
    pub relative_path: String,
    /// Enclosing group folder, if the task sits below a `.group.yml`.
    pub group: Option<String>,
    pub config: SubConfig,
}

/// A folder carrying a `.group.yml` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemGroup {
    pub name: String,
    pub relative_path: String,
    pub config: SubConfig,
    pub tasks: Vec<String>,
}

/// Tasks and groups discovered in the reference tree, joined with the schedule.
#[derive(Debug, Clone)]
pub struct Course {
    pub schedule: DeadlineSchedule,
    pub repository_root: PathBuf,
    pub reference_root: PathBuf,
    /// Used by `branch_name` detection when HEAD is detached.
    pub branch_override: Option<String>,
    groups: BTreeMap<String, FileSystemGroup>,
    tasks: BTreeMap<String, FileSystemTask>,
}

impl Course {
    /// Walk `reference_root` for task and group markers.
    ///
    /// Fails when two tasks or two groups share a folder name.
    pub fn discover(
        schedule: DeadlineSchedule,
        repository_root: &Path,
        reference_root: Option<&Path>,
    ) -> Result<Self> {
        let reference_root = reference_root.unwrap_or(repository_root).to_path_buf();
        let mut groups: BTreeMap<String, FileSystemGroup> = BTreeMap::new();
        let mut tasks: BTreeMap<String, FileSystemTask> = BTreeMap::new();

        let walker = WalkDir::new(&reference_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        // group markers first so tasks can find their parent
        let mut task_markers = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| CheckerError::Io(e.into()))?;
            let file_name = entry.file_name().to_string_lossy();
            if file_name != GROUP_MARKER && file_name != TASK_MARKER {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let name = folder_name(dir);
            let relative_path = relative(&reference_root, dir);
            let config = SubConfig::from_marker(entry.path())?;

            if file_name == GROUP_MARKER {
                let group = FileSystemGroup {
                    name: name.clone(),
                    relative_path,
                    config,
                    tasks: Vec::new(),
                };
                if groups.insert(name.clone(), group).is_some() {
                    return Err(CheckerError::config(format!(
                        "group name `{name}` is used by more than one folder"
                    )));
                }
            } else {
                task_markers.push((name, relative_path, config));
            }
        }

        for (name, relative_path, config) in task_markers {
            let group = groups
                .values_mut()
                .filter(|g| is_under(&relative_path, &g.relative_path))
                .max_by_key(|g| g.relative_path.len());
            let group_name = group.map(|g| {
                g.tasks.push(name.clone());
                g.name.clone()
            });
            let task = FileSystemTask {
                name: name.clone(),
                relative_path,
                group: group_name,
                config,
            };
            if tasks.insert(name.clone(), task).is_some() {
                return Err(CheckerError::config(format!(
                    "task name `{name}` is used by more than one folder"
                )));
            }
        }

        if let Some(clash) = tasks.keys().find(|name| {
            groups
                .get(*name)
                .is_some_and(|g| !(g.tasks.len() == 1 && &g.tasks[0] == *name))
        }) {
            return Err(CheckerError::config(format!(
                "`{clash}` names both a task and a group"
            )));
        }

        debug!(
            groups = groups.len(),
            tasks = tasks.len(),
            root = %reference_root.display(),
            "discovered course layout"
        );

        Ok(Self {
            schedule,
            repository_root: repository_root.to_path_buf(),
            reference_root,
            branch_override: None,
            groups,
            tasks,
        })
    }

    pub fn with_branch_override(mut self, branch: Option<String>) -> Self {
        self.branch_override = branch;
        self
    }

    /// Every enabled scheduled task must exist on disk; missing groups only warn.
    pub fn validate(&self) -> Result<()> {
        let now = Utc::now();
        for group in self.schedule.get_groups(Some(true), None, now) {
            if !self.groups.contains_key(&group.group) {
                warn!(group = %group.group, "group not found in repository");
            }
        }
        for task in self.schedule.get_tasks(Some(true), None, None, now) {
            if !self.tasks.contains_key(&task.task) {
                return Err(CheckerError::config(format!(
                    "task `{}` not found in repository",
                    task.task
                )));
            }
        }
        Ok(())
    }

    pub fn find_task(&self, name: &str) -> Option<&FileSystemTask> {
        self.tasks.get(name)
    }

    pub fn find_group(&self, name: &str) -> Option<&FileSystemGroup> {
        self.groups.get(name)
    }

    /// Every task found on disk, scheduled or not.
    pub fn all_tasks(&self) -> impl Iterator<Item = &FileSystemTask> {
        self.tasks.values()
    }

    /// Scheduled tasks that exist on disk, in schedule order.
    pub fn get_tasks(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Utc>,
    ) -> Vec<&FileSystemTask> {
        self.schedule
            .get_tasks(enabled, started, None, now)
            .into_iter()
            .filter_map(|t| self.tasks.get(&t.task))
            .collect()
    }

    /// Scheduled groups that exist on disk, in schedule order.
    pub fn get_groups(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Utc>,
    ) -> Vec<&FileSystemGroup> {
        self.schedule
            .get_groups(enabled, started, now)
            .into_iter()
            .filter_map(|g| self.groups.get(&g.group))
            .collect()
    }

    /// Deadline group of a task: the enclosing folder, else the schedule.
    pub fn group_of(&self, task: &FileSystemTask) -> Option<String> {
        task.group.clone().or_else(|| {
            self.schedule
                .find_task(&task.name)
                .map(|(group, _)| group.group.clone())
        })
    }

    /// Root config with the task's group and task layers applied.
    pub fn effective_config(
        &self,
        root: &CheckerConfig,
        task: &FileSystemTask,
    ) -> Result<EffectiveConfig> {
        let group = task
            .group
            .as_ref()
            .and_then(|g| self.groups.get(g))
            .map(|g| &g.config);
        resolve(root, group, Some(&task.config))
    }

    /// Tasks touched by the current submission.
    pub fn detect_changes(&self, mode: ChangesDetection) -> Result<Vec<&FileSystemTask>> {
        let now = Utc::now();
        info!(mode = ?mode, "detecting changes");
        if mode == ChangesDetection::Files {
            return Err(CheckerError::Unsupported(
                "changes_detection `files` is declared but not implemented".to_string(),
            ));
        }
        if !git::is_git_repo(&self.repository_root) {
            return Err(CheckerError::Git(format!(
                "git repository in {} not found",
                self.repository_root.display()
            )));
        }

        let candidates = self.get_tasks(Some(true), None, now);
        let enabled_groups = self.schedule.get_groups(Some(true), None, now);

        let changed = match mode {
            ChangesDetection::BranchName => {
                let branch = match git::current_branch(&self.repository_root)? {
                    Some(branch) => branch,
                    None => self.branch_override.clone().ok_or_else(|| {
                        CheckerError::Git(
                            "detached HEAD state and no branch name provided".to_string(),
                        )
                    })?,
                };
                debug!(branch = %branch, "branch name");
                self.select(&candidates, &enabled_groups, |name| name == branch)
            }
            ChangesDetection::CommitMessage => {
                let message = git::head_commit_message(&self.repository_root)?;
                debug!(message = %message, "commit message");
                self.select(&candidates, &enabled_groups, |name| message.contains(name))
            }
            ChangesDetection::LastCommitChanges => {
                let files = git::last_commit_changes(&self.repository_root)?;
                debug!(?files, "last commit changes");
                candidates
                    .into_iter()
                    .filter(|task| files.iter().any(|f| is_under(f, &task.relative_path)))
                    .collect()
            }
            ChangesDetection::Files => Vec::new(),
        };

        if changed.is_empty() {
            warn!(mode = ?mode, "no active tasks found for this submission");
        } else {
            info!(
                tasks = ?changed.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                "changed tasks"
            );
        }
        Ok(changed)
    }

    /// Groups first: if any enabled group matches, all its tasks are selected;
    /// otherwise tasks are matched by their own names.
    fn select<'a>(
        &'a self,
        candidates: &[&'a FileSystemTask],
        enabled_groups: &[&crate::deadlines::DeadlineScheduleEntry],
        matches: impl Fn(&str) -> bool,
    ) -> Vec<&'a FileSystemTask> {
        let group_tasks: Vec<&str> = enabled_groups
            .iter()
            .filter(|g| matches(&g.group))
            .flat_map(|g| g.tasks.iter().map(|t| t.task.as_str()))
            .collect();
        if !group_tasks.is_empty() {
            return candidates
                .iter()
                .copied()
                .filter(|t| group_tasks.contains(&t.name.as_str()))
                .collect();
        }
        candidates
            .iter()
            .copied()
            .filter(|t| matches(&t.name))
            .collect()
    }
}

fn folder_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn relative(root: &Path, dir: &Path) -> String {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// `path` equals `dir` or lies below it (`/`-separated relative paths).
fn is_under(path: &str, dir: &str) -> bool {
    dir.is_empty() || path == dir || path.starts_with(&format!("{dir}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manytask::ManytaskConfig;
    use crate::git::tests::{commit_file, make_git_repo, run_git};

    const MANYTASK: &str = r#"
version: 1
settings: {timezone: UTC}
schedule:
  - group: intro
    start: 2020-01-01 00:00
    end: 3000-01-01 00:00
    tasks:
      - {task: hello, score: 10}
      - {task: sum, score: 10}
  - group: later
    enabled: false
    start: 2020-01-01 00:00
    end: 3000-01-01 00:00
    tasks:
      - {task: sort, score: 10}
"#;

    fn schedule() -> DeadlineSchedule {
        ManytaskConfig::from_yaml_str(MANYTASK).unwrap().schedule
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn layout(root: &Path) {
        write(root, "intro/.group.yml", "");
        write(root, "intro/hello/.task.yml", "");
        write(root, "intro/hello/solution.py", "print('hi')\n");
        write(
            root,
            "intro/sum/.task.yml",
            "version: 1\nparameters:\n  timeout: 3\n",
        );
        write(root, "later/sort/.task.yml", "");
    }

    #[test]
    fn test_discover_layout() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        let course = Course::discover(schedule(), dir.path(), None).unwrap();

        let hello = course.find_task("hello").unwrap();
        assert_eq!(hello.relative_path, "intro/hello");
        assert_eq!(hello.group.as_deref(), Some("intro"));

        let sort = course.find_task("sort").unwrap();
        assert_eq!(sort.group, None);
        assert_eq!(course.group_of(sort).as_deref(), Some("later"));

        assert_eq!(
            course.find_group("intro").unwrap().tasks,
            vec!["hello".to_string(), "sum".to_string()]
        );
        course.validate().unwrap();

        let enabled: Vec<_> = course
            .get_tasks(Some(true), None, Utc::now())
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(enabled, vec!["hello", "sum"]);
    }

    #[test]
    fn test_effective_config_applies_task_layer() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        let course = Course::discover(schedule(), dir.path(), None).unwrap();
        let root = CheckerConfig::from_yaml_str("version: 1\ndefault_parameters: {timeout: 10}\n")
            .unwrap();

        let sum = course.find_task("sum").unwrap();
        let config = course.effective_config(&root, sum).unwrap();
        assert_eq!(config.timeout_secs(), Some(3.0));
    }

    #[test]
    fn test_duplicate_task_folder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        write(dir.path(), "extra/hello/.task.yml", "");
        let err = Course::discover(schedule(), dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("`hello`"));
    }

    #[test]
    fn test_missing_scheduled_task_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "intro/hello/.task.yml", "");
        let course = Course::discover(schedule(), dir.path(), None).unwrap();
        assert!(course.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_detect_by_last_commit_changes() {
        let repo = make_git_repo();
        layout(repo.path());
        run_git(repo.path(), &["add", "."]);
        run_git(repo.path(), &["commit", "-m", "layout"]);
        commit_file(repo.path(), "intro/sum/solution.py", "def f(): pass\n", "work");

        let course = Course::discover(schedule(), repo.path(), None).unwrap();
        let changed = course
            .detect_changes(ChangesDetection::LastCommitChanges)
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "sum");
    }

    #[test]
    fn test_detect_by_commit_message_prefers_groups() {
        let repo = make_git_repo();
        layout(repo.path());
        run_git(repo.path(), &["add", "."]);
        run_git(repo.path(), &["commit", "-m", "intro done"]);

        let course = Course::discover(schedule(), repo.path(), None).unwrap();
        let changed = course.detect_changes(ChangesDetection::CommitMessage).unwrap();
        let names: Vec<_> = changed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["hello", "sum"]);
    }

    #[test]
    fn test_detect_by_branch_name() {
        let repo = make_git_repo();
        layout(repo.path());
        run_git(repo.path(), &["add", "."]);
        run_git(repo.path(), &["commit", "-m", "layout"]);
        run_git(repo.path(), &["checkout", "-b", "hello"]);

        let course = Course::discover(schedule(), repo.path(), None).unwrap();
        let changed = course.detect_changes(ChangesDetection::BranchName).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "hello");
    }

    #[test]
    fn test_detached_head_uses_branch_override() {
        let repo = make_git_repo();
        layout(repo.path());
        run_git(repo.path(), &["add", "."]);
        run_git(repo.path(), &["commit", "-m", "layout"]);
        run_git(repo.path(), &["checkout", "--detach", "HEAD"]);

        let course = Course::discover(schedule(), repo.path(), None).unwrap();
        assert!(course.detect_changes(ChangesDetection::BranchName).is_err());

        let course = course.with_branch_override(Some("sum".to_string()));
        let changed = course.detect_changes(ChangesDetection::BranchName).unwrap();
        assert_eq!(changed[0].name, "sum");
    }

    #[test]
    fn test_files_detection_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        let course = Course::discover(schedule(), dir.path(), None).unwrap();
        let err = course.detect_changes(ChangesDetection::Files).unwrap_err();
        assert!(matches!(err, CheckerError::Unsupported(_)));
    }
}
