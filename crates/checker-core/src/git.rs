//! Git helpers for change detection and export commits.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::domain::error::{CheckerError, Result};

/// Run `git <args>` in `repo_dir`, returning trimmed stdout.
fn git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    debug!(?args, dir = %repo_dir.display(), "git");
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CheckerError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CheckerError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Capture the HEAD commit SHA.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let sha = git(repo_dir, &["rev-parse", "HEAD"])?;
    if sha.is_empty() {
        return Err(CheckerError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Name of the checked-out branch, `None` on a detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Result<Option<String>> {
    let name = git(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(match name.as_str() {
        "" | "HEAD" => None,
        _ => Some(name),
    })
}

/// Full message of the HEAD commit.
pub fn head_commit_message(repo_dir: &Path) -> Result<String> {
    git(repo_dir, &["log", "-1", "--format=%B"])
}

/// Paths touched by the last commit (`HEAD~1..HEAD`); for a root commit,
/// every file it adds.
pub fn last_commit_changes(repo_dir: &Path) -> Result<Vec<String>> {
    let listing = match git(repo_dir, &["diff", "--name-only", "HEAD~1", "HEAD"]) {
        Ok(listing) => listing,
        Err(_) => git(
            repo_dir,
            &["show", "--name-only", "--pretty=format:", "HEAD"],
        )?,
    };
    Ok(listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Stage everything, commit and push to `branch` with CI skipped.
///
/// Returns `false` when there was nothing to commit.
pub fn commit_and_push(repo_dir: &Path, message: &str, branch: &str) -> Result<bool> {
    git(repo_dir, &["add", "--all", "."])?;
    if git(repo_dir, &["status", "--porcelain"])?.is_empty() {
        return Ok(false);
    }
    git(repo_dir, &["commit", "-m", message])?;
    git(
        repo_dir,
        &["push", "-o", "ci.skip", "origin", &format!("HEAD:{branch}")],
    )?;
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command as StdCommand;

    pub(crate) fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub(crate) fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-b", "main"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    pub(crate) fn commit_file(repo_dir: &Path, rel: &str, content: &str, message: &str) {
        let path = repo_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        run_git(repo_dir, &["add", "."]);
        run_git(repo_dir, &["commit", "-m", message]);
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
        assert!(!is_git_repo(dir.path()));
    }

    #[test]
    fn branch_and_message() {
        let repo = make_git_repo();
        commit_file(repo.path(), "hello/solution.py", "x = 1\n", "solve hello");

        assert_eq!(current_branch(repo.path()).unwrap().as_deref(), Some("main"));
        assert_eq!(head_commit_message(repo.path()).unwrap(), "solve hello");

        let sha = capture_head_sha(repo.path()).unwrap();
        run_git(repo.path(), &["checkout", "--detach", &sha]);
        assert_eq!(current_branch(repo.path()).unwrap(), None);
    }

    #[test]
    fn last_commit_changes_lists_paths() {
        let repo = make_git_repo();
        commit_file(repo.path(), "intro/hello/solution.py", "x = 1\n", "first");
        commit_file(repo.path(), "intro/sum/solution.py", "y = 2\n", "second");

        let changes = last_commit_changes(repo.path()).unwrap();
        assert_eq!(changes, vec!["intro/sum/solution.py".to_string()]);
    }

    #[test]
    fn commit_and_push_reports_nothing_to_commit() {
        let repo = make_git_repo();
        assert!(!commit_and_push(repo.path(), "export", "main").unwrap());
    }
}
