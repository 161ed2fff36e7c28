//! The Workspace Driver (C4): one checkout per `QueueSpec`, shelled out to
//! the `git` binary. Grounded in `gerrit_mq/functions.py`'s merge-and-verify
//! routine, which drives `git` the same way — one subprocess per operation,
//! no bindings library.

use std::process::Command;

use anyhow::{Context, Result};

use crate::error::WorkspaceError;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(args, &[])
    }

    pub fn exec_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd.output().with_context(|| {
            format!("failed to spawn git -C {} {}", self.repo_path, args.join(" "))
        })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn require(&self, op: &str, result: ExecResult) -> Result<ExecResult, WorkspaceError> {
        if result.success() {
            Ok(result)
        } else {
            Err(WorkspaceError::Command {
                op: op.to_string(),
                detail: result.combined_output(),
            })
        }
    }

    /// Clone `remote_url` into `repo_path` if it doesn't yet exist or is
    /// missing its `.git` directory.
    pub fn ensure_cloned(&self, remote_url: &str) -> Result<(), WorkspaceError> {
        let git_dir = std::path::Path::new(&self.repo_path).join(".git");
        if git_dir.is_dir() {
            return Ok(());
        }
        if let Some(parent) = std::path::Path::new(&self.repo_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::Command {
                op: "mkdir".into(),
                detail: e.to_string(),
            })?;
        }
        let output = Command::new("git")
            .args(["clone", remote_url, &self.repo_path])
            .output()
            .map_err(|e| WorkspaceError::Command {
                op: "clone".into(),
                detail: e.to_string(),
            })?;
        let result = ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        };
        self.require("clone", result)?;
        Ok(())
    }

    /// Fetch every ref from `origin` and prune stale remote-tracking refs.
    pub fn fetch(&self) -> Result<(), WorkspaceError> {
        let result = self
            .exec(&["fetch", "--prune", "origin"])
            .map_err(|e| WorkspaceError::Command {
                op: "fetch".into(),
                detail: e.to_string(),
            })?;
        self.require("fetch", result)?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<(), WorkspaceError> {
        let result = self
            .exec(&["checkout", branch])
            .map_err(|e| WorkspaceError::Command {
                op: "checkout".into(),
                detail: e.to_string(),
            })?;
        self.require("checkout", result)?;
        Ok(())
    }

    pub fn create_branch(&self, name: &str, base: &str) -> Result<(), WorkspaceError> {
        let result = self
            .exec(&["checkout", "-B", name, base])
            .map_err(|e| WorkspaceError::Command {
                op: "create_branch".into(),
                detail: e.to_string(),
            })?;
        self.require("create_branch", result)?;
        Ok(())
    }

    fn head_author(&self) -> Result<(String, String), WorkspaceError> {
        let name = self
            .exec(&["log", "-1", "--format=%an"])
            .map_err(|e| WorkspaceError::Command {
                op: "log author name".into(),
                detail: e.to_string(),
            })?;
        let email = self
            .exec(&["log", "-1", "--format=%ae"])
            .map_err(|e| WorkspaceError::Command {
                op: "log author email".into(),
                detail: e.to_string(),
            })?;
        Ok((name.stdout.trim().to_string(), email.stdout.trim().to_string()))
    }

    pub fn is_clean(&self) -> Result<bool, WorkspaceError> {
        let result = self
            .exec(&["status", "--porcelain"])
            .map_err(|e| WorkspaceError::Command {
                op: "status".into(),
                detail: e.to_string(),
            })?;
        Ok(result.stdout.trim().is_empty())
    }

    /// Check out `into`, merge `from` with `--no-commit`, then commit using
    /// the default merge message via a no-op editor shim. Author is forced
    /// to the current HEAD's author. A merge that produces no change (clean
    /// worktree after `--no-commit`) is a silent no-op, not an error; a
    /// worktree left dirty by a failed commit is surfaced.
    pub fn checkout_and_merge(&self, into: &str, from: &str) -> Result<(), WorkspaceError> {
        self.checkout(into)?;
        let merge = self
            .exec(&["merge", "--no-commit", "--no-ff", from])
            .map_err(|e| WorkspaceError::Command {
                op: "merge".into(),
                detail: e.to_string(),
            })?;
        if !merge.success() {
            let abort = self.exec(&["merge", "--abort"]);
            let still_dirty = !self.is_clean().unwrap_or(true);
            if still_dirty || abort.is_err() {
                return Err(WorkspaceError::DirtyWorktree {
                    dir: self.repo_path.clone(),
                    detail: merge.combined_output(),
                });
            }
            return Err(WorkspaceError::MergeConflict {
                from: from.to_string(),
                into: into.to_string(),
                detail: merge.combined_output(),
            });
        }
        if self.is_clean()? {
            return Ok(());
        }
        let (name, email) = self.head_author()?;
        let result = self
            .exec_env(
                &["commit", "--no-edit"],
                &[
                    ("GIT_EDITOR", "true"),
                    ("GIT_AUTHOR_NAME", &name),
                    ("GIT_AUTHOR_EMAIL", &email),
                ],
            )
            .map_err(|e| WorkspaceError::Command {
                op: "commit".into(),
                detail: e.to_string(),
            })?;
        if !result.success() {
            if !self.is_clean()? {
                return Err(WorkspaceError::DirtyWorktree {
                    dir: self.repo_path.clone(),
                    detail: result.combined_output(),
                });
            }
            return Err(WorkspaceError::Command {
                op: "commit".into(),
                detail: result.combined_output(),
            });
        }
        Ok(())
    }

    pub fn push(&self, refspec: &str) -> Result<(), WorkspaceError> {
        let result = self
            .exec(&["push", "--force", "origin", refspec])
            .map_err(|e| WorkspaceError::Command {
                op: "push".into(),
                detail: e.to_string(),
            })?;
        if !result.success() {
            return Err(WorkspaceError::PushRejected {
                refspec: refspec.to_string(),
                detail: result.combined_output(),
            });
        }
        Ok(())
    }

    pub fn delete_remote(&self, branch: &str) -> Result<(), WorkspaceError> {
        let result = self
            .exec(&["push", "origin", "--delete", branch])
            .map_err(|e| WorkspaceError::Command {
                op: "delete_remote".into(),
                detail: e.to_string(),
            })?;
        // A remote branch that's already gone isn't a driver error.
        if !result.success() && !result.stderr.contains("remote ref does not exist") {
            return Err(WorkspaceError::Command {
                op: "delete_remote".into(),
                detail: result.combined_output(),
            });
        }
        Ok(())
    }

    /// `reset --hard; clean -fd` on the current branch, switch to `master`,
    /// `clean -fd` again, then delete every local branch but `master`.
    /// Idempotent; run before and after each verification.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        self.exec(&["reset", "--hard"])
            .map_err(|e| WorkspaceError::Command {
                op: "reset --hard".into(),
                detail: e.to_string(),
            })?;
        self.exec(&["clean", "-fd"])
            .map_err(|e| WorkspaceError::Command {
                op: "clean -fd".into(),
                detail: e.to_string(),
            })?;
        self.checkout("master")?;
        self.exec(&["clean", "-fd"])
            .map_err(|e| WorkspaceError::Command {
                op: "clean -fd".into(),
                detail: e.to_string(),
            })?;

        let branches = self
            .exec(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])
            .map_err(|e| WorkspaceError::Command {
                op: "for-each-ref".into(),
                detail: e.to_string(),
            })?;
        for branch in branches.stdout.lines().map(str::trim) {
            if branch.is_empty() || branch == "master" {
                continue;
            }
            self.exec(&["branch", "-D", branch])
                .map_err(|e| WorkspaceError::Command {
                    op: "branch -D".into(),
                    detail: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String, WorkspaceError> {
        let result = self
            .exec(&["rev-parse", refname])
            .map_err(|e| WorkspaceError::Command {
                op: "rev-parse".into(),
                detail: e.to_string(),
            })?;
        self.require("rev-parse", result).map(|r| r.stdout.trim().to_string())
    }
}

/// Staging branch name for one coalesced-merge attempt.
pub fn merge_queue_branch(merge_rid: i64) -> String {
    format!("mergequeue_{merge_rid:06}")
}

/// Fold `feature_branches` (each targeting `base_branch`) into a single
/// staging branch and push it, per the coalesced-merge algorithm: check out
/// `base_branch`, branch `M` at HEAD, then for each feature branch in turn
/// fast-forward it across `M`'s progress so far and merge it back into `M`.
/// Returns the staging branch name. On any merge failure the caller is
/// responsible for deleting `M` on origin (if already pushed) via
/// `Git::delete_remote`.
pub fn coalesce_merge(
    git: &Git,
    base_branch: &str,
    merge_rid: i64,
    feature_branches: &[String],
) -> Result<String, WorkspaceError> {
    let staging = merge_queue_branch(merge_rid);
    git.checkout(base_branch)?;
    git.create_branch(&staging, base_branch)?;

    for feature_branch in feature_branches {
        git.checkout_and_merge(feature_branch, &staging)?;
        git.checkout_and_merge(&staging, feature_branch)?;
    }

    git.push(&format!("{staging}:{staging}"))?;
    Ok(staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &std::path::Path) -> Git {
        let git = Git::new(dir.to_string_lossy().into_owned());
        Command::new("git")
            .args(["init", "-q", "-b", "master"])
            .arg(dir)
            .status()
            .unwrap();
        git.exec(&["config", "user.name", "Test"]).unwrap();
        git.exec(&["config", "user.email", "test@example.com"]).unwrap();
        git
    }

    fn commit_file(git: &Git, dir: &std::path::Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
        git.exec(&["add", "-A"]).unwrap();
        git.exec(&["commit", "-m", &format!("add {name}")]).unwrap();
    }

    #[test]
    fn checkout_and_merge_is_noop_on_clean_merge() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());
        commit_file(&git, dir.path(), "base.txt", "base\n");
        git.create_branch("feature", "master").unwrap();
        commit_file(&git, dir.path(), "feature.txt", "feature\n");
        git.checkout("master").unwrap();

        git.checkout_and_merge("master", "feature").unwrap();
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn cleanup_removes_non_master_branches() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());
        commit_file(&git, dir.path(), "base.txt", "base\n");
        git.create_branch("scratch", "master").unwrap();
        git.cleanup().unwrap();

        let branches = git
            .exec(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])
            .unwrap();
        assert_eq!(branches.stdout.trim(), "master");
    }

    #[test]
    fn merge_queue_branch_name_is_zero_padded() {
        assert_eq!(merge_queue_branch(7), "mergequeue_000007");
    }
}
