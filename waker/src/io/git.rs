//! Thin wrapper around the `git` binary used by the code-host port.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Executes git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to propose changes)"));
        }
        Ok(name)
    }

    /// Fail unless the worktree has no staged, unstaged or untracked changes.
    pub fn ensure_clean(&self) -> Result<()> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let dirty: Vec<&str> = out.lines().filter(|l| !l.trim().is_empty()).collect();
        if dirty.is_empty() {
            return Ok(());
        }
        warn!(dirty = dirty.len(), "worktree not clean");
        Err(anyhow!(
            "working tree not clean:\n{}",
            dirty.join("\n")
        ))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Discard staged and unstaged changes to tracked files.
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet"])?;
        Ok(())
    }

    /// Apply a unified diff to the worktree and index. All-or-nothing.
    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    pub fn apply_to_index(&self, diff: &str) -> Result<()> {
        let mut child = Command::new("git")
            .args(["apply", "--index", "-"])
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git apply")?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            stdin.write_all(diff.as_bytes()).context("write diff")?;
        }
        let output = child.wait_with_output().context("wait git apply")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git apply failed: {}", stderr.trim()));
        }
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit what is staged. Returns `Ok(false)` when nothing is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("nothing staged, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn reports_current_branch_and_cleanliness() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert_eq!(git.current_branch().expect("branch"), "main");
        git.ensure_clean().expect("clean");

        std::fs::write(repo.path().join("scratch.txt"), "x").expect("write");
        let err = git.ensure_clean().expect_err("dirty");
        assert!(err.to_string().contains("scratch.txt"));
    }

    #[test]
    fn applies_diff_to_index() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.apply_to_index(crate::test_support::README_DIFF)
            .expect("apply");
        assert!(git.has_staged_changes().expect("staged"));
        assert!(git.commit_staged("docs: extend readme").expect("commit"));
        assert!(!git.commit_staged("nothing").expect("noop"));
    }

    #[test]
    fn rejects_diff_that_does_not_apply() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let err = git.apply_to_index("not a diff").expect_err("bad diff");
        assert!(err.to_string().contains("git apply failed"));
    }
}
