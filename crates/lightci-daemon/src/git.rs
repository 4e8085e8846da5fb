//! Git operations for the Pipeline Runner.
//!
//! A step named *Source* is rewritten to a clone-and-checkout into an empty
//! workspace (Section 4.1 step 2).

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// `git clone <repository> . && git checkout <branch>`, executed in
/// `workspace_dir` (expected empty).
pub fn clone_and_checkout(repository_url: &str, branch: &str, workspace_dir: &Path) -> Result<String> {
    let clone_output = Command::new("git")
        .args(["clone", repository_url, "."])
        .current_dir(workspace_dir)
        .output()?;

    if !clone_output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git clone failed: {}",
            String::from_utf8_lossy(&clone_output.stderr)
        )));
    }

    let checkout_output = Command::new("git")
        .args(["checkout", branch])
        .current_dir(workspace_dir)
        .output()?;

    if !checkout_output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git checkout failed: {}",
            String::from_utf8_lossy(&checkout_output.stderr)
        )));
    }

    let mut combined = String::from_utf8_lossy(&clone_output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&clone_output.stderr));
    combined.push_str(&String::from_utf8_lossy(&checkout_output.stdout));
    combined.push_str(&String::from_utf8_lossy(&checkout_output.stderr));
    Ok(combined)
}

/// Resolve the commit hash checked out at `workspace_dir`, if any.
pub fn current_commit(workspace_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workspace_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_checkout_fails_cleanly_on_bad_repository() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = clone_and_checkout("/nonexistent/repo.git", "main", dir.path()).unwrap_err();
        assert!(matches!(err, GitError::CommandFailed(_)));
    }

    #[test]
    fn current_commit_returns_none_outside_a_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(current_commit(dir.path()).is_none());
    }
}
