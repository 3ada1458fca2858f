//! Git worktree isolation for parallel workers.
//!
//! Each worker gets its own worktree under `.wavefront/worktrees/<id>` on
//! a dedicated branch, so concurrent workers never touch the same working
//! copy. Where no git repository is available, `StagingArea` provides
//! in-memory isolation with the same visibility rule: nothing a worker
//! writes is observable until it is applied.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::errors::{EngineError, Result};

/// One worker's checkout.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Run a git subcommand, mapping failure to a structured error carrying
/// the stderr.
pub async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await?;
    if !output.status.success() {
        return Err(EngineError::Git {
            operation: args.first().copied().unwrap_or("git").to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub async fn is_git_repo(path: &Path) -> bool {
    git(path, &["rev-parse", "--is-inside-work-tree"])
        .await
        .map(|out| out.trim() == "true")
        .unwrap_or(false)
}

/// Creates and tears down per-worker worktrees.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    branch_prefix: String,
}

impl WorktreeManager {
    pub async fn new(repo_root: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Result<Self> {
        let repo_root = repo_root.into();
        if !is_git_repo(&repo_root).await {
            return Err(EngineError::NotARepository { path: repo_root });
        }
        exclude_runtime_dir(&repo_root).await?;
        Ok(Self {
            repo_root,
            branch_prefix: branch_prefix.into(),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.repo_root.join(".wavefront").join("worktrees")
    }

    pub fn branch_for(&self, worker_id: &str) -> String {
        format!("{}{worker_id}", self.branch_prefix)
    }

    /// True when `git status --porcelain` reports nothing.
    pub async fn is_clean(&self) -> Result<bool> {
        let out = git(&self.repo_root, &["status", "--porcelain"]).await?;
        Ok(out.trim().is_empty())
    }

    /// Create a worktree for the worker on its own branch. Reuses the
    /// branch if a previous run left it behind.
    pub async fn create(&self, worker_id: &str) -> Result<WorktreeHandle> {
        let path = self.worktrees_dir().join(worker_id);
        let branch = self.branch_for(worker_id);
        std::fs::create_dir_all(self.worktrees_dir())?;

        if path.exists() {
            return Err(EngineError::Git {
                operation: "worktree".to_string(),
                stderr: format!("worktree already exists at {}", path.display()),
            });
        }

        let path_str = path.to_string_lossy().into_owned();
        match git(
            &self.repo_root,
            &["worktree", "add", "-b", &branch, &path_str],
        )
        .await
        {
            Ok(_) => {}
            // Leftover branch from an earlier run: attach to it instead.
            Err(EngineError::Git { ref stderr, .. }) if stderr.contains("already exists") => {
                git(&self.repo_root, &["worktree", "add", &path_str, &branch]).await?;
            }
            Err(e) => return Err(e),
        }

        debug!(worker_id, branch = %branch, path = %path.display(), "worktree created");
        Ok(WorktreeHandle {
            id: worker_id.to_string(),
            path,
            branch,
        })
    }

    /// Paths changed inside the worktree, porcelain-relative.
    pub async fn modified_files(&self, handle: &WorktreeHandle) -> Result<Vec<String>> {
        let out = git(&handle.path, &["status", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    /// Stage and commit everything in the worktree. Returns false when
    /// there was nothing to commit.
    pub async fn commit_all(&self, handle: &WorktreeHandle, message: &str) -> Result<bool> {
        git(&handle.path, &["add", "-A"]).await?;
        let staged = git(&handle.path, &["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        git(&handle.path, &["commit", "-m", message]).await?;
        debug!(worker_id = %handle.id, "worktree committed");
        Ok(true)
    }

    /// Unix seconds of the first commit unique to the branch, used to
    /// order merges deterministically. `None` when the branch carries no
    /// commits of its own.
    pub async fn first_commit_time(&self, branch: &str, base: &str) -> Result<Option<DateTime<Utc>>> {
        let range = format!("{base}..{branch}");
        let out = git(
            &self.repo_root,
            &["log", "--reverse", "--format=%ct", &range],
        )
        .await?;
        let Some(first) = out.lines().next().map(str::trim).filter(|l| !l.is_empty()) else {
            return Ok(None);
        };
        let secs: i64 = first
            .parse()
            .map_err(|_| EngineError::internal(format!("unparseable commit time: {first}")))?;
        Ok(Utc.timestamp_opt(secs, 0).single())
    }

    pub async fn remove(&self, handle: &WorktreeHandle, force: bool) -> Result<()> {
        let path_str = handle.path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        if let Err(e) = git(&self.repo_root, &args).await {
            warn!(worker_id = %handle.id, error = %e, "worktree remove failed");
            return Err(e);
        }
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        git(&self.repo_root, &["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Drop administrative records for worktrees whose directories are
    /// gone, after crashes.
    pub async fn prune(&self) -> Result<()> {
        git(&self.repo_root, &["worktree", "prune"]).await?;
        Ok(())
    }
}

/// Runtime state (worktrees, heartbeats, locks, plan snapshots) lives
/// under `.wavefront/` inside the checkout; keep it out of `git status`
/// so it never trips the clean-tree check.
async fn exclude_runtime_dir(repo_root: &Path) -> Result<()> {
    let git_dir = git(repo_root, &["rev-parse", "--git-dir"]).await?;
    let exclude = repo_root
        .join(git_dir.trim())
        .join("info")
        .join("exclude");

    let mut contents = std::fs::read_to_string(&exclude).unwrap_or_default();
    if contents.lines().any(|line| line.trim() == ".wavefront/") {
        return Ok(());
    }
    if let Some(parent) = exclude.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(".wavefront/\n");
    std::fs::write(&exclude, contents)?;
    Ok(())
}

/// In-memory isolation buffer for environments without git. Writes land
/// in the map and become visible on disk only at `apply()`.
#[derive(Debug, Default)]
pub struct StagingArea {
    files: DashMap<PathBuf, String>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Staged content if present, otherwise whatever is on disk.
    pub fn read(&self, path: &Path) -> Result<String> {
        if let Some(staged) = self.files.get(path) {
            return Ok(staged.clone());
        }
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn is_staged(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Flush every staged file to disk, creating parent directories.
    pub fn apply(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut applied = Vec::new();
        for entry in self.files.iter() {
            let target = root.join(entry.key());
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, entry.value().as_bytes())?;
            applied.push(entry.key().clone());
        }
        applied.sort();
        Ok(applied)
    }

    pub fn discard(&self) {
        self.files.clear();
    }
}
