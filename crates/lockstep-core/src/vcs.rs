//! Git capability surface for one working tree.
//!
//! Every operation shells out to the git binary rooted at the working tree.
//! Non-zero exits surface as [`VcsError::Operation`] carrying git's stderr;
//! nothing here retries or interprets business state.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::GitConfig;

/// Errors raised by the version-control adapter.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("not a git working tree: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("repository has no commits yet")]
    NoCommits,

    /// `commit` was asked to record an empty change set.
    #[error("nothing staged to commit")]
    NothingToCommit,

    #[error("git {operation} failed: {stderr}")]
    Operation { operation: String, stderr: String },

    #[error("failed to spawn git {operation}: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("unexpected git {operation} output: {detail}")]
    UnexpectedOutput { operation: String, detail: String },
}

/// Metadata of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionInfo {
    pub id: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

/// Handle to a git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    binary: String,
    identity: Option<(String, String)>,
}

const FIELD_SEP: char = '\u{1f}';

impl GitRepo {
    /// Open the working tree at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError::NotARepository`] when `root` is not inside a git
    /// working tree.
    pub fn open(root: &Path, config: &GitConfig) -> Result<Self, VcsError> {
        let repo = Self::unchecked(root, config);
        match repo.run("rev-parse", &["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) if out.trim() == "true" => Ok(repo),
            Ok(_) | Err(VcsError::Operation { .. }) => {
                Err(VcsError::NotARepository(root.to_path_buf()))
            }
            Err(other) => Err(other),
        }
    }

    /// Initialize a new repository at `root` with `main` as the unborn branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or `git init` fails.
    pub fn init(root: &Path, config: &GitConfig) -> Result<Self, VcsError> {
        std::fs::create_dir_all(root).map_err(|source| VcsError::Spawn {
            operation: "init".to_string(),
            source,
        })?;
        let repo = Self::unchecked(root, config);
        repo.run("init", &["init", "-q"])?;
        repo.run("symbolic-ref", &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        Ok(repo)
    }

    fn unchecked(root: &Path, config: &GitConfig) -> Self {
        let identity = match (&config.author_name, &config.author_email) {
            (Some(name), Some(email)) => Some((name.clone(), email.clone())),
            _ => None,
        };
        Self {
            root: root.to_path_buf(),
            binary: config.binary.clone(),
            identity,
        }
    }

    /// Working tree root this handle operates on.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the repository's git directory.
    ///
    /// # Errors
    ///
    /// Returns an error if git cannot resolve the directory.
    pub fn git_dir(&self) -> Result<PathBuf, VcsError> {
        let out = self.run("rev-parse", &["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// True iff there are no staged, unstaged, or untracked changes.
    ///
    /// # Errors
    ///
    /// Returns an error if `git status` fails.
    pub fn is_clean(&self) -> Result<bool, VcsError> {
        Ok(self.dirty_paths()?.is_empty())
    }

    /// Paths reported by `git status`, including untracked files.
    ///
    /// # Errors
    ///
    /// Returns an error if `git status` fails.
    pub fn dirty_paths(&self) -> Result<Vec<String>, VcsError> {
        let out = self.run(
            "status",
            &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
        )?;

        let mut paths = Vec::new();
        let mut entries = out.split('\0').filter(|entry| !entry.is_empty());
        while let Some(entry) = entries.next() {
            if entry.len() < 4 {
                return Err(VcsError::UnexpectedOutput {
                    operation: "status".to_string(),
                    detail: entry.to_string(),
                });
            }
            let (code, path) = entry.split_at(3);
            paths.push(path.to_string());
            // Renames and copies carry the original path as a second entry.
            if code.starts_with('R') || code.starts_with('C') {
                let _ = entries.next();
            }
        }
        Ok(paths)
    }

    /// Stage every change in the working tree, including deletions.
    ///
    /// # Errors
    ///
    /// Returns an error if `git add` fails.
    pub fn stage_all(&self) -> Result<(), VcsError> {
        self.run("add", &["add", "-A"])?;
        Ok(())
    }

    /// Whether the index differs from `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns an error if `git diff` fails.
    pub fn has_staged_changes(&self) -> Result<bool, VcsError> {
        let output = self.raw("diff", &["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(operation_error("diff", &output)),
        }
    }

    /// Record the index as a new commit and return the full revision id.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError::NothingToCommit`] when nothing is staged and
    /// `allow_empty` is false, or an operation error when `git commit` fails
    /// (including a rejecting hook).
    pub fn commit(&self, message: &str, allow_empty: bool) -> Result<String, VcsError> {
        if !allow_empty && !self.has_staged_changes()? {
            return Err(VcsError::NothingToCommit);
        }

        let mut args = vec!["commit", "-q", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run_with_identity("commit", &args)?;
        let id = self.head_revision(false)?;
        debug!(revision = %id, message, "committed");
        Ok(id)
    }

    /// Discard all working-tree and index changes back to `target`, including
    /// untracked files and directories. Ignored files, such as the store's
    /// SQLite sidecars, are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if `git reset` or `git clean` fails.
    pub fn hard_reset(&self, target: &str) -> Result<(), VcsError> {
        warn!(root = %self.root.display(), target, "hard-resetting working tree");
        self.run("reset", &["reset", "--hard", "-q", target])?;
        self.run("clean", &["clean", "-f", "-d", "-q"])?;
        Ok(())
    }

    /// Empty the index without touching the working tree.
    ///
    /// The rollback path for a repository without commits, where there is no
    /// `HEAD` to reset to.
    ///
    /// # Errors
    ///
    /// Returns an error if `git read-tree` fails.
    pub fn clear_index(&self) -> Result<(), VcsError> {
        warn!(root = %self.root.display(), "clearing index");
        self.run("read-tree", &["read-tree", "--empty"])?;
        Ok(())
    }

    /// Whether `HEAD` points at a commit.
    ///
    /// # Errors
    ///
    /// Returns an error if `git rev-parse` fails for another reason.
    pub fn has_commits(&self) -> Result<bool, VcsError> {
        match self.head_revision(false) {
            Ok(_) => Ok(true),
            Err(VcsError::NoCommits) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Identifier of `HEAD`, abbreviated when `short` is set.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError::NoCommits`] on an empty repository.
    pub fn head_revision(&self, short: bool) -> Result<String, VcsError> {
        let verify = self.raw("rev-parse", &["rev-parse", "--verify", "-q", "HEAD"])?;
        if !verify.status.success() {
            if verify.stdout.is_empty() {
                return Err(VcsError::NoCommits);
            }
            return Err(operation_error("rev-parse", &verify));
        }

        let args: &[&str] = if short {
            &["rev-parse", "--short", "HEAD"]
        } else {
            &["rev-parse", "HEAD"]
        };
        Ok(self.run("rev-parse", args)?.trim().to_string())
    }

    /// Number of commits reachable from `HEAD` (0 on an empty repository).
    ///
    /// # Errors
    ///
    /// Returns an error if `git rev-list` fails.
    pub fn commit_count(&self) -> Result<u64, VcsError> {
        match self.head_revision(false) {
            Ok(_) => {}
            Err(VcsError::NoCommits) => return Ok(0),
            Err(err) => return Err(err),
        }
        let out = self.run("rev-list", &["rev-list", "--count", "HEAD"])?;
        out.trim()
            .parse()
            .map_err(|_| VcsError::UnexpectedOutput {
                operation: "rev-list".to_string(),
                detail: out.trim().to_string(),
            })
    }

    /// Name of the checked-out branch.
    ///
    /// # Errors
    ///
    /// Returns an error when `HEAD` is detached.
    pub fn current_branch(&self) -> Result<String, VcsError> {
        Ok(self
            .run("symbolic-ref", &["symbolic-ref", "--short", "-q", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Whether a local branch named `name` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `git show-ref` fails unexpectedly.
    pub fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        let reference = format!("refs/heads/{name}");
        let output = self.raw(
            "show-ref",
            &["show-ref", "--verify", "--quiet", reference.as_str()],
        )?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(operation_error("show-ref", &output)),
        }
    }

    /// Create branch `name` at `HEAD`, optionally checking it out.
    ///
    /// # Errors
    ///
    /// Returns an error if the branch exists or git fails.
    pub fn create_branch(&self, name: &str, checkout: bool) -> Result<(), VcsError> {
        if checkout {
            self.run("checkout", &["checkout", "-q", "-b", name])?;
        } else {
            self.run("branch", &["branch", name])?;
        }
        Ok(())
    }

    /// Check out an existing branch or revision.
    ///
    /// # Errors
    ///
    /// Returns an error if `git checkout` fails.
    pub fn checkout(&self, name: &str) -> Result<(), VcsError> {
        self.run("checkout", &["checkout", "-q", name])?;
        Ok(())
    }

    /// Delete a local branch; `force` discards unmerged commits.
    ///
    /// # Errors
    ///
    /// Returns an error if `git branch -d/-D` fails.
    pub fn delete_branch(&self, name: &str, force: bool) -> Result<(), VcsError> {
        if force {
            warn!(branch = name, "force-deleting branch");
        }
        let flag = if force { "-D" } else { "-d" };
        self.run("branch", &["branch", "-q", flag, name])?;
        Ok(())
    }

    /// Merge `name` into the current branch and return the new `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns an operation error on conflicts or other git failures.
    pub fn merge(
        &self,
        name: &str,
        no_fast_forward: bool,
        message: Option<&str>,
    ) -> Result<String, VcsError> {
        let mut args = vec!["merge", "-q", "--no-edit"];
        if no_fast_forward {
            args.push("--no-ff");
        }
        if let Some(message) = message {
            args.push("-m");
            args.push(message);
        }
        args.push(name);
        self.run_with_identity("merge", &args)?;
        self.head_revision(false)
    }

    /// Most recent commit that touched `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `git log` fails or its output cannot be parsed.
    pub fn last_revision_touching(&self, path: &Path) -> Result<Option<RevisionInfo>, VcsError> {
        match self.head_revision(false) {
            Ok(_) => {}
            Err(VcsError::NoCommits) => return Ok(None),
            Err(err) => return Err(err),
        }

        let path = path_arg(path);
        let out = self.run(
            "log",
            &[
                "log",
                "-1",
                "--format=%H%x1f%an%x1f%ct%x1f%s",
                "--",
                path.as_str(),
            ],
        )?;
        let line = out.trim_end();
        if line.is_empty() {
            return Ok(None);
        }
        parse_revision_line(line).map(Some)
    }

    /// Whether `path` is present in the index.
    ///
    /// # Errors
    ///
    /// Returns an error if `git ls-files` fails.
    pub fn is_tracked(&self, path: &Path) -> Result<bool, VcsError> {
        let path = path_arg(path);
        let out = self.run("ls-files", &["ls-files", "-z", "--", path.as_str()])?;
        Ok(!out.is_empty())
    }

    /// True iff `path` appears in history but is absent from the index.
    ///
    /// # Errors
    ///
    /// Returns an error if `git log` or `git ls-files` fails.
    pub fn was_deleted_in_history(&self, path: &Path) -> Result<bool, VcsError> {
        match self.head_revision(false) {
            Ok(_) => {}
            Err(VcsError::NoCommits) => return Ok(false),
            Err(err) => return Err(err),
        }

        let arg = path_arg(path);
        let out = self.run(
            "log",
            &["log", "--all", "-1", "--format=%H", "--", arg.as_str()],
        )?;
        if out.trim().is_empty() {
            return Ok(false);
        }
        Ok(!self.is_tracked(path)?)
    }

    /// Every path in the index, relative to the root.
    ///
    /// # Errors
    ///
    /// Returns an error if `git ls-files` fails.
    pub fn tracked_files(&self) -> Result<Vec<String>, VcsError> {
        let out = self.run("ls-files", &["ls-files", "-z"])?;
        Ok(out
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn raw(&self, operation: &str, args: &[&str]) -> Result<Output, VcsError> {
        debug!(operation, ?args, "git");
        self.command()
            .args(args)
            .output()
            .map_err(|source| VcsError::Spawn {
                operation: operation.to_string(),
                source,
            })
    }

    fn run(&self, operation: &str, args: &[&str]) -> Result<String, VcsError> {
        let output = self.raw(operation, args)?;
        if !output.status.success() {
            return Err(operation_error(operation, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_with_identity(&self, operation: &str, args: &[&str]) -> Result<String, VcsError> {
        let Some((name, email)) = &self.identity else {
            return self.run(operation, args);
        };
        let name = format!("user.name={name}");
        let email = format!("user.email={email}");
        let mut full = vec!["-c", name.as_str(), "-c", email.as_str()];
        full.extend_from_slice(args);
        self.run(operation, &full)
    }
}

fn operation_error(operation: &str, output: &Output) -> VcsError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stdout
        }
    } else {
        stderr
    };
    VcsError::Operation {
        operation: operation.to_string(),
        stderr,
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn parse_revision_line(line: &str) -> Result<RevisionInfo, VcsError> {
    let malformed = || VcsError::UnexpectedOutput {
        operation: "log".to_string(),
        detail: line.to_string(),
    };

    let mut fields = line.splitn(4, FIELD_SEP);
    let id = fields.next().ok_or_else(malformed)?;
    let author = fields.next().ok_or_else(malformed)?;
    let seconds: i64 = fields
        .next()
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or_else(malformed)?;
    let message = fields.next().unwrap_or_default();
    let timestamp = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(malformed)?;

    Ok(RevisionInfo {
        id: id.to_string(),
        message: message.to_string(),
        author: author.to_string(),
        timestamp,
    })
}
