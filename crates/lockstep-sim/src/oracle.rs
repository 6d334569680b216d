//! Invariant oracle checked after every simulated step.
//!
//! A committed step must add exactly one revision and leave a clean tree. A
//! failed step must leave the tree byte-identical and `HEAD` unmoved. After
//! either, the store must satisfy the epic aggregate invariant and agree with
//! the simulator's shadow model.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use lockstep_core::StateManager;
use lockstep_core::model::StoryState;
use lockstep_core::service::{EpicFilter, MAX_PAGE_SIZE, StoryFilter};
use serde::Serialize;

/// Repository state captured before a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub head: String,
    pub commits: u64,
    /// blake3 over every file outside `.git`, sidecars excluded.
    pub digest: String,
}

/// Outcome of the invariant checks over a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// The call succeeded when the model predicted failure, or vice versa.
    Outcome { step: u32, expected_ok: bool, actual_ok: bool },
    /// A committed step did not add exactly one revision.
    RevisionCount { step: u32, before: u64, after: u64 },
    /// A failed step moved `HEAD` or changed bytes on disk.
    NotRolledBack { step: u32, detail: String },
    DirtyTree { step: u32, paths: Vec<String> },
    Aggregate { step: u32, epic_num: i64, detail: String },
    /// Store and shadow model disagree on a story.
    ModelDivergence { step: u32, story_id: String, expected: Option<String>, actual: Option<String> },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outcome { step, expected_ok, actual_ok } => {
                write!(f, "step {step}: expected ok={expected_ok}, got ok={actual_ok}")
            }
            Self::RevisionCount { step, before, after } => {
                write!(f, "step {step}: revisions {before} -> {after}")
            }
            Self::NotRolledBack { step, detail } => write!(f, "step {step}: not rolled back: {detail}"),
            Self::DirtyTree { step, paths } => write!(f, "step {step}: dirty tree {paths:?}"),
            Self::Aggregate { step, epic_num, detail } => {
                write!(f, "step {step}: epic {epic_num} aggregate: {detail}")
            }
            Self::ModelDivergence { step, story_id, expected, actual } => write!(
                f,
                "step {step}: story {story_id} expected {expected:?}, store has {actual:?}"
            ),
        }
    }
}

/// Shadow model of story states, updated only by committed steps.
pub type Model = BTreeMap<String, StoryState>;

/// Capture `HEAD`, revision count and the tree digest.
///
/// # Errors
///
/// Returns an error if git or the file system cannot be read.
pub fn snapshot(manager: &StateManager) -> Result<Snapshot> {
    let repo = manager.repo();
    Ok(Snapshot {
        head: repo.head_revision(false)?,
        commits: repo.commit_count()?,
        digest: tree_digest(repo.root())?,
    })
}

/// Deterministic digest of the working tree.
///
/// # Errors
///
/// Returns an error if a directory or file cannot be read.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect(root, root, &mut files)?;
    files.sort();
    let mut hasher = blake3::Hasher::new();
    for rel in files {
        let bytes = fs::read(root.join(&rel)).with_context(|| format!("read {rel}"))?;
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == ".git" || ["-wal", "-shm", "-journal"].iter().any(|s| name.ends_with(s)) {
            continue;
        }
        if path.is_dir() {
            collect(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Check one step.
///
/// # Errors
///
/// Returns an error only if the oracle itself cannot observe the repository.
pub fn check_step(
    step: u32,
    manager: &StateManager,
    before: &Snapshot,
    expected_ok: bool,
    outcome: Result<&str, ()>,
    model: &Model,
) -> Result<Vec<InvariantViolation>> {
    let mut violations = Vec::new();
    let after = snapshot(manager)?;

    if expected_ok != outcome.is_ok() {
        violations.push(InvariantViolation::Outcome {
            step,
            expected_ok,
            actual_ok: outcome.is_ok(),
        });
    }
    match outcome {
        Ok(revision) => {
            if after.commits != before.commits + 1 {
                violations.push(InvariantViolation::RevisionCount {
                    step,
                    before: before.commits,
                    after: after.commits,
                });
            }
            if after.head != revision {
                violations.push(InvariantViolation::NotRolledBack {
                    step,
                    detail: format!("HEAD {} is not the reported revision {revision}", after.head),
                });
            }
        }
        Err(()) => {
            if after.head != before.head || after.commits != before.commits {
                violations.push(InvariantViolation::NotRolledBack {
                    step,
                    detail: format!("HEAD moved {} -> {}", before.head, after.head),
                });
            }
            if after.digest != before.digest {
                violations.push(InvariantViolation::NotRolledBack {
                    step,
                    detail: "tree bytes changed".to_string(),
                });
            }
        }
    }

    let dirty = manager.repo().dirty_paths()?;
    if !dirty.is_empty() {
        violations.push(InvariantViolation::DirtyTree { step, paths: dirty });
    }

    check_store(step, manager, model, &mut violations)?;
    Ok(violations)
}

fn check_store(
    step: u32,
    manager: &StateManager,
    model: &Model,
    violations: &mut Vec<InvariantViolation>,
) -> Result<()> {
    let coordinator = manager.coordinator()?;
    let epics = coordinator.epics().list(&EpicFilter {
        limit: Some(MAX_PAGE_SIZE),
        ..EpicFilter::default()
    })?;
    for epic in &epics {
        let fresh = coordinator.compute_aggregate(epic.epic_num)?;
        if !fresh.matches(epic) {
            violations.push(InvariantViolation::Aggregate {
                step,
                epic_num: epic.epic_num,
                detail: format!("stored {epic:?} differs from recompute {fresh:?}"),
            });
        }
        if epic.completed_stories + epic.in_progress_stories > epic.total_stories {
            violations.push(InvariantViolation::Aggregate {
                step,
                epic_num: epic.epic_num,
                detail: "completed + in_progress exceeds total".to_string(),
            });
        }
    }

    let stories: BTreeMap<String, StoryState> = coordinator
        .stories()
        .list(&StoryFilter {
            limit: Some(MAX_PAGE_SIZE),
            ..StoryFilter::default()
        })?
        .into_iter()
        .map(|story| (story.story_id, story.state))
        .collect();
    for id in model.keys().chain(stories.keys()) {
        let expected = model.get(id);
        let actual = stories.get(id);
        if expected != actual {
            violations.push(InvariantViolation::ModelDivergence {
                step,
                story_id: id.clone(),
                expected: expected.map(ToString::to_string),
                actual: actual.map(ToString::to_string),
            });
        }
    }
    violations.dedup();
    Ok(())
}
