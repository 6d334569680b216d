//! One-time adoption of an existing artifact tree.
//!
//! Migration runs on a dedicated branch in four phases, each committed on
//! its own: create the store, backfill epics, backfill stories, validate.
//! Success merges the branch with a merge commit; any failure returns the
//! tree to the original branch and deletes the migration branch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use tracing::{info, warn};

use crate::artifact::{ArtifactKind, ArtifactLayout, Document};
use crate::config::MigrationConfig;
use crate::consistency::all_epics;
use crate::error::{Result, StateError};
use crate::model::StoryState;
use crate::service::NewStory;
use crate::tx::TransactionManager;
use crate::vcs::{RevisionInfo, VcsError};

/// Number of the final phase; a store at this phase is fully migrated.
pub const FINAL_PHASE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Schema,
    Epics,
    Stories,
    Validation,
}

impl MigrationPhase {
    pub const ALL: [Self; 4] = [Self::Schema, Self::Epics, Self::Stories, Self::Validation];

    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::Schema => 1,
            Self::Epics => 2,
            Self::Stories => 3,
            Self::Validation => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Epics => "epics",
            Self::Stories => "stories",
            Self::Validation => "validation",
        }
    }
}

/// What a story's inferred state was based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "evidence", content = "detail", rename_all = "snake_case")]
pub enum Evidence {
    /// Front matter already carried a valid state.
    FrontMatter,
    CommitMessage(String),
    /// Days since the last commit touching the file.
    Age(i64),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredState {
    pub story_id: String,
    pub state: StoryState,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub branch: String,
    /// `HEAD` of the original branch before migration started.
    pub base_revision: String,
    pub phase_revisions: Vec<(MigrationPhase, String)>,
    pub merge_revision: String,
    pub epics: usize,
    pub stories: usize,
    pub inferred: Vec<InferredState>,
}

/// Lifecycle state for a story artifact without recorded metadata.
///
/// Best effort: a completion word (`complete`, `completed`, `completes`,
/// `done`) in the last commit subject means done. Words match whole, so
/// "Completing login" does not count. Progress words mean in progress, an
/// untouched file older than `stale_after_days` means done, anything else is
/// todo.
#[must_use]
pub fn infer_story_state(
    last: Option<&RevisionInfo>,
    now: DateTime<Utc>,
    stale_after_days: u32,
) -> (StoryState, Evidence) {
    let Some(last) = last else {
        return (StoryState::Todo, Evidence::Default);
    };
    let subject = last.message.to_lowercase();
    let words: Vec<&str> = subject
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if words
        .iter()
        .any(|w| matches!(*w, "complete" | "completed" | "completes" | "done"))
    {
        return (StoryState::Done, Evidence::CommitMessage(last.message.clone()));
    }
    if subject.contains("in progress") || subject.contains("in-progress") || words.contains(&"wip") {
        return (
            StoryState::InProgress,
            Evidence::CommitMessage(last.message.clone()),
        );
    }
    let age_days = (now - last.timestamp).num_days();
    if age_days >= i64::from(stale_after_days) {
        return (StoryState::Done, Evidence::Age(age_days));
    }
    (StoryState::Todo, Evidence::Default)
}

pub struct MigrationManager {
    layout: ArtifactLayout,
    config: MigrationConfig,
}

impl MigrationManager {
    #[must_use]
    pub const fn new(layout: ArtifactLayout, config: MigrationConfig) -> Self {
        Self { layout, config }
    }

    /// Migrate the tree behind `tm` and merge the result into the current
    /// branch.
    ///
    /// # Errors
    ///
    /// Precondition failures ([`StateError::DirtyWorkingTree`],
    /// [`StateError::AlreadyExists`] for an initialized store,
    /// [`StateError::Validation`] for a malformed tree) are returned before
    /// any branch is created. A failing phase returns
    /// [`StateError::MigrationFailed`] after the tree was restored.
    pub fn migrate(&self, tm: &mut TransactionManager) -> Result<MigrationReport> {
        self.validate_structure(tm)?;
        let repo = tm.repo();
        let original = repo.current_branch()?;
        let base_revision = repo.head_revision(false)?;
        let branch = format!(
            "{}-{}",
            self.config.branch_prefix,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        repo.create_branch(&branch, true)?;
        info!(%branch, base = %base_revision, "migration started");

        let mut report = MigrationReport {
            branch: branch.clone(),
            base_revision: base_revision.clone(),
            phase_revisions: Vec::new(),
            merge_revision: String::new(),
            epics: 0,
            stories: 0,
            inferred: Vec::new(),
        };
        for phase in MigrationPhase::ALL {
            if let Err(cause) = self.run_phase(tm, phase, &mut report) {
                warn!(phase = phase.as_str(), %cause, "migration phase failed; abandoning branch");
                if let Err(err) = abandon(tm, &original, &branch) {
                    warn!(%err, "restoring the original branch failed");
                }
                return Err(StateError::MigrationFailed {
                    phase: phase.as_str().to_string(),
                    restored_revision: base_revision,
                    source: Box::new(cause),
                });
            }
        }

        tm.release_store()?;
        tm.repo().checkout(&original)?;
        let message = format!("Merge migration branch {branch}");
        let merged = tm.repo().merge(&branch, true, Some(&message));
        let merge_revision = match merged {
            Ok(revision) => revision,
            Err(err) => {
                let cause = StateError::from(err);
                warn!(%cause, "migration merge failed; abandoning branch");
                if let Err(err) = tm.repo().hard_reset("HEAD") {
                    warn!(%err, "reset after failed merge failed");
                }
                if let Err(err) = abandon(tm, &original, &branch) {
                    warn!(%err, "restoring the original branch failed");
                }
                return Err(StateError::MigrationFailed {
                    phase: "merge".to_string(),
                    restored_revision: base_revision,
                    source: Box::new(cause),
                });
            }
        };
        tm.repo().delete_branch(&branch, false)?;
        tm.reload_store()?;

        info!(
            revision = %merge_revision,
            epics = report.epics,
            stories = report.stories,
            "migration merged"
        );
        report.merge_revision = merge_revision;
        Ok(report)
    }

    fn validate_structure(&self, tm: &TransactionManager) -> Result<()> {
        let repo = tm.repo();
        if tm.is_initialized() {
            return Err(StateError::already_exists(
                "state store",
                tm.store_path().display(),
            ));
        }
        let dirty = repo.dirty_paths()?;
        if !dirty.is_empty() {
            return Err(StateError::DirtyWorkingTree { paths: dirty });
        }
        if !repo.has_commits()? {
            return Err(VcsError::NoCommits.into());
        }
        let mut story_ids = std::collections::HashSet::new();
        for path in repo.tracked_files()? {
            if let Some(ArtifactKind::Story { story_id, .. }) = self.layout.classify(&path) {
                if !story_ids.insert(story_id.clone()) {
                    return Err(StateError::Validation(format!(
                        "story {story_id} has more than one artifact"
                    )));
                }
            }
        }
        Ok(())
    }

    fn run_phase(
        &self,
        tm: &mut TransactionManager,
        phase: MigrationPhase,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let message = format!(
            "Migration phase {}: {}",
            phase.number(),
            match phase {
                MigrationPhase::Schema => "create state store",
                MigrationPhase::Epics => "backfill epics",
                MigrationPhase::Stories => "backfill stories",
                MigrationPhase::Validation => "validate",
            }
        );
        let revision = match phase {
            MigrationPhase::Schema => tm.bootstrap(&message, Some(phase.number()))?,
            MigrationPhase::Epics => {
                let (count, revision) = self.backfill_epics(tm, &message)?;
                report.epics = count;
                revision
            }
            MigrationPhase::Stories => {
                let (inferred, revision) = self.backfill_stories(tm, &message)?;
                report.stories = inferred.len();
                report.inferred = inferred;
                revision
            }
            MigrationPhase::Validation => self.validate(tm, &message, &report.base_revision)?,
        };
        info!(phase = phase.as_str(), %revision, "migration phase committed");
        report.phase_revisions.push((phase, revision));
        Ok(())
    }

    fn backfill_epics(&self, tm: &mut TransactionManager, message: &str) -> Result<(usize, String)> {
        let files: Vec<(i64, String)> = tm
            .repo()
            .tracked_files()?
            .into_iter()
            .filter_map(|path| match self.layout.classify(&path) {
                Some(ArtifactKind::Epic { epic_num }) => Some((epic_num, path)),
                _ => None,
            })
            .collect();

        let committed = tm.run(message, |tx| {
            let coordinator = tx.coordinator();
            for (epic_num, path) in &files {
                let text = tx.read_file(path)?.unwrap_or_default();
                let title = Document::parse(&text)
                    .ok()
                    .and_then(|doc| doc.title())
                    .unwrap_or_else(|| format!("Epic {epic_num}"));
                coordinator.create_epic(*epic_num, &title, Some(path))?;
            }
            tx.store()
                .set_migration_phase(MigrationPhase::Epics.number(), None)?;
            Ok(files.len())
        })?;
        Ok((committed.value, committed.revision))
    }

    fn backfill_stories(
        &self,
        tm: &mut TransactionManager,
        message: &str,
    ) -> Result<(Vec<InferredState>, String)> {
        let repo = tm.repo();
        let now = Utc::now();
        let mut planned = Vec::new();
        for path in repo.tracked_files()? {
            if let Some(ArtifactKind::Story { epic_num, story_id }) = self.layout.classify(&path) {
                let last = repo.last_revision_touching(Path::new(&path))?;
                planned.push((epic_num, story_id, path, last));
            }
        }
        let stale_after_days = self.config.stale_after_days;

        let committed = tm.run(message, |tx| {
            let coordinator = tx.coordinator();
            let mut inferred = Vec::with_capacity(planned.len());
            let mut touched_epics = std::collections::BTreeSet::new();
            for (epic_num, story_id, path, last) in &planned {
                let text = tx.read_file(path)?.unwrap_or_default();
                let doc = Document::parse(&text).unwrap_or_default();
                let (state, evidence) = match doc.story_state() {
                    Some(state) => (state, Evidence::FrontMatter),
                    None => infer_story_state(last.as_ref(), now, stale_after_days),
                };
                info!(
                    story_id,
                    state = %state,
                    evidence = ?evidence,
                    "inferred story state (best effort)"
                );

                if !coordinator.epics().exists(*epic_num)? {
                    coordinator.create_epic(*epic_num, &format!("Epic {epic_num}"), None)?;
                }
                let title = doc.title().unwrap_or_else(|| story_id.clone());
                coordinator.stories().create(
                    &NewStory {
                        story_id: story_id.clone(),
                        epic_num: *epic_num,
                        title,
                        ..NewStory::default()
                    },
                    Some(path),
                )?;
                if state != StoryState::Todo {
                    coordinator.stories().force_state(story_id, state)?;
                }
                touched_epics.insert(*epic_num);
                inferred.push(InferredState {
                    story_id: story_id.clone(),
                    state,
                    evidence,
                });
            }
            for epic_num in touched_epics {
                coordinator.recompute_epic(epic_num)?;
            }
            tx.store()
                .set_migration_phase(MigrationPhase::Stories.number(), None)?;
            Ok(inferred)
        })?;
        Ok((committed.value, committed.revision))
    }

    fn validate(&self, tm: &mut TransactionManager, message: &str, base: &str) -> Result<String> {
        let mut epic_files = 0_usize;
        let mut story_files = 0_usize;
        for path in tm.repo().tracked_files()? {
            match self.layout.classify(&path) {
                Some(ArtifactKind::Epic { .. }) => epic_files += 1,
                Some(ArtifactKind::Story { .. }) => story_files += 1,
                _ => {}
            }
        }

        let committed = tm.run(message, |tx| {
            let coordinator = tx.coordinator();
            let epics = all_epics(&coordinator)?;
            let registered_epics = epics.iter().filter(|e| e.artifact_path.is_some()).count();
            if registered_epics != epic_files {
                return Err(StateError::Validation(format!(
                    "{registered_epics} epic rows for {epic_files} epic artifacts"
                )));
            }
            let mut stories = 0_usize;
            for epic in &epics {
                let aggregate = coordinator.compute_aggregate(epic.epic_num)?;
                if !aggregate.matches(epic)
                    || aggregate.completed_stories + aggregate.in_progress_stories
                        > aggregate.total_stories
                {
                    return Err(StateError::Validation(format!(
                        "epic {} aggregate does not match its stories",
                        epic.epic_num
                    )));
                }
                stories += usize::try_from(aggregate.total_stories).unwrap_or_default();
            }
            if stories != story_files {
                return Err(StateError::Validation(format!(
                    "{stories} story rows for {story_files} story artifacts"
                )));
            }
            tx.store()
                .set_migration_phase(MigrationPhase::Validation.number(), Some(base))?;
            Ok(())
        })?;
        Ok(committed.revision)
    }
}

fn abandon(tm: &mut TransactionManager, original: &str, branch: &str) -> Result<()> {
    tm.release_store()?;
    tm.repo().checkout(original)?;
    warn!(branch, "force-deleting migration branch");
    tm.repo().delete_branch(branch, true)?;
    tm.reload_store()
}

#[cfg(test)]
mod tests {
    use super::{Evidence, MigrationPhase, infer_story_state};
    use crate::model::StoryState;
    use crate::vcs::RevisionInfo;
    use chrono::{Duration, TimeZone, Utc};

    fn revision(message: &str, days_ago: i64) -> RevisionInfo {
        RevisionInfo {
            id: "0".repeat(40),
            message: message.to_string(),
            author: "dev".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().expect("date")
                - Duration::days(days_ago),
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().expect("date")
    }

    #[test]
    fn completion_words_mean_done() {
        for message in ["Login done", "Complete password reset", "story 5.1 completed"] {
            let (state, evidence) = infer_story_state(Some(&revision(message, 1)), now(), 30);
            assert_eq!(state, StoryState::Done, "{message}");
            assert!(matches!(evidence, Evidence::CommitMessage(_)));
        }
    }

    #[test]
    fn progress_words_mean_in_progress() {
        for message in ["WIP: login form", "login in progress", "login in-progress"] {
            let (state, _) = infer_story_state(Some(&revision(message, 1)), now(), 30);
            assert_eq!(state, StoryState::InProgress, "{message}");
        }
    }

    #[test]
    fn words_are_matched_whole() {
        for message in ["abandoned wiper idea", "Completing login"] {
            let (state, _) = infer_story_state(Some(&revision(message, 1)), now(), 30);
            assert_eq!(state, StoryState::Todo, "{message}");
        }
    }

    #[test]
    fn stale_files_are_done_and_fresh_ones_todo() {
        let (state, evidence) = infer_story_state(Some(&revision("add notes", 30)), now(), 30);
        assert_eq!(state, StoryState::Done);
        assert_eq!(evidence, Evidence::Age(30));

        let (state, evidence) = infer_story_state(Some(&revision("add notes", 29)), now(), 30);
        assert_eq!(state, StoryState::Todo);
        assert_eq!(evidence, Evidence::Default);

        assert_eq!(infer_story_state(None, now(), 30).0, StoryState::Todo);
    }

    #[test]
    fn phases_are_numbered_in_order() {
        let numbers: Vec<u32> = MigrationPhase::ALL.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }
}
