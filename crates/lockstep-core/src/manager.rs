//! Caller-facing entry point.
//!
//! [`StateManager`] wraps every coordinator mutation in one
//! [`TransactionManager`] unit, so each call yields exactly one revision
//! carrying both the artifact change and the store change. Input validation
//! runs before the unit starts; failures there never touch the tree.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Instant;

use tracing::debug;

use crate::artifact::{self, ArtifactLayout, Document, KEY_STATE};
use crate::config::{self, ProjectConfig};
use crate::consistency::{ConsistencyChecker, ConsistencyReport, RepairMode, RepairOutcome, Repairer};
use crate::coordinator::{ContextReader, EpicContext, StateCoordinator, StoryUpdate};
use crate::error::{Result, StateError};
use crate::migrate::{MigrationManager, MigrationReport};
use crate::model::{
    ActionItem, ActionItemState, CeremonySummary, Epic, LearningEntry, NewActionItem, NewCeremony,
    NewLearning, Story, StoryState,
};
use crate::service::{self, NewStory};
use crate::tx::{Committed, Tx, TransactionManager};
use crate::vcs::GitRepo;

/// State layer for one working tree.
pub struct StateManager {
    tm: TransactionManager,
    layout: ArtifactLayout,
}

impl StateManager {
    /// Open `root` with its project config and bootstrap the store.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyExists`] if the store exists, or the errors of
    /// [`TransactionManager::bootstrap`].
    pub fn init(root: &Path) -> Result<Self> {
        let config = config::load_project_config(root)?;
        Self::init_with(root, config)
    }

    /// [`StateManager::init`] with an explicit config.
    ///
    /// # Errors
    ///
    /// See [`StateManager::init`].
    pub fn init_with(root: &Path, config: ProjectConfig) -> Result<Self> {
        let mut manager = Self::open_with(root, config)?;
        manager
            .tm
            .bootstrap("Initialize lockstep state store", None)?;
        Ok(manager)
    }

    /// Attach to `root`. An absent store is allowed so that
    /// [`StateManager::migrate`] can create it; every other write then fails
    /// with [`StateError::NotInitialized`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed, `root` is not a git
    /// working tree, or an existing store fails to open.
    pub fn open(root: &Path) -> Result<Self> {
        let config = config::load_project_config(root)?;
        Self::open_with(root, config)
    }

    /// [`StateManager::open`] with an explicit config.
    ///
    /// # Errors
    ///
    /// See [`StateManager::open`].
    pub fn open_with(root: &Path, config: ProjectConfig) -> Result<Self> {
        let repo = GitRepo::open(root, &config.git)?;
        let layout = ArtifactLayout::new(config.layout.clone());
        let tm = TransactionManager::open(repo, config)?;
        Ok(Self { tm, layout })
    }

    #[must_use]
    pub const fn repo(&self) -> &GitRepo {
        self.tm.repo()
    }

    #[must_use]
    pub const fn config(&self) -> &ProjectConfig {
        self.tm.config()
    }

    #[must_use]
    pub const fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.tm.is_initialized()
    }

    /// Deadline for subsequent writes; `None` clears it.
    pub const fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.tm.set_deadline(deadline);
    }

    /// Coordinator over the writer connection, for reads between units.
    ///
    /// # Errors
    ///
    /// [`StateError::NotInitialized`] before bootstrap.
    pub fn coordinator(&self) -> Result<StateCoordinator<'_>> {
        self.tm.coordinator()
    }

    /// A reader that can be moved to other threads and queried while a
    /// write is in flight.
    #[must_use]
    pub fn context_reader(&self) -> ContextReader {
        let config = self.tm.config();
        ContextReader::new(
            &self.tm.store_path(),
            config.store.busy_timeout(),
            config.context.clone(),
        )
    }

    /// Low-level access for callers composing their own units.
    pub const fn transactions(&mut self) -> &mut TransactionManager {
        &mut self.tm
    }

    // Epics

    /// Write the epic artifact and insert its row.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a blank title or a non-positive number
    /// (before any write), [`StateError::TransactionFailed`] otherwise.
    pub fn create_epic(&mut self, epic_num: i64, title: &str, body: &str) -> Result<Committed<Epic>> {
        if epic_num <= 0 {
            return Err(StateError::Validation(format!(
                "epic number must be positive, got {epic_num}"
            )));
        }
        service::require_text("epic title", title)?;
        let path = self.layout.epic_path(epic_num);
        let content = artifact::epic_document(epic_num, title, body)?;
        self.tm.run(&format!("Create epic {epic_num}: {}", title.trim()), |tx| {
            let epic = tx.coordinator().create_epic(epic_num, title, Some(&path))?;
            tx.write_file(&path, &content)?;
            Ok(epic)
        })
    }

    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping
    /// [`StateError::InvalidTransition`] unless the epic is complete.
    pub fn archive_epic(&mut self, epic_num: i64) -> Result<Committed<Epic>> {
        self.tm.run(&format!("Archive epic {epic_num}"), |tx| {
            tx.coordinator().archive_epic(epic_num)
        })
    }

    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping the service error.
    pub fn update_epic_plan(
        &mut self,
        epic_num: i64,
        target_date: Option<NaiveDate>,
        extension: Option<&Map<String, Value>>,
    ) -> Result<Committed<Epic>> {
        self.tm.run(&format!("Update plan of epic {epic_num}"), |tx| {
            tx.coordinator()
                .update_epic_plan(epic_num, target_date, extension)
        })
    }

    // Stories

    /// Write the story artifact, insert its row and recompute the epic.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a malformed id, blank title or negative
    /// estimate (before any write); [`StateError::TransactionFailed`]
    /// wrapping `EpicNotFound`/`AlreadyExists` and protocol failures.
    pub fn create_story(
        &mut self,
        story_id: &str,
        epic_num: i64,
        title: &str,
        estimate: Option<f64>,
        body: &str,
    ) -> Result<Committed<StoryUpdate>> {
        service::story::validate_story_id(story_id, epic_num)?;
        service::require_text("story title", title)?;
        service::require_non_negative("estimate", estimate)?;

        let path = self.layout.story_path(epic_num, story_id);
        let content = artifact::story_document(story_id, epic_num, title, StoryState::Todo, body)?;
        let new = NewStory {
            story_id: story_id.to_string(),
            epic_num,
            title: title.to_string(),
            estimate,
            assignee: None,
        };
        self.tm
            .run(&format!("Create story {story_id}: {}", title.trim()), |tx| {
                let update = tx.coordinator().create_story(&new, Some(&path))?;
                tx.write_file(&path, &content)?;
                Ok(update)
            })
    }

    /// Apply one lifecycle edge and rewrite the artifact's `state`.
    ///
    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping
    /// [`StateError::InvalidTransition`] for an illegal edge.
    pub fn transition_story(
        &mut self,
        story_id: &str,
        target: StoryState,
    ) -> Result<Committed<StoryUpdate>> {
        self.tm
            .run(&format!("Move story {story_id} to {target}"), |tx| {
                let update = tx.coordinator().transition_story(story_id, target)?;
                sync_story_state(tx, &update.story)?;
                Ok(update)
            })
    }

    /// Finish a story, recording its actual effort.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a negative effort (before any write);
    /// [`StateError::TransactionFailed`] wrapping
    /// [`StateError::InvalidTransition`] from `todo` or `done`.
    pub fn complete_story(
        &mut self,
        story_id: &str,
        actual_effort: f64,
    ) -> Result<Committed<StoryUpdate>> {
        service::require_non_negative("actual effort", Some(actual_effort))?;
        self.tm.run(&format!("Complete story {story_id}"), |tx| {
            let update = tx.coordinator().complete_story(story_id, actual_effort)?;
            sync_story_state(tx, &update.story)?;
            Ok(update)
        })
    }

    // Action items, ceremonies, learnings

    /// # Errors
    ///
    /// [`StateError::Validation`] for a blank summary (before any write);
    /// [`StateError::TransactionFailed`] otherwise.
    pub fn record_action_item(&mut self, new: &NewActionItem) -> Result<Committed<ActionItem>> {
        service::require_text("action item summary", &new.summary)?;
        self.tm
            .run(&format!("Record action item: {}", new.summary.trim()), |tx| {
                tx.coordinator().record_action_item(new)
            })
    }

    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping
    /// [`StateError::InvalidTransition`] for an illegal edge.
    pub fn transition_action_item(
        &mut self,
        id: i64,
        target: ActionItemState,
    ) -> Result<Committed<ActionItem>> {
        self.tm
            .run(&format!("Move action item {id} to {target}"), |tx| {
                tx.coordinator().transition_action_item(id, target)
            })
    }

    /// Record a ceremony summary and, when given, write its transcript under
    /// the ceremony path convention.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a negative action item count or blank
    /// participant (before any write); [`StateError::TransactionFailed`]
    /// otherwise.
    pub fn record_ceremony(
        &mut self,
        new: &NewCeremony,
        transcript: Option<&str>,
    ) -> Result<Committed<CeremonySummary>> {
        if new.action_items_created < 0 {
            return Err(StateError::Validation(
                "action_items_created must not be negative".to_string(),
            ));
        }
        for participant in &new.participants {
            service::require_text("participant", participant)?;
        }
        let path = transcript.map(|_| self.free_transcript_path(new));
        let message = format!("Record {} of {}", new.kind, new.held_on);
        self.tm.run(&message, |tx| {
            if let (Some(path), Some(text)) = (&path, transcript) {
                tx.write_file(path, text)?;
            }
            tx.coordinator().record_ceremony(new, path.as_deref())
        })
    }

    /// # Errors
    ///
    /// [`StateError::Validation`] for a blank topic or summary (before any
    /// write); [`StateError::TransactionFailed`] otherwise.
    pub fn index_learning(&mut self, new: &NewLearning) -> Result<Committed<LearningEntry>> {
        service::require_text("learning topic", &new.topic)?;
        service::require_text("learning summary", &new.summary)?;
        self.tm
            .run(&format!("Index learning: {}", new.topic.trim()), |tx| {
                tx.coordinator().index_learning(new)
            })
    }

    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping the service error.
    pub fn supersede_learning(&mut self, old_id: i64, new_id: i64) -> Result<Committed<LearningEntry>> {
        self.tm
            .run(&format!("Supersede learning {old_id} with {new_id}"), |tx| {
                tx.coordinator().supersede_learning(old_id, new_id)
            })
    }

    /// # Errors
    ///
    /// [`StateError::TransactionFailed`] wrapping the service error.
    pub fn obsolete_learning(&mut self, id: i64) -> Result<Committed<LearningEntry>> {
        self.tm.run(&format!("Mark learning {id} obsolete"), |tx| {
            tx.coordinator().obsolete_learning(id)
        })
    }

    // Reads

    /// Bounded context for one epic, read from a fresh snapshot.
    ///
    /// # Errors
    ///
    /// [`StateError::NotInitialized`] or [`StateError::EpicNotFound`].
    pub fn get_epic_context(&self, epic_num: i64) -> Result<EpicContext> {
        self.context_reader().get_epic_context(epic_num)
    }

    /// # Errors
    ///
    /// [`StateError::NotInitialized`] before bootstrap.
    pub fn story(&self, story_id: &str) -> Result<Option<Story>> {
        self.coordinator()?.stories().get(story_id)
    }

    /// # Errors
    ///
    /// [`StateError::NotInitialized`] before bootstrap.
    pub fn epic(&self, epic_num: i64) -> Result<Option<Epic>> {
        self.coordinator()?.epics().get(epic_num)
    }

    // Maintenance

    /// Compare the store against the tree. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if git or the store cannot be queried.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        ConsistencyChecker::new(self.tm.repo(), self.tm.coordinator()?, &self.layout).check()
    }

    /// Resolve the issues of `report` in one commit.
    ///
    /// # Errors
    ///
    /// See [`Repairer::repair`].
    pub fn repair(&mut self, report: &ConsistencyReport, mode: RepairMode<'_>) -> Result<RepairOutcome> {
        Repairer::new(self.layout.clone()).repair(&mut self.tm, report, mode)
    }

    /// Adopt an existing artifact tree. See [`MigrationManager::migrate`].
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::migrate`].
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        let migration = self.tm.config().migration.clone();
        MigrationManager::new(self.layout.clone(), migration).migrate(&mut self.tm)
    }

    fn free_transcript_path(&self, new: &NewCeremony) -> String {
        let root = self.tm.repo().root();
        let mut ordinal = 0;
        loop {
            let path = self
                .layout
                .transcript_path(new.epic_num, new.kind, new.held_on, ordinal);
            if !root.join(&path).exists() {
                return path;
            }
            ordinal += 1;
        }
    }
}

/// Rewrite the `state` key of the story's artifact, keeping everything else.
fn sync_story_state(tx: &mut Tx<'_>, story: &Story) -> Result<()> {
    let Some(path) = &story.artifact_path else {
        return Ok(());
    };
    let Some(text) = tx.read_file(path)? else {
        debug!(story_id = %story.story_id, path, "story artifact missing; state not synced");
        return Ok(());
    };
    let mut doc = Document::parse(&text)?;
    doc.set_str(KEY_STATE, story.state.as_str());
    tx.write_file(path, &doc.render()?)
}
