//! Facade over the five state services.
//!
//! The coordinator owns the cross-entity invariant: an epic's aggregate
//! fields are only ever written by [`StateCoordinator::recompute_epic`], and
//! every story mutation recomputes its epic in the same unit of work. It also
//! serves the bounded context read used by agents.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ContextConfig;
use crate::db;
use crate::error::{Result, StateError};
use crate::model::{
    ActionItem, ActionItemState, CeremonySummary, Epic, EpicState, LearningEntry, NewActionItem,
    NewCeremony, NewLearning, Story, StoryState,
};
use crate::service::{
    ActionItemService, CeremonyService, EpicAggregate, EpicService, LearningService, NewStory,
    StoryBreakdown, StoryService,
};

/// A story after a mutation together with its freshly recomputed epic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryUpdate {
    pub story: Story,
    pub epic: Epic,
}

/// Bounded snapshot of everything an agent needs about one epic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpicContext {
    pub epic: Epic,
    pub stories: StoryBreakdown,
    /// Open items, highest priority then newest first.
    pub action_items: Vec<ActionItem>,
    /// Active learnings, most relevant then newest first.
    pub learnings: Vec<LearningEntry>,
    /// Most recent ceremonies first.
    pub ceremonies: Vec<CeremonySummary>,
}

/// Compute the aggregate of an epic from its story counts.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_from(breakdown: &StoryBreakdown, current_story: Option<String>) -> EpicAggregate {
    let total = breakdown.total();
    let completed = breakdown.done;
    let in_progress = breakdown.in_progress;
    let progress_percent = if total > 0 {
        completed as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let state = if total > 0 && completed == total {
        EpicState::Complete
    } else if completed > 0 || in_progress > 0 {
        EpicState::Active
    } else {
        EpicState::Planning
    };

    EpicAggregate {
        total_stories: total,
        completed_stories: completed,
        in_progress_stories: in_progress,
        progress_percent,
        current_story,
        state,
    }
}

pub struct StateCoordinator<'c> {
    conn: &'c Connection,
    limits: ContextConfig,
}

impl<'c> StateCoordinator<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection, limits: ContextConfig) -> Self {
        Self { conn, limits }
    }

    #[must_use]
    pub const fn epics(&self) -> EpicService<'c> {
        EpicService::new(self.conn)
    }

    #[must_use]
    pub const fn stories(&self) -> StoryService<'c> {
        StoryService::new(self.conn)
    }

    #[must_use]
    pub const fn action_items(&self) -> ActionItemService<'c> {
        ActionItemService::new(self.conn)
    }

    #[must_use]
    pub const fn ceremonies(&self) -> CeremonyService<'c> {
        CeremonyService::new(self.conn)
    }

    #[must_use]
    pub const fn learnings(&self) -> LearningService<'c> {
        LearningService::new(self.conn)
    }

    /// # Errors
    ///
    /// See [`EpicService::create`].
    pub fn create_epic(&self, epic_num: i64, title: &str, artifact_path: Option<&str>) -> Result<Epic> {
        self.epics().create(epic_num, title, artifact_path)
    }

    /// # Errors
    ///
    /// See [`EpicService::update_plan`].
    pub fn update_epic_plan(
        &self,
        epic_num: i64,
        target_date: Option<chrono::NaiveDate>,
        extension: Option<&Map<String, Value>>,
    ) -> Result<Epic> {
        self.epics().update_plan(epic_num, target_date, extension)
    }

    /// # Errors
    ///
    /// See [`EpicService::archive`].
    pub fn archive_epic(&self, epic_num: i64) -> Result<Epic> {
        self.epics().archive(epic_num)
    }

    /// Create a story, then recompute its epic.
    ///
    /// # Errors
    ///
    /// [`StateError::EpicNotFound`] if the epic is absent, plus the
    /// validation errors of [`StoryService::create`].
    pub fn create_story(&self, new: &NewStory, artifact_path: Option<&str>) -> Result<StoryUpdate> {
        let story = self.stories().create(new, artifact_path)?;
        let epic = self.recompute_epic(story.epic_num)?;
        Ok(StoryUpdate { story, epic })
    }

    /// Apply one lifecycle edge, then recompute the story's epic.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidTransition`] for an illegal edge.
    pub fn transition_story(&self, story_id: &str, target: StoryState) -> Result<StoryUpdate> {
        let story = self.stories().transition(story_id, target)?;
        let epic = self.recompute_epic(story.epic_num)?;
        Ok(StoryUpdate { story, epic })
    }

    /// Move a story to `done` and record its actual effort.
    ///
    /// A story in `in_progress` passes through `review` on the way, so every
    /// applied edge is a legal one. A story still in `todo` is rejected.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidTransition`] from `todo` or `done`.
    pub fn complete_story(&self, story_id: &str, actual_effort: f64) -> Result<StoryUpdate> {
        let stories = self.stories();
        let story = stories.require(story_id)?;
        if story.state == StoryState::InProgress {
            stories.transition(story_id, StoryState::Review)?;
        }
        stories.transition(story_id, StoryState::Done)?;
        let story = stories.record_actual_effort(story_id, actual_effort)?;
        let epic = self.recompute_epic(story.epic_num)?;
        Ok(StoryUpdate { story, epic })
    }

    /// Delete a story row and recompute the epic it belonged to.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn delete_story(&self, story_id: &str) -> Result<Epic> {
        let epic_num = self.stories().delete(story_id)?;
        self.recompute_epic(epic_num)
    }

    /// # Errors
    ///
    /// See [`ActionItemService::create`].
    pub fn record_action_item(&self, new: &NewActionItem) -> Result<ActionItem> {
        self.action_items().create(new)
    }

    /// # Errors
    ///
    /// See [`ActionItemService::transition`].
    pub fn transition_action_item(&self, id: i64, target: ActionItemState) -> Result<ActionItem> {
        self.action_items().transition(id, target)
    }

    /// # Errors
    ///
    /// See [`CeremonyService::create`].
    pub fn record_ceremony(
        &self,
        new: &NewCeremony,
        transcript_path: Option<&str>,
    ) -> Result<CeremonySummary> {
        self.ceremonies().create(new, transcript_path)
    }

    /// # Errors
    ///
    /// See [`LearningService::create`].
    pub fn index_learning(&self, new: &NewLearning) -> Result<LearningEntry> {
        self.learnings().create(new)
    }

    /// # Errors
    ///
    /// See [`LearningService::supersede`].
    pub fn supersede_learning(&self, old_id: i64, new_id: i64) -> Result<LearningEntry> {
        self.learnings().supersede(old_id, new_id)
    }

    /// # Errors
    ///
    /// See [`LearningService::obsolete`].
    pub fn obsolete_learning(&self, id: i64) -> Result<LearningEntry> {
        self.learnings().obsolete(id)
    }

    /// Aggregate the epic would have if recomputed now. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the story queries fail.
    pub fn compute_aggregate(&self, epic_num: i64) -> Result<EpicAggregate> {
        let stories = self.stories();
        let breakdown = stories.breakdown(epic_num)?;
        let current = stories.current_story(epic_num)?;
        Ok(aggregate_from(&breakdown, current))
    }

    /// Recompute and persist the epic's aggregate from its stories.
    ///
    /// # Errors
    ///
    /// [`StateError::EpicNotFound`] when the epic is absent.
    pub fn recompute_epic(&self, epic_num: i64) -> Result<Epic> {
        let aggregate = self.compute_aggregate(epic_num)?;
        let epic = self.epics().write_aggregate(epic_num, &aggregate)?;
        tracing::debug!(
            epic_num,
            total = epic.total_stories,
            completed = epic.completed_stories,
            in_progress = epic.in_progress_stories,
            state = %epic.state,
            "epic aggregate recomputed"
        );
        Ok(epic)
    }

    /// One bounded read: the epic, its story breakdown and capped lists of
    /// open action items, active learnings and recent ceremonies.
    ///
    /// # Errors
    ///
    /// [`StateError::EpicNotFound`] when the epic is absent.
    pub fn get_epic_context(&self, epic_num: i64) -> Result<EpicContext> {
        let epic = self.epics().require(epic_num)?;
        Ok(EpicContext {
            stories: self.stories().breakdown(epic_num)?,
            action_items: self
                .action_items()
                .open_for_epic(epic_num, self.limits.action_items)?,
            learnings: self
                .learnings()
                .active_for_epic(epic_num, self.limits.learnings)?,
            ceremonies: self
                .ceremonies()
                .recent_for_epic(epic_num, self.limits.ceremonies)?,
            epic,
        })
    }
}

/// Lock-free read path over a dedicated query-only connection.
///
/// Each read opens its own connection and runs inside a read transaction, so
/// it sees one committed snapshot and never waits on a pending writer.
#[derive(Debug, Clone)]
pub struct ContextReader {
    store_path: PathBuf,
    busy_timeout: Duration,
    limits: ContextConfig,
}

impl ContextReader {
    #[must_use]
    pub fn new(store_path: &Path, busy_timeout: Duration, limits: ContextConfig) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            busy_timeout,
            limits,
        }
    }

    /// # Errors
    ///
    /// [`StateError::NotInitialized`] when the store does not exist yet,
    /// [`StateError::EpicNotFound`] when the epic is absent.
    pub fn get_epic_context(&self, epic_num: i64) -> Result<EpicContext> {
        self.with_snapshot(|coordinator| coordinator.get_epic_context(epic_num))
    }

    /// Run an arbitrary read against one snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or a store error opening the snapshot.
    pub fn with_snapshot<T>(&self, read: impl FnOnce(&StateCoordinator<'_>) -> Result<T>) -> Result<T> {
        let conn = db::open_reader(&self.store_path, self.busy_timeout)?;
        let snapshot = conn.unchecked_transaction()?;
        let coordinator = StateCoordinator::new(&snapshot, self.limits.clone());
        let value = read(&coordinator)?;
        snapshot.finish().map_err(StateError::from)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{StateCoordinator, aggregate_from};
    use crate::config::ContextConfig;
    use crate::db::StateStore;
    use crate::error::StateError;
    use crate::model::{EpicState, NewActionItem, NewCeremony, NewLearning, StoryState};
    use crate::service::{NewStory, StoryBreakdown};
    use chrono::NaiveDate;

    fn story(id: &str, epic_num: i64) -> NewStory {
        NewStory {
            story_id: id.to_string(),
            epic_num,
            title: format!("Story {id}"),
            estimate: Some(3.0),
            assignee: None,
        }
    }

    #[test]
    fn aggregate_rules() {
        let empty = aggregate_from(&StoryBreakdown::default(), None);
        assert_eq!(empty.state, EpicState::Planning);
        assert!(empty.progress_percent.abs() < f64::EPSILON);

        let mixed = aggregate_from(
            &StoryBreakdown {
                todo: 1,
                in_progress: 1,
                review: 1,
                done: 1,
            },
            Some("1.1".to_string()),
        );
        assert_eq!(mixed.total_stories, 4);
        assert_eq!(mixed.state, EpicState::Active);
        assert!((mixed.progress_percent - 25.0).abs() < 1e-9);

        let review_only = aggregate_from(
            &StoryBreakdown {
                review: 2,
                ..StoryBreakdown::default()
            },
            Some("1.1".to_string()),
        );
        assert_eq!(review_only.state, EpicState::Planning);

        let done = aggregate_from(
            &StoryBreakdown {
                done: 3,
                ..StoryBreakdown::default()
            },
            None,
        );
        assert_eq!(done.state, EpicState::Complete);
        assert!((done.progress_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn auth_epic_walkthrough() {
        let store = StateStore::open_in_memory().expect("open");
        let coordinator = StateCoordinator::new(store.conn(), ContextConfig::default());
        coordinator.create_epic(5, "Auth", None).expect("epic");

        let created = coordinator
            .create_story(
                &NewStory {
                    title: "Login".to_string(),
                    estimate: Some(8.0),
                    ..story("5.1", 5)
                },
                None,
            )
            .expect("create");
        assert_eq!(created.epic.total_stories, 1);
        assert!(created.epic.progress_percent.abs() < f64::EPSILON);
        assert_eq!(created.epic.current_story.as_deref(), Some("5.1"));

        let started = coordinator
            .transition_story("5.1", StoryState::InProgress)
            .expect("start");
        assert_eq!(started.epic.state, EpicState::Active);
        assert!(started.epic.start_date.is_some());

        let completed = coordinator.complete_story("5.1", 7.5).expect("complete");
        assert_eq!(completed.story.state, StoryState::Done);
        assert_eq!(completed.story.actual_effort, Some(7.5));
        assert_eq!(completed.epic.completed_stories, 1);
        assert!((completed.epic.progress_percent - 100.0).abs() < 1e-9);
        assert_eq!(completed.epic.state, EpicState::Complete);
        assert!(completed.epic.current_story.is_none());
    }

    #[test]
    fn complete_from_todo_is_rejected() {
        let store = StateStore::open_in_memory().expect("open");
        let coordinator = StateCoordinator::new(store.conn(), ContextConfig::default());
        coordinator.create_epic(2, "Billing", None).expect("epic");
        coordinator.create_story(&story("2.1", 2), None).expect("create");
        assert!(matches!(
            coordinator.complete_story("2.1", 1.0),
            Err(StateError::InvalidTransition { .. })
        ));
        let epic = coordinator.epics().require(2).expect("epic");
        assert_eq!(epic.completed_stories, 0);
    }

    #[test]
    fn create_story_without_epic_fails() {
        let store = StateStore::open_in_memory().expect("open");
        let coordinator = StateCoordinator::new(store.conn(), ContextConfig::default());
        assert!(matches!(
            coordinator.create_story(&story("9.1", 9), None),
            Err(StateError::EpicNotFound(9))
        ));
    }

    #[test]
    fn delete_story_recomputes() {
        let store = StateStore::open_in_memory().expect("open");
        let coordinator = StateCoordinator::new(store.conn(), ContextConfig::default());
        coordinator.create_epic(3, "Search", None).expect("epic");
        coordinator.create_story(&story("3.1", 3), None).expect("create");
        coordinator.create_story(&story("3.2", 3), None).expect("create");
        let epic = coordinator.delete_story("3.1").expect("delete");
        assert_eq!(epic.total_stories, 1);
        assert_eq!(epic.current_story.as_deref(), Some("3.2"));
    }

    #[test]
    fn context_is_capped() {
        let store = StateStore::open_in_memory().expect("open");
        let limits = ContextConfig {
            action_items: 3,
            learnings: 2,
            ceremonies: 1,
        };
        let coordinator = StateCoordinator::new(store.conn(), limits);
        coordinator.create_epic(5, "Auth", None).expect("epic");
        coordinator.create_story(&story("5.1", 5), None).expect("story");

        for n in 0..6 {
            coordinator
                .record_action_item(&NewActionItem {
                    summary: format!("item {n}"),
                    epic_num: Some(5),
                    ..NewActionItem::default()
                })
                .expect("item");
            coordinator
                .index_learning(&NewLearning {
                    topic: format!("topic {n}"),
                    summary: "Lesson.".to_string(),
                    epic_num: Some(5),
                    ..NewLearning::default()
                })
                .expect("learning");
            coordinator
                .record_ceremony(
                    &NewCeremony {
                        kind: crate::model::CeremonyKind::Standup,
                        epic_num: Some(5),
                        held_on: NaiveDate::from_ymd_opt(2026, 5, n + 1).expect("date"),
                        participants: vec![],
                        outcomes: vec![],
                        action_items_created: 0,
                    },
                    None,
                )
                .expect("ceremony");
        }

        let context = coordinator.get_epic_context(5).expect("context");
        assert_eq!(context.action_items.len(), 3);
        assert_eq!(context.learnings.len(), 2);
        assert_eq!(context.ceremonies.len(), 1);
        assert_eq!(context.stories.todo, 1);
        assert_eq!(context.epic.total_stories, 1);
        assert!(matches!(
            coordinator.get_epic_context(6),
            Err(StateError::EpicNotFound(6))
        ));
    }
}
