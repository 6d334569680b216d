//! Story rows and the story lifecycle.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{Conditions, enum_column, now_us, require_non_negative, require_text, transition_error};
use crate::error::{Result, StateError};
use crate::model::{EpicState, Story, StoryState};

const SELECT_STORY: &str = "SELECT story_id, epic_num, title, state, assignee, estimate, \
     actual_effort, artifact_path, created_at_us, started_at_us, completed_at_us, updated_at_us \
     FROM stories";

/// Caller input for creating a story.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewStory {
    pub story_id: String,
    pub epic_num: i64,
    pub title: String,
    pub estimate: Option<f64>,
    pub assignee: Option<String>,
}

/// Story counts of one epic, by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoryBreakdown {
    pub todo: i64,
    pub in_progress: i64,
    pub review: i64,
    pub done: i64,
}

impl StoryBreakdown {
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.todo + self.in_progress + self.review + self.done
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoryFilter {
    pub epic_num: Option<i64>,
    pub state: Option<StoryState>,
    pub assignee: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Check a story id against its epic: `<epic>.<suffix>` with a suffix of
/// ASCII alphanumerics, `.`, `-` or `_`.
///
/// # Errors
///
/// [`StateError::Validation`] describing the problem.
pub fn validate_story_id(story_id: &str, epic_num: i64) -> Result<()> {
    let prefix = format!("{epic_num}.");
    let Some(suffix) = story_id.strip_prefix(&prefix) else {
        return Err(StateError::Validation(format!(
            "story id '{story_id}' must start with '{prefix}'"
        )));
    };
    if suffix.is_empty()
        || !suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(StateError::Validation(format!(
            "story id '{story_id}' has an empty or malformed suffix"
        )));
    }
    Ok(())
}

pub struct StoryService<'c> {
    conn: &'c Connection,
}

impl<'c> StoryService<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a story in `todo`.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for malformed input or an archived epic,
    /// [`StateError::EpicNotFound`] when the epic is absent,
    /// [`StateError::AlreadyExists`] when the id is taken.
    pub fn create(&self, new: &NewStory, artifact_path: Option<&str>) -> Result<Story> {
        validate_story_id(&new.story_id, new.epic_num)?;
        require_text("story title", &new.title)?;
        require_non_negative("estimate", new.estimate)?;

        let epic_state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM epics WHERE epic_num = ?1",
                [new.epic_num],
                |row| row.get(0),
            )
            .optional()?;
        match epic_state.as_deref() {
            None => return Err(StateError::EpicNotFound(new.epic_num)),
            Some(state) if state == EpicState::Archived.as_str() => {
                return Err(StateError::Validation(format!(
                    "epic {} is archived",
                    new.epic_num
                )));
            }
            Some(_) => {}
        }
        if self.get(&new.story_id)?.is_some() {
            return Err(StateError::already_exists("story", &new.story_id));
        }

        let now = now_us();
        self.conn.execute(
            "INSERT INTO stories (story_id, epic_num, title, state, assignee, estimate,
                                  artifact_path, created_at_us, updated_at_us)
             VALUES (?1, ?2, ?3, 'todo', ?4, ?5, ?6, ?7, ?7)",
            params![
                new.story_id,
                new.epic_num,
                new.title.trim(),
                new.assignee,
                new.estimate,
                artifact_path,
                now
            ],
        )?;
        tracing::debug!(story_id = %new.story_id, epic_num = new.epic_num, "story created");
        self.require(&new.story_id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, story_id: &str) -> Result<Option<Story>> {
        let sql = format!("{SELECT_STORY} WHERE story_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [story_id], row_to_story)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn require(&self, story_id: &str) -> Result<Story> {
        self.get(story_id)?
            .ok_or_else(|| StateError::not_found("story", story_id))
    }

    /// List stories ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &StoryFilter) -> Result<Vec<Story>> {
        let mut conditions = Conditions::default();
        if let Some(epic_num) = filter.epic_num {
            conditions.push("epic_num", epic_num);
        }
        if let Some(state) = filter.state {
            conditions.push("state", state.as_str());
        }
        if let Some(ref assignee) = filter.assignee {
            conditions.push("assignee", assignee.clone());
        }
        let mut sql = SELECT_STORY.to_string();
        let params = conditions.finish(&mut sql, "ORDER BY story_id ASC", filter.limit, filter.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_story)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply one lifecycle edge.
    ///
    /// `started_at` is stamped on the first move out of `todo`;
    /// `completed_at` only on `done`.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent, [`StateError::InvalidTransition`]
    /// for an illegal edge.
    pub fn transition(&self, story_id: &str, target: StoryState) -> Result<Story> {
        let story = self.require(story_id)?;
        story
            .state
            .can_transition_to(target)
            .map_err(|err| transition_error("story", story_id, &err))?;

        let now = now_us();
        let started = story.started_at_us.unwrap_or(now);
        let completed = (target == StoryState::Done).then_some(now);
        self.conn.execute(
            "UPDATE stories SET state = ?1, started_at_us = ?2, completed_at_us = ?3,
                 updated_at_us = ?4
             WHERE story_id = ?5",
            params![target.as_str(), started, completed, now, story_id],
        )?;
        tracing::debug!(story_id, from = %story.state, to = %target, "story transitioned");
        self.require(story_id)
    }

    /// # Errors
    ///
    /// [`StateError::Validation`] for a negative or non-finite value.
    pub fn record_actual_effort(&self, story_id: &str, actual: f64) -> Result<Story> {
        require_non_negative("actual effort", Some(actual))?;
        let updated = self.conn.execute(
            "UPDATE stories SET actual_effort = ?1, updated_at_us = ?2 WHERE story_id = ?3",
            params![actual, now_us(), story_id],
        )?;
        if updated == 0 {
            return Err(StateError::not_found("story", story_id));
        }
        self.require(story_id)
    }

    /// Count an epic's stories by state in one pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn breakdown(&self, epic_num: i64) -> Result<StoryBreakdown> {
        Ok(self.conn.query_row(
            "SELECT
                COALESCE(SUM(state = 'todo'), 0),
                COALESCE(SUM(state = 'in_progress'), 0),
                COALESCE(SUM(state = 'review'), 0),
                COALESCE(SUM(state = 'done'), 0)
             FROM stories WHERE epic_num = ?1",
            [epic_num],
            |row| {
                Ok(StoryBreakdown {
                    todo: row.get(0)?,
                    in_progress: row.get(1)?,
                    review: row.get(2)?,
                    done: row.get(3)?,
                })
            },
        )?)
    }

    /// Smallest story id of the epic that is not yet done.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn current_story(&self, epic_num: i64) -> Result<Option<String>> {
        Ok(self.conn.query_row(
            "SELECT MIN(story_id) FROM stories WHERE epic_num = ?1 AND state <> 'done'",
            [epic_num],
            |row| row.get(0),
        )?)
    }

    /// Delete a story row and return the epic it belonged to.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn delete(&self, story_id: &str) -> Result<i64> {
        let story = self.require(story_id)?;
        self.conn
            .execute("DELETE FROM stories WHERE story_id = ?1", [story_id])?;
        Ok(story.epic_num)
    }

    /// Overwrite state outside the lifecycle. Repair only.
    pub(crate) fn force_state(&self, story_id: &str, state: StoryState) -> Result<Story> {
        let story = self.require(story_id)?;
        let now = now_us();
        let started = match state {
            StoryState::Todo => story.started_at_us,
            _ => Some(story.started_at_us.unwrap_or(now)),
        };
        let completed = match state {
            StoryState::Done => Some(story.completed_at_us.unwrap_or(now)),
            _ => None,
        };
        tracing::warn!(story_id, from = %story.state, to = %state, "overwriting story state");
        self.conn.execute(
            "UPDATE stories SET state = ?1, started_at_us = ?2, completed_at_us = ?3,
                 updated_at_us = ?4
             WHERE story_id = ?5",
            params![state.as_str(), started, completed, now, story_id],
        )?;
        self.require(story_id)
    }

    pub(crate) fn force_title(&self, story_id: &str, title: &str) -> Result<()> {
        require_text("story title", title)?;
        self.conn.execute(
            "UPDATE stories SET title = ?1, updated_at_us = ?2 WHERE story_id = ?3",
            params![title.trim(), now_us(), story_id],
        )?;
        Ok(())
    }
}

fn row_to_story(row: &Row<'_>) -> rusqlite::Result<Story> {
    let state: String = row.get(3)?;
    Ok(Story {
        story_id: row.get(0)?,
        epic_num: row.get(1)?,
        title: row.get(2)?,
        state: enum_column(3, &state)?,
        assignee: row.get(4)?,
        estimate: row.get(5)?,
        actual_effort: row.get(6)?,
        artifact_path: row.get(7)?,
        created_at_us: row.get(8)?,
        started_at_us: row.get(9)?,
        completed_at_us: row.get(10)?,
        updated_at_us: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{NewStory, StoryFilter, StoryService, validate_story_id};
    use crate::error::StateError;
    use crate::model::StoryState;
    use crate::service::test_support::store_with_epic;

    fn new_story(id: &str) -> NewStory {
        NewStory {
            story_id: id.to_string(),
            epic_num: 5,
            title: "Login".to_string(),
            estimate: Some(8.0),
            assignee: None,
        }
    }

    #[test]
    fn story_ids_must_belong_to_their_epic() {
        assert!(validate_story_id("5.1", 5).is_ok());
        assert!(validate_story_id("5.1a-b_c", 5).is_ok());
        assert!(validate_story_id("6.1", 5).is_err());
        assert!(validate_story_id("51", 5).is_err());
        assert!(validate_story_id("5.", 5).is_err());
        assert!(validate_story_id("5.1/../x", 5).is_err());
    }

    #[test]
    fn create_requires_existing_epic() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        let mut orphan = new_story("7.1");
        orphan.epic_num = 7;
        assert!(matches!(stories.create(&orphan, None), Err(StateError::EpicNotFound(7))));

        let story = stories.create(&new_story("5.1"), None).expect("create");
        assert_eq!(story.state, StoryState::Todo);
        assert!(story.started_at_us.is_none());
        assert!(matches!(
            stories.create(&new_story("5.1"), None),
            Err(StateError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn lifecycle_stamps_timestamps() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        stories.create(&new_story("5.1"), None).expect("create");

        let started = stories.transition("5.1", StoryState::InProgress).expect("start");
        assert!(started.started_at_us.is_some());
        assert!(started.completed_at_us.is_none());

        stories.transition("5.1", StoryState::Review).expect("review");
        let reworked = stories.transition("5.1", StoryState::InProgress).expect("rework");
        assert_eq!(reworked.started_at_us, started.started_at_us);

        stories.transition("5.1", StoryState::Review).expect("review");
        let done = stories.transition("5.1", StoryState::Done).expect("done");
        assert!(done.completed_at_us.is_some());
    }

    #[test]
    fn illegal_edges_are_rejected_without_writes() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        let created = stories.create(&new_story("5.1"), None).expect("create");

        let err = stories.transition("5.1", StoryState::Done).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { ref from, ref to, .. }
            if from == "todo" && to == "done"));
        assert_eq!(stories.require("5.1").expect("get"), created);
        assert!(matches!(
            stories.transition("5.9", StoryState::InProgress),
            Err(StateError::NotFound { .. })
        ));
    }

    #[test]
    fn breakdown_and_current_story() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        for id in ["5.1", "5.2", "5.3"] {
            stories.create(&new_story(id), None).expect("create");
        }
        stories.force_state("5.1", StoryState::Done).expect("force");
        stories.transition("5.2", StoryState::InProgress).expect("start");

        let breakdown = stories.breakdown(5).expect("breakdown");
        assert_eq!(breakdown.done, 1);
        assert_eq!(breakdown.in_progress, 1);
        assert_eq!(breakdown.todo, 1);
        assert_eq!(breakdown.total(), 3);
        assert_eq!(stories.current_story(5).expect("current").as_deref(), Some("5.2"));
        assert_eq!(stories.breakdown(99).expect("empty").total(), 0);
    }

    #[test]
    fn list_filters_by_state() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        for id in ["5.1", "5.2", "5.3"] {
            stories.create(&new_story(id), None).expect("create");
        }
        stories.transition("5.3", StoryState::InProgress).expect("start");

        let todo = stories
            .list(&StoryFilter {
                epic_num: Some(5),
                state: Some(StoryState::Todo),
                ..StoryFilter::default()
            })
            .expect("list");
        let ids: Vec<&str> = todo.iter().map(|s| s.story_id.as_str()).collect();
        assert_eq!(ids, vec!["5.1", "5.2"]);
    }

    #[test]
    fn effort_must_be_non_negative() {
        let store = store_with_epic(5);
        let stories = StoryService::new(store.conn());
        stories.create(&new_story("5.1"), None).expect("create");
        assert!(stories.record_actual_effort("5.1", -2.0).is_err());
        let story = stories.record_actual_effort("5.1", 7.5).expect("effort");
        assert_eq!(story.actual_effort, Some(7.5));
    }
}
