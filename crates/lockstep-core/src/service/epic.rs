//! Epic rows: creation, plan edits, archival and the aggregate write used by
//! the recompute step.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use super::{Conditions, date_column, date_text, now_us, require_text};
use crate::error::{Result, StateError};
use crate::model::{Epic, EpicState};

const SELECT_EPIC: &str = "SELECT epic_num, title, state, total_stories, completed_stories, \
     in_progress_stories, progress_percent, current_story, start_date, target_date, \
     completion_date, extension_json, artifact_path, created_at_us, updated_at_us \
     FROM epics";

/// Derived aggregate fields of an epic, produced by the recompute step.
#[derive(Debug, Clone, PartialEq)]
pub struct EpicAggregate {
    pub total_stories: i64,
    pub completed_stories: i64,
    pub in_progress_stories: i64,
    pub progress_percent: f64,
    pub current_story: Option<String>,
    pub state: EpicState,
}

impl EpicAggregate {
    /// Whether the stored epic row already carries these values.
    #[must_use]
    pub fn matches(&self, epic: &Epic) -> bool {
        self.total_stories == epic.total_stories
            && self.completed_stories == epic.completed_stories
            && self.in_progress_stories == epic.in_progress_stories
            && (self.progress_percent - epic.progress_percent).abs() < 1e-9
            && self.current_story == epic.current_story
            && (epic.state == EpicState::Archived || self.state == epic.state)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpicFilter {
    pub state: Option<EpicState>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub struct EpicService<'c> {
    conn: &'c Connection,
}

impl<'c> EpicService<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a new epic in `planning` with zeroed aggregates.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a non-positive number or empty title,
    /// [`StateError::AlreadyExists`] if the number is taken.
    pub fn create(&self, epic_num: i64, title: &str, artifact_path: Option<&str>) -> Result<Epic> {
        if epic_num <= 0 {
            return Err(StateError::Validation(format!(
                "epic number must be positive, got {epic_num}"
            )));
        }
        require_text("epic title", title)?;
        if self.exists(epic_num)? {
            return Err(StateError::already_exists("epic", epic_num));
        }

        let now = now_us();
        self.conn.execute(
            "INSERT INTO epics (epic_num, title, state, artifact_path, created_at_us, updated_at_us)
             VALUES (?1, ?2, 'planning', ?3, ?4, ?4)",
            params![epic_num, title.trim(), artifact_path, now],
        )?;
        tracing::debug!(epic_num, "epic created");
        self.require(epic_num)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, epic_num: i64) -> Result<Option<Epic>> {
        let sql = format!("{SELECT_EPIC} WHERE epic_num = ?1");
        Ok(self
            .conn
            .query_row(&sql, [epic_num], row_to_epic)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::EpicNotFound`] when absent.
    pub fn require(&self, epic_num: i64) -> Result<Epic> {
        self.get(epic_num)?
            .ok_or(StateError::EpicNotFound(epic_num))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn exists(&self, epic_num: i64) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM epics WHERE epic_num = ?1)",
            [epic_num],
            |row| row.get(0),
        )?)
    }

    /// List epics ordered by number.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &EpicFilter) -> Result<Vec<Epic>> {
        let mut conditions = Conditions::default();
        if let Some(state) = filter.state {
            conditions.push("state", state.as_str());
        }
        let mut sql = SELECT_EPIC.to_string();
        let params = conditions.finish(&mut sql, "ORDER BY epic_num ASC", filter.limit, filter.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_epic)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Edit authored planning fields; `None` leaves a field unchanged.
    /// Derived aggregates are untouched.
    ///
    /// # Errors
    ///
    /// [`StateError::EpicNotFound`] when absent, [`StateError::Validation`]
    /// when the epic is archived.
    pub fn update_plan(
        &self,
        epic_num: i64,
        target_date: Option<NaiveDate>,
        extension: Option<&Map<String, Value>>,
    ) -> Result<Epic> {
        let epic = self.require(epic_num)?;
        if epic.state.is_terminal() {
            return Err(StateError::Validation(format!("epic {epic_num} is archived")));
        }
        let extension_json = match extension {
            Some(map) => serde_json::to_string(map)
                .map_err(|err| StateError::Validation(format!("extension map: {err}")))?,
            None => serde_json::to_string(&epic.extension)
                .map_err(|err| StateError::Internal(err.to_string()))?,
        };
        self.conn.execute(
            "UPDATE epics SET target_date = ?1, extension_json = ?2, updated_at_us = ?3
             WHERE epic_num = ?4",
            params![date_text(target_date.or(epic.target_date)), extension_json, now_us(), epic_num],
        )?;
        self.require(epic_num)
    }

    /// Move a `complete` epic to `archived`.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidTransition`] from any other state.
    pub fn archive(&self, epic_num: i64) -> Result<Epic> {
        let epic = self.require(epic_num)?;
        if epic.state != EpicState::Complete {
            return Err(StateError::InvalidTransition {
                entity: "epic",
                key: epic_num.to_string(),
                from: epic.state.to_string(),
                to: EpicState::Archived.to_string(),
            });
        }
        self.conn.execute(
            "UPDATE epics SET state = 'archived', updated_at_us = ?1 WHERE epic_num = ?2",
            params![now_us(), epic_num],
        )?;
        tracing::info!(epic_num, "epic archived");
        self.require(epic_num)
    }

    /// Delete an epic that has no stories.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] while stories still reference it.
    pub fn delete(&self, epic_num: i64) -> Result<()> {
        let stories: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM stories WHERE epic_num = ?1",
            [epic_num],
            |row| row.get(0),
        )?;
        if stories > 0 {
            return Err(StateError::Validation(format!(
                "epic {epic_num} still has {stories} stories"
            )));
        }
        self.purge(epic_num)
    }

    /// Delete an epic and, through the foreign key, all of its stories.
    pub(crate) fn purge(&self, epic_num: i64) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM epics WHERE epic_num = ?1", [epic_num])?;
        if removed == 0 {
            return Err(StateError::EpicNotFound(epic_num));
        }
        Ok(())
    }

    /// Persist a freshly computed aggregate. Only the recompute step calls this.
    ///
    /// Start date is set the first time the epic leaves `planning`; completion
    /// date tracks `complete`. Archived epics keep their state.
    pub(crate) fn write_aggregate(&self, epic_num: i64, aggregate: &EpicAggregate) -> Result<Epic> {
        let epic = self.require(epic_num)?;
        let state = if epic.state == EpicState::Archived {
            EpicState::Archived
        } else {
            aggregate.state
        };
        let today = super::today();
        let start_date = match (epic.start_date, state) {
            (Some(date), _) => Some(date),
            (None, EpicState::Planning) => None,
            (None, _) => Some(today),
        };
        let completion_date = match state {
            EpicState::Complete => epic.completion_date.or(Some(today)),
            EpicState::Archived => epic.completion_date,
            EpicState::Planning | EpicState::Active => None,
        };

        self.conn.execute(
            "UPDATE epics SET state = ?1, total_stories = ?2, completed_stories = ?3,
                 in_progress_stories = ?4, progress_percent = ?5, current_story = ?6,
                 start_date = ?7, completion_date = ?8, updated_at_us = ?9
             WHERE epic_num = ?10",
            params![
                state.as_str(),
                aggregate.total_stories,
                aggregate.completed_stories,
                aggregate.in_progress_stories,
                aggregate.progress_percent,
                aggregate.current_story,
                date_text(start_date),
                date_text(completion_date),
                now_us(),
                epic_num
            ],
        )?;
        self.require(epic_num)
    }

    pub(crate) fn force_title(&self, epic_num: i64, title: &str) -> Result<()> {
        require_text("epic title", title)?;
        self.conn.execute(
            "UPDATE epics SET title = ?1, updated_at_us = ?2 WHERE epic_num = ?3",
            params![title.trim(), now_us(), epic_num],
        )?;
        Ok(())
    }

    pub(crate) fn set_artifact_path(&self, epic_num: i64, path: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE epics SET artifact_path = ?1, updated_at_us = ?2 WHERE epic_num = ?3",
            params![path, now_us(), epic_num],
        )?;
        Ok(())
    }
}

fn row_to_epic(row: &Row<'_>) -> rusqlite::Result<Epic> {
    let state: String = row.get(2)?;
    let extension_json: String = row.get(11)?;
    let extension: Map<String, Value> = serde_json::from_str(&extension_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(err))
    })?;

    Ok(Epic {
        epic_num: row.get(0)?,
        title: row.get(1)?,
        state: super::enum_column(2, &state)?,
        total_stories: row.get(3)?,
        completed_stories: row.get(4)?,
        in_progress_stories: row.get(5)?,
        progress_percent: row.get(6)?,
        current_story: row.get(7)?,
        start_date: date_column(8, row.get(8)?)?,
        target_date: date_column(9, row.get(9)?)?,
        completion_date: date_column(10, row.get(10)?)?,
        extension,
        artifact_path: row.get(12)?,
        created_at_us: row.get(13)?,
        updated_at_us: row.get(14)?,
    })
}
