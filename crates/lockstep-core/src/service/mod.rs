//! State services, one per entity table.
//!
//! Each service borrows the store connection and owns the SQL for its table:
//! validation and foreign-key existence checks happen before any write, and
//! every timestamp is taken server-side. Services never open or commit
//! transactions; the caller decides the unit of work.

pub mod action_item;
pub mod ceremony;
pub mod epic;
pub mod learning;
pub mod story;

pub use action_item::{ActionItemFilter, ActionItemService};
pub use ceremony::{CeremonyFilter, CeremonyService};
pub use epic::{EpicAggregate, EpicFilter, EpicService};
pub use learning::{LearningFilter, LearningService};
pub use story::{NewStory, StoryBreakdown, StoryFilter, StoryService};

use chrono::{NaiveDate, Utc};
use rusqlite::types::{ToSql, Type};
use std::fmt::Write as _;
use std::str::FromStr;

use crate::error::StateError;
use crate::model::{InvalidTransition, ParseEnumError};

/// Default page size for list operations when the caller sets no limit.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Collect every row of a list operation, one [`MAX_PAGE_SIZE`] page at a time.
pub(crate) fn paged<T>(
    mut page: impl FnMut(u32) -> crate::error::Result<Vec<T>>,
) -> crate::error::Result<Vec<T>> {
    let mut all = Vec::new();
    let mut offset = 0_u32;
    loop {
        let batch = page(offset)?;
        let len = batch.len();
        all.extend(batch);
        if len < MAX_PAGE_SIZE as usize {
            return Ok(all);
        }
        offset = offset.saturating_add(MAX_PAGE_SIZE);
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// Today's date in UTC.
#[must_use]
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl From<ParseEnumError> for StateError {
    fn from(err: ParseEnumError) -> Self {
        Self::Validation(err.to_string())
    }
}

pub(crate) fn transition_error<S: std::fmt::Display>(
    entity: &'static str,
    key: impl std::fmt::Display,
    err: &InvalidTransition<S>,
) -> StateError {
    tracing::debug!(entity, %key, from = %err.from, to = %err.to, reason = err.reason, "rejected transition");
    StateError::InvalidTransition {
        entity,
        key: key.to_string(),
        from: err.from.to_string(),
        to: err.to.to_string(),
    }
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), StateError> {
    if value.trim().is_empty() {
        return Err(StateError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub(crate) fn require_non_negative(field: &str, value: Option<f64>) -> Result<(), StateError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(StateError::Validation(format!(
            "{field} must be a non-negative number, got {v}"
        ))),
        _ => Ok(()),
    }
}

/// Decode a text column into a lifecycle enum.
pub(crate) fn enum_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Decode an optional `YYYY-MM-DD` column.
pub(crate) fn date_column(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    raw.map(|text| {
        NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
    })
    .transpose()
}

pub(crate) fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Accumulates `WHERE` conditions and positional parameters for list queries.
#[derive(Default)]
pub(crate) struct Conditions {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Conditions {
    pub(crate) fn push<V: ToSql + 'static>(&mut self, column: &str, value: V) {
        self.params.push(Box::new(value));
        self.clauses.push(format!("{column} = ?{}", self.params.len()));
    }

    /// Render `WHERE ... LIMIT ?n OFFSET ?m` onto `sql`, consuming the params.
    pub(crate) fn finish(
        mut self,
        sql: &mut String,
        order_by: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Vec<Box<dyn ToSql>> {
        if !self.clauses.is_empty() {
            let _ = write!(sql, " WHERE {}", self.clauses.join(" AND "));
        }
        let _ = write!(sql, " {order_by}");

        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        self.params.push(Box::new(i64::from(limit)));
        let _ = write!(sql, " LIMIT ?{}", self.params.len());
        self.params.push(Box::new(i64::from(offset.unwrap_or(0))));
        let _ = write!(sql, " OFFSET ?{}", self.params.len());
        self.params
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::StateStore;
    use crate::service::EpicService;

    pub fn store_with_epic(epic_num: i64) -> StateStore {
        let store = StateStore::open_in_memory().expect("open store");
        EpicService::new(store.conn())
            .create(epic_num, "Auth", None)
            .expect("create epic");
        store
    }
}
