//! Ceremony summaries (standups, retrospectives, planning and review sessions).

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::action_item::ensure_epic;
use super::{Conditions, enum_column, now_us};
use crate::error::{Result, StateError};
use crate::model::{CeremonyKind, CeremonySummary, NewCeremony};

const SELECT_CEREMONY: &str = "SELECT id, kind, epic_num, held_on, participants_json, \
     outcomes_json, action_items_created, transcript_path, created_at_us \
     FROM ceremony_summaries";

const RECENT_ORDER: &str = "ORDER BY held_on DESC, id DESC";

#[derive(Debug, Clone, Default)]
pub struct CeremonyFilter {
    pub epic_num: Option<i64>,
    pub kind: Option<CeremonyKind>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub struct CeremonyService<'c> {
    conn: &'c Connection,
}

impl<'c> CeremonyService<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// # Errors
    ///
    /// [`StateError::Validation`] for a negative action-item count,
    /// [`StateError::EpicNotFound`] for an unknown owning epic.
    pub fn create(&self, new: &NewCeremony, transcript_path: Option<&str>) -> Result<CeremonySummary> {
        if new.action_items_created < 0 {
            return Err(StateError::Validation(
                "action items created must not be negative".to_string(),
            ));
        }
        if new.participants.iter().any(|p| p.trim().is_empty()) {
            return Err(StateError::Validation(
                "participant names must not be empty".to_string(),
            ));
        }
        if let Some(epic_num) = new.epic_num {
            ensure_epic(self.conn, epic_num)?;
        }

        let participants = to_json(&new.participants)?;
        let outcomes = to_json(&new.outcomes)?;
        self.conn.execute(
            "INSERT INTO ceremony_summaries (kind, epic_num, held_on, participants_json,
                                             outcomes_json, action_items_created,
                                             transcript_path, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.kind.as_str(),
                new.epic_num,
                new.held_on.format("%Y-%m-%d").to_string(),
                participants,
                outcomes,
                new.action_items_created,
                transcript_path,
                now_us()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, kind = %new.kind, "ceremony recorded");
        self.require(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<CeremonySummary>> {
        let sql = format!("{SELECT_CEREMONY} WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], row_to_ceremony)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn require(&self, id: i64) -> Result<CeremonySummary> {
        self.get(id)?
            .ok_or_else(|| StateError::not_found("ceremony summary", id))
    }

    /// Most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &CeremonyFilter) -> Result<Vec<CeremonySummary>> {
        let mut conditions = Conditions::default();
        if let Some(epic_num) = filter.epic_num {
            conditions.push("epic_num", epic_num);
        }
        if let Some(kind) = filter.kind {
            conditions.push("kind", kind.as_str());
        }
        let mut sql = SELECT_CEREMONY.to_string();
        let params = conditions.finish(&mut sql, RECENT_ORDER, filter.limit, filter.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_ceremony)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent_for_epic(&self, epic_num: i64, cap: u32) -> Result<Vec<CeremonySummary>> {
        let sql = format!("{SELECT_CEREMONY} WHERE epic_num = ?1 {RECENT_ORDER} LIMIT ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![epic_num, i64::from(cap)], row_to_ceremony)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Summary that references `path` as its transcript, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_transcript_path(&self, path: &str) -> Result<Option<CeremonySummary>> {
        let sql = format!("{SELECT_CEREMONY} WHERE transcript_path = ?1");
        Ok(self
            .conn
            .query_row(&sql, [path], row_to_ceremony)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn delete(&self, id: i64) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM ceremony_summaries WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(StateError::not_found("ceremony summary", id));
        }
        Ok(())
    }
}

fn to_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).map_err(|err| StateError::Internal(err.to_string()))
}

fn json_list(idx: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn row_to_ceremony(row: &Row<'_>) -> rusqlite::Result<CeremonySummary> {
    let kind: String = row.get(1)?;
    let held_on: Option<String> = row.get(3)?;
    let participants: String = row.get(4)?;
    let outcomes: String = row.get(5)?;
    let held_on = super::date_column(3, held_on)?.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Null,
            "held_on is null".into(),
        )
    })?;
    Ok(CeremonySummary {
        id: row.get(0)?,
        kind: enum_column(1, &kind)?,
        epic_num: row.get(2)?,
        held_on,
        participants: json_list(4, &participants)?,
        outcomes: json_list(5, &outcomes)?,
        action_items_created: row.get(6)?,
        transcript_path: row.get(7)?,
        created_at_us: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{CeremonyFilter, CeremonyService};
    use crate::error::StateError;
    use crate::model::{CeremonyKind, NewCeremony};
    use crate::service::test_support::store_with_epic;
    use chrono::NaiveDate;

    fn retro(day: u32) -> NewCeremony {
        NewCeremony {
            kind: CeremonyKind::Retrospective,
            epic_num: Some(5),
            held_on: NaiveDate::from_ymd_opt(2026, 4, day).expect("date"),
            participants: vec!["ana".to_string(), "ben".to_string()],
            outcomes: vec!["ship smaller stories".to_string()],
            action_items_created: 2,
        }
    }

    #[test]
    fn create_keeps_lists() {
        let store = store_with_epic(5);
        let ceremonies = CeremonyService::new(store.conn());
        let created = ceremonies
            .create(&retro(1), Some("ceremonies/epic-5/retrospective-2026-04-01.md"))
            .expect("create");
        assert_eq!(created.participants, vec!["ana", "ben"]);
        assert_eq!(created.outcomes.len(), 1);
        let found = ceremonies
            .by_transcript_path("ceremonies/epic-5/retrospective-2026-04-01.md")
            .expect("lookup");
        assert_eq!(found, Some(created));
    }

    #[test]
    fn invalid_input_is_rejected() {
        let store = store_with_epic(5);
        let ceremonies = CeremonyService::new(store.conn());
        let mut bad = retro(1);
        bad.action_items_created = -1;
        assert!(matches!(ceremonies.create(&bad, None), Err(StateError::Validation(_))));

        let mut orphan = retro(1);
        orphan.epic_num = Some(42);
        assert!(matches!(ceremonies.create(&orphan, None), Err(StateError::EpicNotFound(42))));
    }

    #[test]
    fn recent_for_epic_is_capped_and_newest_first() {
        let store = store_with_epic(5);
        let ceremonies = CeremonyService::new(store.conn());
        for day in 1..=7 {
            ceremonies.create(&retro(day), None).expect("create");
        }
        let recent = ceremonies.recent_for_epic(5, 5).expect("recent");
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].held_on, NaiveDate::from_ymd_opt(2026, 4, 7).expect("date"));

        let standups = ceremonies
            .list(&CeremonyFilter {
                kind: Some(CeremonyKind::Standup),
                ..CeremonyFilter::default()
            })
            .expect("list");
        assert!(standups.is_empty());
    }
}
