//! Learning index: short lessons with relevance and a supersession chain.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::action_item::ensure_epic;
use super::{Conditions, enum_column, now_us, require_text};
use crate::error::{Result, StateError};
use crate::model::{LearningEntry, LearningState, NewLearning};

const SELECT_LEARNING: &str = "SELECT id, topic, summary, relevance, contributor, epic_num, \
     source_doc, state, superseded_by, created_at_us, updated_at_us \
     FROM learning_index";

const RELEVANCE_ORDER: &str = "ORDER BY CASE relevance \
     WHEN 'high' THEN 0 \
     WHEN 'medium' THEN 1 \
     WHEN 'low' THEN 2 \
     END ASC, created_at_us DESC, id DESC";

#[derive(Debug, Clone, Default)]
pub struct LearningFilter {
    pub epic_num: Option<i64>,
    pub state: Option<LearningState>,
    pub topic: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub struct LearningService<'c> {
    conn: &'c Connection,
}

impl<'c> LearningService<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// # Errors
    ///
    /// [`StateError::Validation`] for an empty topic or summary,
    /// [`StateError::EpicNotFound`] for an unknown owning epic.
    pub fn create(&self, new: &NewLearning) -> Result<LearningEntry> {
        require_text("learning topic", &new.topic)?;
        require_text("learning summary", &new.summary)?;
        if let Some(epic_num) = new.epic_num {
            ensure_epic(self.conn, epic_num)?;
        }

        let now = now_us();
        self.conn.execute(
            "INSERT INTO learning_index (topic, summary, relevance, contributor, epic_num,
                                         source_doc, state, created_at_us, updated_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)",
            params![
                new.topic.trim(),
                new.summary.trim(),
                new.relevance.as_str(),
                new.contributor,
                new.epic_num,
                new.source_doc,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, topic = %new.topic, "learning indexed");
        self.require(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<LearningEntry>> {
        let sql = format!("{SELECT_LEARNING} WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], row_to_learning)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn require(&self, id: i64) -> Result<LearningEntry> {
        self.get(id)?
            .ok_or_else(|| StateError::not_found("learning", id))
    }

    /// Most relevant first, then newest.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &LearningFilter) -> Result<Vec<LearningEntry>> {
        let mut conditions = Conditions::default();
        if let Some(epic_num) = filter.epic_num {
            conditions.push("epic_num", epic_num);
        }
        if let Some(state) = filter.state {
            conditions.push("state", state.as_str());
        }
        if let Some(ref topic) = filter.topic {
            conditions.push("topic", topic.clone());
        }
        let mut sql = SELECT_LEARNING.to_string();
        let params = conditions.finish(&mut sql, RELEVANCE_ORDER, filter.limit, filter.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_learning)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active learnings of an epic, most relevant first, capped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_for_epic(&self, epic_num: i64, cap: u32) -> Result<Vec<LearningEntry>> {
        let sql = format!(
            "{SELECT_LEARNING} WHERE epic_num = ?1 AND state = 'active' {RELEVANCE_ORDER} LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![epic_num, i64::from(cap)], row_to_learning)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Mark `old_id` obsolete with a forward reference to `new_id`.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] when the ids are equal or the replacement is
    /// itself obsolete; [`StateError::InvalidTransition`] when `old_id` is
    /// already obsolete.
    pub fn supersede(&self, old_id: i64, new_id: i64) -> Result<LearningEntry> {
        if old_id == new_id {
            return Err(StateError::Validation(
                "a learning cannot supersede itself".to_string(),
            ));
        }
        let old = self.require(old_id)?;
        let replacement = self.require(new_id)?;
        if replacement.state == LearningState::Obsolete {
            return Err(StateError::Validation(format!(
                "replacement learning {new_id} is obsolete"
            )));
        }
        self.retire(&old, Some(new_id))
    }

    /// Mark a learning obsolete without a replacement.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidTransition`] when already obsolete.
    pub fn obsolete(&self, id: i64) -> Result<LearningEntry> {
        let entry = self.require(id)?;
        self.retire(&entry, None)
    }

    fn retire(&self, entry: &LearningEntry, superseded_by: Option<i64>) -> Result<LearningEntry> {
        if entry.state == LearningState::Obsolete {
            return Err(StateError::InvalidTransition {
                entity: "learning",
                key: entry.id.to_string(),
                from: entry.state.to_string(),
                to: LearningState::Obsolete.to_string(),
            });
        }
        self.conn.execute(
            "UPDATE learning_index SET state = 'obsolete', superseded_by = ?1, updated_at_us = ?2
             WHERE id = ?3",
            params![superseded_by, now_us(), entry.id],
        )?;
        self.require(entry.id)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn delete(&self, id: i64) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM learning_index WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(StateError::not_found("learning", id));
        }
        Ok(())
    }
}

fn row_to_learning(row: &Row<'_>) -> rusqlite::Result<LearningEntry> {
    let relevance: String = row.get(3)?;
    let state: String = row.get(7)?;
    Ok(LearningEntry {
        id: row.get(0)?,
        topic: row.get(1)?,
        summary: row.get(2)?,
        relevance: enum_column(3, &relevance)?,
        contributor: row.get(4)?,
        epic_num: row.get(5)?,
        source_doc: row.get(6)?,
        state: enum_column(7, &state)?,
        superseded_by: row.get(8)?,
        created_at_us: row.get(9)?,
        updated_at_us: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{LearningFilter, LearningService};
    use crate::error::StateError;
    use crate::model::{LearningState, NewLearning, Relevance};
    use crate::service::test_support::store_with_epic;

    fn lesson(topic: &str, relevance: Relevance) -> NewLearning {
        NewLearning {
            topic: topic.to_string(),
            summary: "Keep migrations small.".to_string(),
            relevance,
            epic_num: Some(5),
            ..NewLearning::default()
        }
    }

    #[test]
    fn active_learnings_rank_by_relevance() {
        let store = store_with_epic(5);
        let learnings = LearningService::new(store.conn());
        let low = learnings.create(&lesson("low", Relevance::Low)).expect("create");
        let high = learnings.create(&lesson("high", Relevance::High)).expect("create");
        let medium = learnings.create(&lesson("medium", Relevance::Medium)).expect("create");

        let ranked = learnings.active_for_epic(5, 10).expect("active");
        let ids: Vec<i64> = ranked.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![high.id, medium.id, low.id]);
    }

    #[test]
    fn supersede_links_forward_and_hides_old_entry() {
        let store = store_with_epic(5);
        let learnings = LearningService::new(store.conn());
        let old = learnings.create(&lesson("db", Relevance::High)).expect("create");
        let new = learnings.create(&lesson("db", Relevance::High)).expect("create");

        let retired = learnings.supersede(old.id, new.id).expect("supersede");
        assert_eq!(retired.state, LearningState::Obsolete);
        assert_eq!(retired.superseded_by, Some(new.id));

        let active = learnings.active_for_epic(5, 10).expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new.id);

        assert!(matches!(
            learnings.supersede(old.id, new.id),
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            learnings.supersede(new.id, new.id),
            Err(StateError::Validation(_))
        ));
    }

    #[test]
    fn obsolete_replacement_is_rejected() {
        let store = store_with_epic(5);
        let learnings = LearningService::new(store.conn());
        let a = learnings.create(&lesson("a", Relevance::Low)).expect("create");
        let b = learnings.create(&lesson("b", Relevance::Low)).expect("create");
        learnings.obsolete(b.id).expect("obsolete");
        assert!(matches!(learnings.supersede(a.id, b.id), Err(StateError::Validation(_))));
    }

    #[test]
    fn list_filters_by_topic_and_state() {
        let store = store_with_epic(5);
        let learnings = LearningService::new(store.conn());
        learnings.create(&lesson("caching", Relevance::Low)).expect("create");
        let gone = learnings.create(&lesson("caching", Relevance::High)).expect("create");
        learnings.create(&lesson("testing", Relevance::Low)).expect("create");
        learnings.obsolete(gone.id).expect("obsolete");

        let caching = learnings
            .list(&LearningFilter {
                topic: Some("caching".to_string()),
                state: Some(LearningState::Active),
                ..LearningFilter::default()
            })
            .expect("list");
        assert_eq!(caching.len(), 1);
        assert!(matches!(learnings.create(&lesson(" ", Relevance::Low)), Err(StateError::Validation(_))));
    }
}
