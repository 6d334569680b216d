//! Action items raised by ceremonies and reviews.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{Conditions, date_column, date_text, enum_column, now_us, require_text, transition_error};
use crate::error::{Result, StateError};
use crate::model::{ActionItem, ActionItemState, NewActionItem};

const SELECT_ACTION_ITEM: &str = "SELECT id, summary, detail, assignee, state, priority, \
     due_date, epic_num, source_doc, created_at_us, completed_at_us, updated_at_us \
     FROM action_items";

/// Priority descending, newest first.
pub(crate) const PRIORITY_ORDER: &str = "ORDER BY CASE priority \
     WHEN 'critical' THEN 0 \
     WHEN 'high' THEN 1 \
     WHEN 'medium' THEN 2 \
     WHEN 'low' THEN 3 \
     END ASC, created_at_us DESC, id DESC";

#[derive(Debug, Clone, Default)]
pub struct ActionItemFilter {
    pub epic_num: Option<i64>,
    pub state: Option<ActionItemState>,
    pub assignee: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub struct ActionItemService<'c> {
    conn: &'c Connection,
}

impl<'c> ActionItemService<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// # Errors
    ///
    /// [`StateError::Validation`] for an empty summary,
    /// [`StateError::EpicNotFound`] for an unknown owning epic.
    pub fn create(&self, new: &NewActionItem) -> Result<ActionItem> {
        require_text("action item summary", &new.summary)?;
        if let Some(epic_num) = new.epic_num {
            ensure_epic(self.conn, epic_num)?;
        }

        let now = now_us();
        self.conn.execute(
            "INSERT INTO action_items (summary, detail, assignee, state, priority, due_date,
                                       epic_num, source_doc, created_at_us, updated_at_us)
             VALUES (?1, ?2, ?3, 'todo', ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                new.summary.trim(),
                new.detail,
                new.assignee,
                new.priority.as_str(),
                date_text(new.due_date),
                new.epic_num,
                new.source_doc,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, epic_num = ?new.epic_num, "action item recorded");
        self.require(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<ActionItem>> {
        let sql = format!("{SELECT_ACTION_ITEM} WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], row_to_action_item)
            .optional()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn require(&self, id: i64) -> Result<ActionItem> {
        self.get(id)?
            .ok_or_else(|| StateError::not_found("action item", id))
    }

    /// List items by priority (descending), then newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &ActionItemFilter) -> Result<Vec<ActionItem>> {
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
        let mut sql = SELECT_ACTION_ITEM.to_string();
        let params = conditions.finish(&mut sql, PRIORITY_ORDER, filter.limit, filter.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), row_to_action_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Open (`todo` or `in_progress`) items of an epic, capped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn open_for_epic(&self, epic_num: i64, cap: u32) -> Result<Vec<ActionItem>> {
        let sql = format!("{SELECT_ACTION_ITEM} WHERE epic_num = ?1 AND state <> 'done' {PRIORITY_ORDER} LIMIT ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![epic_num, i64::from(cap)], row_to_action_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent, [`StateError::InvalidTransition`]
    /// for an illegal edge.
    pub fn transition(&self, id: i64, target: ActionItemState) -> Result<ActionItem> {
        let item = self.require(id)?;
        item.state
            .can_transition_to(target)
            .map_err(|err| transition_error("action item", id, &err))?;

        let now = now_us();
        let completed = (target == ActionItemState::Done).then_some(now);
        self.conn.execute(
            "UPDATE action_items SET state = ?1, completed_at_us = ?2, updated_at_us = ?3
             WHERE id = ?4",
            params![target.as_str(), completed, now, id],
        )?;
        self.require(id)
    }

    /// # Errors
    ///
    /// [`StateError::NotFound`] when absent.
    pub fn delete(&self, id: i64) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM action_items WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(StateError::not_found("action item", id));
        }
        Ok(())
    }
}

pub(crate) fn ensure_epic(conn: &Connection, epic_num: i64) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM epics WHERE epic_num = ?1)",
        [epic_num],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StateError::EpicNotFound(epic_num))
    }
}

fn row_to_action_item(row: &Row<'_>) -> rusqlite::Result<ActionItem> {
    let state: String = row.get(4)?;
    let priority: String = row.get(5)?;
    Ok(ActionItem {
        id: row.get(0)?,
        summary: row.get(1)?,
        detail: row.get(2)?,
        assignee: row.get(3)?,
        state: enum_column(4, &state)?,
        priority: enum_column(5, &priority)?,
        due_date: date_column(6, row.get(6)?)?,
        epic_num: row.get(7)?,
        source_doc: row.get(8)?,
        created_at_us: row.get(9)?,
        completed_at_us: row.get(10)?,
        updated_at_us: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{ActionItemFilter, ActionItemService};
    use crate::error::StateError;
    use crate::model::{ActionItemState, NewActionItem, Priority};
    use crate::service::test_support::store_with_epic;

    fn item(summary: &str, priority: Priority) -> NewActionItem {
        NewActionItem {
            summary: summary.to_string(),
            priority,
            epic_num: Some(5),
            ..NewActionItem::default()
        }
    }

    #[test]
    fn create_validates_epic_and_summary() {
        let store = store_with_epic(5);
        let items = ActionItemService::new(store.conn());
        assert!(matches!(
            items.create(&NewActionItem {
                summary: "Fix flaky test".to_string(),
                epic_num: Some(8),
                ..NewActionItem::default()
            }),
            Err(StateError::EpicNotFound(8))
        ));
        assert!(matches!(
            items.create(&item(" ", Priority::Low)),
            Err(StateError::Validation(_))
        ));

        let created = items.create(&item("Rotate keys", Priority::High)).expect("create");
        assert_eq!(created.state, ActionItemState::Todo);
        assert_eq!(created.priority, Priority::High);
    }

    #[test]
    fn open_items_are_ordered_by_priority_then_recency() {
        let store = store_with_epic(5);
        let items = ActionItemService::new(store.conn());
        let low = items.create(&item("low", Priority::Low)).expect("create");
        let crit = items.create(&item("crit", Priority::Critical)).expect("create");
        let med_old = items.create(&item("med old", Priority::Medium)).expect("create");
        let med_new = items.create(&item("med new", Priority::Medium)).expect("create");
        let done = items.create(&item("done", Priority::Critical)).expect("create");
        items.transition(done.id, ActionItemState::Done).expect("done");

        let open = items.open_for_epic(5, 20).expect("open");
        let ids: Vec<i64> = open.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![crit.id, med_new.id, med_old.id, low.id]);

        let capped = items.open_for_epic(5, 2).expect("capped");
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn done_is_terminal() {
        let store = store_with_epic(5);
        let items = ActionItemService::new(store.conn());
        let created = items.create(&item("Write runbook", Priority::Medium)).expect("create");
        let done = items.transition(created.id, ActionItemState::Done).expect("done");
        assert!(done.completed_at_us.is_some());
        assert!(matches!(
            items.transition(created.id, ActionItemState::InProgress),
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn list_pages_and_filters() {
        let store = store_with_epic(5);
        let items = ActionItemService::new(store.conn());
        for n in 0..5 {
            items.create(&item(&format!("item {n}"), Priority::Medium)).expect("create");
        }
        let page = items
            .list(&ActionItemFilter {
                epic_num: Some(5),
                state: Some(ActionItemState::Todo),
                limit: Some(2),
                offset: Some(2),
                ..ActionItemFilter::default()
            })
            .expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].summary, "item 2");
    }
}
