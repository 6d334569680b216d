use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    ActionItemState, CeremonyKind, EpicState, LearningState, Priority, Relevance, StoryState,
};

/// Epic row. Aggregate fields are only ever written by the recompute step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub epic_num: i64,
    pub title: String,
    pub state: EpicState,
    pub total_stories: i64,
    pub completed_stories: i64,
    pub in_progress_stories: i64,
    pub progress_percent: f64,
    pub current_story: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub target_date: Option<NaiveDate>,
    pub completion_date: Option<NaiveDate>,
    /// Free-form extension map, stored as JSON.
    pub extension: Map<String, Value>,
    pub artifact_path: Option<String>,
    pub created_at_us: i64,
    pub updated_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub story_id: String,
    pub epic_num: i64,
    pub title: String,
    pub state: StoryState,
    pub assignee: Option<String>,
    pub estimate: Option<f64>,
    pub actual_effort: Option<f64>,
    pub artifact_path: Option<String>,
    pub created_at_us: i64,
    pub started_at_us: Option<i64>,
    pub completed_at_us: Option<i64>,
    pub updated_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: i64,
    pub summary: String,
    pub detail: Option<String>,
    pub assignee: Option<String>,
    pub state: ActionItemState,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub epic_num: Option<i64>,
    /// Document registry id of the artifact that produced this item.
    pub source_doc: Option<String>,
    pub created_at_us: i64,
    pub completed_at_us: Option<i64>,
    pub updated_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonySummary {
    pub id: i64,
    pub kind: CeremonyKind,
    pub epic_num: Option<i64>,
    pub held_on: NaiveDate,
    pub participants: Vec<String>,
    pub outcomes: Vec<String>,
    pub action_items_created: i64,
    pub transcript_path: Option<String>,
    pub created_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningEntry {
    pub id: i64,
    pub topic: String,
    pub summary: String,
    pub relevance: Relevance,
    pub contributor: Option<String>,
    pub epic_num: Option<i64>,
    pub source_doc: Option<String>,
    pub state: LearningState,
    pub superseded_by: Option<i64>,
    pub created_at_us: i64,
    pub updated_at_us: i64,
}

/// Caller input for recording an action item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewActionItem {
    pub summary: String,
    pub detail: Option<String>,
    pub assignee: Option<String>,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub epic_num: Option<i64>,
    pub source_doc: Option<String>,
}

/// Caller input for recording a ceremony summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCeremony {
    pub kind: CeremonyKind,
    pub epic_num: Option<i64>,
    pub held_on: NaiveDate,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub action_items_created: i64,
}

/// Caller input for indexing a learning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewLearning {
    pub topic: String,
    pub summary: String,
    pub relevance: Relevance,
    pub contributor: Option<String>,
    pub epic_num: Option<i64>,
    pub source_doc: Option<String>,
}
