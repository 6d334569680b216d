//! Canonical SQLite schema for the state store.
//!
//! Five entity tables keyed the way callers address them:
//! - `epics` and `stories` use natural keys (epic number, story id)
//! - `action_items`, `ceremony_summaries` and `learning_index` use
//!   store-assigned integer ids
//! - `store_meta` is a single row recording schema version and the last
//!   applied migration phase

/// Migration v1: entity tables plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS epics (
    epic_num INTEGER PRIMARY KEY CHECK (epic_num > 0),
    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
    state TEXT NOT NULL DEFAULT 'planning'
        CHECK (state IN ('planning', 'active', 'complete', 'archived')),
    total_stories INTEGER NOT NULL DEFAULT 0 CHECK (total_stories >= 0),
    completed_stories INTEGER NOT NULL DEFAULT 0 CHECK (completed_stories >= 0),
    in_progress_stories INTEGER NOT NULL DEFAULT 0 CHECK (in_progress_stories >= 0),
    progress_percent REAL NOT NULL DEFAULT 0,
    current_story TEXT,
    start_date TEXT,
    target_date TEXT,
    completion_date TEXT,
    extension_json TEXT NOT NULL DEFAULT '{}',
    artifact_path TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (completed_stories + in_progress_stories <= total_stories)
);

CREATE TABLE IF NOT EXISTS stories (
    story_id TEXT PRIMARY KEY CHECK (length(trim(story_id)) > 0),
    epic_num INTEGER NOT NULL REFERENCES epics(epic_num) ON DELETE CASCADE,
    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
    state TEXT NOT NULL DEFAULT 'todo'
        CHECK (state IN ('todo', 'in_progress', 'review', 'done')),
    assignee TEXT,
    estimate REAL CHECK (estimate IS NULL OR estimate >= 0),
    actual_effort REAL CHECK (actual_effort IS NULL OR actual_effort >= 0),
    artifact_path TEXT,
    created_at_us INTEGER NOT NULL,
    started_at_us INTEGER,
    completed_at_us INTEGER,
    updated_at_us INTEGER NOT NULL,
    CHECK (completed_at_us IS NULL OR state = 'done'),
    CHECK (state = 'todo' OR started_at_us IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS action_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    summary TEXT NOT NULL CHECK (length(trim(summary)) > 0),
    detail TEXT,
    assignee TEXT,
    state TEXT NOT NULL DEFAULT 'todo' CHECK (state IN ('todo', 'in_progress', 'done')),
    priority TEXT NOT NULL DEFAULT 'medium'
        CHECK (priority IN ('low', 'medium', 'high', 'critical')),
    due_date TEXT,
    epic_num INTEGER REFERENCES epics(epic_num) ON DELETE SET NULL,
    source_doc TEXT,
    created_at_us INTEGER NOT NULL,
    completed_at_us INTEGER,
    updated_at_us INTEGER NOT NULL,
    CHECK (completed_at_us IS NULL OR state = 'done')
);

CREATE TABLE IF NOT EXISTS ceremony_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL CHECK (kind IN ('standup', 'retrospective', 'planning', 'review')),
    epic_num INTEGER REFERENCES epics(epic_num) ON DELETE SET NULL,
    held_on TEXT NOT NULL,
    participants_json TEXT NOT NULL DEFAULT '[]',
    outcomes_json TEXT NOT NULL DEFAULT '[]',
    action_items_created INTEGER NOT NULL DEFAULT 0 CHECK (action_items_created >= 0),
    transcript_path TEXT,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS learning_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL CHECK (length(trim(topic)) > 0),
    summary TEXT NOT NULL CHECK (length(trim(summary)) > 0),
    relevance TEXT NOT NULL DEFAULT 'medium' CHECK (relevance IN ('low', 'medium', 'high')),
    contributor TEXT,
    epic_num INTEGER REFERENCES epics(epic_num) ON DELETE SET NULL,
    source_doc TEXT,
    state TEXT NOT NULL DEFAULT 'active' CHECK (state IN ('active', 'obsolete')),
    superseded_by INTEGER REFERENCES learning_index(id) ON DELETE SET NULL,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (superseded_by IS NULL OR state = 'obsolete'),
    CHECK (superseded_by IS NULL OR superseded_by <> id)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    migration_phase INTEGER NOT NULL DEFAULT 0,
    migration_revision TEXT,
    updated_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (
    id,
    schema_version,
    migration_phase,
    migration_revision,
    updated_at_us
) VALUES (1, 1, 0, NULL, 0);
";

/// Migration v2: read-path indexes for the fast context query and the
/// consistency checker's path lookups.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_stories_epic_state
    ON stories(epic_num, state, story_id);

CREATE INDEX IF NOT EXISTS idx_stories_artifact
    ON stories(artifact_path);

CREATE INDEX IF NOT EXISTS idx_epics_state
    ON epics(state);

CREATE INDEX IF NOT EXISTS idx_action_items_epic_state_created
    ON action_items(epic_num, state, created_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_ceremonies_epic_held
    ON ceremony_summaries(epic_num, held_on DESC);

CREATE INDEX IF NOT EXISTS idx_learning_epic_state_created
    ON learning_index(epic_num, state, created_at_us DESC);

UPDATE store_meta
SET schema_version = 2
WHERE id = 1;
";

/// Entity tables created by the schema.
pub const ENTITY_TABLES: &[&str] = &[
    "epics",
    "stories",
    "action_items",
    "ceremony_summaries",
    "learning_index",
];

/// Indexes expected by the context and consistency query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_stories_epic_state",
    "idx_stories_artifact",
    "idx_epics_state",
    "idx_action_items_epic_state_created",
    "idx_ceremonies_epic_held",
    "idx_learning_epic_state_created",
];
