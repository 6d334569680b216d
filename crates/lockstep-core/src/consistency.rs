//! Drift detection between the state store and the artifact tree, and the
//! repairs that bring them back together in one commit.

use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::artifact::{self, ArtifactKind, ArtifactLayout, Document, KEY_STATE, KEY_TITLE};
use crate::coordinator::StateCoordinator;
use crate::error::{Result, StateError};
use crate::model::{CeremonyKind, CeremonySummary, Epic, NewCeremony, Story, StoryState};
use crate::service::{
    CeremonyFilter, EpicAggregate, EpicFilter, MAX_PAGE_SIZE, NewStory, StoryFilter, paged,
};
use crate::tx::{Tx, TransactionManager};
use crate::vcs::GitRepo;

/// Store record an issue refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum RecordRef {
    Epic(i64),
    Story(String),
    Ceremony(i64),
}

/// Front-matter field compared against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    State,
}

/// One detected inconsistency.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyIssue {
    /// The record's artifact was deleted by a commit outside the API.
    FileDeletedManually { record: RecordRef, path: String },
    /// The record's artifact is missing and git never knew about the deletion.
    OrphanedRecord { record: RecordRef, path: String },
    /// A tracked file follows the path convention but has no record.
    UnregisteredFile { path: String },
    /// The tree has uncommitted changes. Never repaired automatically.
    UncommittedChanges { paths: Vec<String> },
    FieldMismatch {
        record: RecordRef,
        path: String,
        field: Field,
        store_value: String,
        file_value: String,
    },
    /// Stored epic aggregate differs from a recompute.
    AggregateDrift {
        epic_num: i64,
        stored: AggregateSnapshot,
        expected: AggregateSnapshot,
    },
}

impl ConsistencyIssue {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FileDeletedManually { .. } => "file_deleted_manually",
            Self::OrphanedRecord { .. } => "orphaned_record",
            Self::UnregisteredFile { .. } => "unregistered_file",
            Self::UncommittedChanges { .. } => "uncommitted_changes",
            Self::FieldMismatch { .. } => "field_mismatch",
            Self::AggregateDrift { .. } => "aggregate_drift",
        }
    }

    /// Application order inside one repair: register parents before
    /// children, drop children before parents, recompute last.
    const fn repair_rank(&self, layout_kind: Option<&ArtifactKind>) -> u8 {
        match self {
            Self::UnregisteredFile { .. } => match layout_kind {
                Some(ArtifactKind::Epic { .. }) => 0,
                _ => 1,
            },
            Self::FileDeletedManually { record, .. } | Self::OrphanedRecord { record, .. } => {
                match record {
                    RecordRef::Epic(_) => 3,
                    _ => 2,
                }
            }
            Self::FieldMismatch { .. } => 4,
            Self::AggregateDrift { .. } => 5,
            Self::UncommittedChanges { .. } => 6,
        }
    }
}

/// Aggregate values as reported in a drift issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub total_stories: i64,
    pub completed_stories: i64,
    pub in_progress_stories: i64,
    pub progress_percent: f64,
    pub current_story: Option<String>,
    pub state: String,
}

impl From<&Epic> for AggregateSnapshot {
    fn from(epic: &Epic) -> Self {
        Self {
            total_stories: epic.total_stories,
            completed_stories: epic.completed_stories,
            in_progress_stories: epic.in_progress_stories,
            progress_percent: epic.progress_percent,
            current_story: epic.current_story.clone(),
            state: epic.state.to_string(),
        }
    }
}

impl From<&EpicAggregate> for AggregateSnapshot {
    fn from(aggregate: &EpicAggregate) -> Self {
        Self {
            total_stories: aggregate.total_stories,
            completed_stories: aggregate.completed_stories,
            in_progress_stories: aggregate.in_progress_stories,
            progress_percent: aggregate.progress_percent,
            current_story: aggregate.current_story.clone(),
            state: aggregate.state.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.issues.iter().filter(|issue| issue.kind() == kind).count()
    }
}

/// Read-only comparison of the store against the tree.
pub struct ConsistencyChecker<'a> {
    repo: &'a GitRepo,
    coordinator: StateCoordinator<'a>,
    layout: &'a ArtifactLayout,
}

impl<'a> ConsistencyChecker<'a> {
    #[must_use]
    pub const fn new(
        repo: &'a GitRepo,
        coordinator: StateCoordinator<'a>,
        layout: &'a ArtifactLayout,
    ) -> Self {
        Self {
            repo,
            coordinator,
            layout,
        }
    }

    /// Run every check.
    ///
    /// # Errors
    ///
    /// Returns an error if git or the store cannot be queried.
    pub fn check(&self) -> Result<ConsistencyReport> {
        let mut issues = Vec::new();

        let dirty = self.repo.dirty_paths()?;
        if !dirty.is_empty() {
            issues.push(ConsistencyIssue::UncommittedChanges { paths: dirty });
        }

        let epics = all_epics(&self.coordinator)?;
        let stories = all_stories(&self.coordinator)?;
        let ceremonies = all_ceremonies(&self.coordinator)?;

        for epic in &epics {
            if let Some(path) = &epic.artifact_path {
                self.check_record(RecordRef::Epic(epic.epic_num), path, &mut issues, |doc, issues| {
                    compare(
                        RecordRef::Epic(epic.epic_num),
                        path,
                        Field::Title,
                        &epic.title,
                        doc.title(),
                        issues,
                    );
                })?;
            }
        }

        for story in &stories {
            if let Some(path) = &story.artifact_path {
                let record = RecordRef::Story(story.story_id.clone());
                self.check_record(record.clone(), path, &mut issues, |doc, issues| {
                    compare(record.clone(), path, Field::Title, &story.title, doc.title(), issues);
                    compare_state(record.clone(), path, story.state, doc.get_str(KEY_STATE), issues);
                })?;
            }
        }

        for ceremony in &ceremonies {
            if let Some(path) = &ceremony.transcript_path {
                self.check_record(RecordRef::Ceremony(ceremony.id), path, &mut issues, |_, _| {})?;
            }
        }

        let epic_keys: HashSet<i64> = epics.iter().map(|e| e.epic_num).collect();
        let story_keys: HashSet<&str> = stories.iter().map(|s| s.story_id.as_str()).collect();
        let transcripts: HashSet<&str> = ceremonies
            .iter()
            .filter_map(|c| c.transcript_path.as_deref())
            .collect();
        for path in self.repo.tracked_files()? {
            let registered = match self.layout.classify(&path) {
                None => true,
                Some(ArtifactKind::Epic { epic_num }) => epic_keys.contains(&epic_num),
                Some(ArtifactKind::Story { story_id, .. }) => story_keys.contains(story_id.as_str()),
                Some(ArtifactKind::Transcript { .. }) => transcripts.contains(path.as_str()),
            };
            if !registered && self.repo.root().join(&path).is_file() {
                issues.push(ConsistencyIssue::UnregisteredFile { path });
            }
        }

        for epic in &epics {
            let expected = self.coordinator.compute_aggregate(epic.epic_num)?;
            if !expected.matches(epic) {
                issues.push(ConsistencyIssue::AggregateDrift {
                    epic_num: epic.epic_num,
                    stored: AggregateSnapshot::from(epic),
                    expected: AggregateSnapshot::from(&expected),
                });
            }
        }

        info!(issues = issues.len(), "consistency check finished");
        Ok(ConsistencyReport { issues })
    }

    fn check_record(
        &self,
        record: RecordRef,
        path: &str,
        issues: &mut Vec<ConsistencyIssue>,
        compare_fields: impl FnOnce(&Document, &mut Vec<ConsistencyIssue>),
    ) -> Result<()> {
        let full = artifact::resolve(self.repo.root(), path)?;
        if !full.is_file() {
            let path = path.to_string();
            let issue = if self.repo.was_deleted_in_history(Path::new(&path))? {
                ConsistencyIssue::FileDeletedManually { record, path }
            } else {
                ConsistencyIssue::OrphanedRecord { record, path }
            };
            issues.push(issue);
            return Ok(());
        }

        let text = std::fs::read_to_string(&full).map_err(|err| StateError::io(&full, err))?;
        match Document::parse(&text) {
            Ok(doc) => compare_fields(&doc, issues),
            Err(err) => warn!(path, %err, "skipping field comparison for unreadable front matter"),
        }
        Ok(())
    }
}

fn compare(
    record: RecordRef,
    path: &str,
    field: Field,
    store_value: &str,
    file_value: Option<String>,
    issues: &mut Vec<ConsistencyIssue>,
) {
    if let Some(file_value) = file_value {
        if file_value.trim() != store_value {
            issues.push(ConsistencyIssue::FieldMismatch {
                record,
                path: path.to_string(),
                field,
                store_value: store_value.to_string(),
                file_value,
            });
        }
    }
}

/// States compare by their parsed value, so `in-progress` in a file matches
/// `in_progress` in the store. Unknown values are still reported.
pub(crate) fn compare_state(
    record: RecordRef,
    path: &str,
    store_state: StoryState,
    file_value: Option<String>,
    issues: &mut Vec<ConsistencyIssue>,
) {
    let Some(file_value) = file_value else {
        return;
    };
    if file_value.parse::<StoryState>().ok() == Some(store_state) {
        return;
    }
    issues.push(ConsistencyIssue::FieldMismatch {
        record,
        path: path.to_string(),
        field: Field::State,
        store_value: store_state.as_str().to_string(),
        file_value,
    });
}

pub(crate) fn all_epics(coordinator: &StateCoordinator<'_>) -> Result<Vec<Epic>> {
    paged(|offset| {
        coordinator.epics().list(&EpicFilter {
            limit: Some(MAX_PAGE_SIZE),
            offset: Some(offset),
            ..EpicFilter::default()
        })
    })
}

fn all_stories(coordinator: &StateCoordinator<'_>) -> Result<Vec<Story>> {
    paged(|offset| {
        coordinator.stories().list(&StoryFilter {
            limit: Some(MAX_PAGE_SIZE),
            offset: Some(offset),
            ..StoryFilter::default()
        })
    })
}

fn all_ceremonies(coordinator: &StateCoordinator<'_>) -> Result<Vec<CeremonySummary>> {
    paged(|offset| {
        coordinator.ceremonies().list(&CeremonyFilter {
            limit: Some(MAX_PAGE_SIZE),
            offset: Some(offset),
            ..CeremonyFilter::default()
        })
    })
}

/// Per-issue choice in interactive repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The artifact tree is authoritative.
    FileWins,
    /// The store is authoritative; artifacts are rewritten to match.
    StoreWins,
    Skip,
}

/// How [`Repairer::repair`] resolves each issue.
pub enum RepairMode<'d> {
    /// Non-interactive: the tree wins every conflict.
    FileWins,
    /// A caller-supplied decider picks a resolution per issue.
    Interactive(&'d mut dyn FnMut(&ConsistencyIssue) -> Resolution),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairOutcome {
    pub applied: Vec<ConsistencyIssue>,
    pub skipped: Vec<ConsistencyIssue>,
    /// Revision of the repair commit; `None` when nothing was applied.
    pub revision: Option<String>,
}

/// Applies resolutions for a report inside one transaction.
pub struct Repairer {
    layout: ArtifactLayout,
}

impl Repairer {
    #[must_use]
    pub const fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// Resolve every repairable issue of `report` in one commit.
    ///
    /// # Errors
    ///
    /// [`StateError::DirtyWorkingTree`] when the report carries uncommitted
    /// changes, or [`StateError::TransactionFailed`] if applying fails (in
    /// which case nothing was changed).
    pub fn repair(
        &self,
        tm: &mut TransactionManager,
        report: &ConsistencyReport,
        mode: RepairMode<'_>,
    ) -> Result<RepairOutcome> {
        if let Some(ConsistencyIssue::UncommittedChanges { paths }) = report
            .issues
            .iter()
            .find(|issue| matches!(issue, ConsistencyIssue::UncommittedChanges { .. }))
        {
            return Err(StateError::DirtyWorkingTree {
                paths: paths.clone(),
            });
        }

        let mut plan: Vec<(ConsistencyIssue, Resolution)> = Vec::new();
        let mut outcome = RepairOutcome::default();
        let mut mode = mode;
        for issue in &report.issues {
            let resolution = match &mut mode {
                RepairMode::FileWins => Resolution::FileWins,
                RepairMode::Interactive(decide) => decide(issue),
            };
            if resolution == Resolution::Skip {
                outcome.skipped.push(issue.clone());
            } else if resolution == Resolution::FileWins && !file_value_applies(issue) {
                warn!(issue = ?issue, "artifact value is not a valid state; leaving the issue unrepaired");
                outcome.skipped.push(issue.clone());
            } else {
                plan.push((issue.clone(), resolution));
            }
        }
        if plan.is_empty() {
            return Ok(outcome);
        }
        plan.sort_by_key(|(issue, _)| {
            let kind = match issue {
                ConsistencyIssue::UnregisteredFile { path } => self.layout.classify(path),
                _ => None,
            };
            issue.repair_rank(kind.as_ref())
        });

        let message = format!("Repair {} consistency issue(s)", plan.len());
        let layout = &self.layout;
        let committed = tm.run(&message, |tx| {
            for (issue, resolution) in &plan {
                apply(tx, layout, issue, *resolution)?;
            }
            Ok(())
        })?;

        info!(revision = %committed.revision, applied = plan.len(), "repair committed");
        outcome.applied = plan.into_iter().map(|(issue, _)| issue).collect();
        outcome.revision = Some(committed.revision);
        Ok(outcome)
    }
}

/// Whether a file-wins resolution can write the artifact's value into the store.
fn file_value_applies(issue: &ConsistencyIssue) -> bool {
    match issue {
        ConsistencyIssue::FieldMismatch {
            field: Field::State,
            file_value,
            ..
        } => file_value.parse::<StoryState>().is_ok(),
        _ => true,
    }
}

fn apply(tx: &mut Tx<'_>, layout: &ArtifactLayout, issue: &ConsistencyIssue, resolution: Resolution) -> Result<()> {
    let coordinator = tx.coordinator();
    match (issue, resolution) {
        (
            ConsistencyIssue::FileDeletedManually { record, path }
            | ConsistencyIssue::OrphanedRecord { record, path },
            Resolution::FileWins,
        ) => drop_record(&coordinator, record, path),
        (
            ConsistencyIssue::FileDeletedManually { record, path }
            | ConsistencyIssue::OrphanedRecord { record, path },
            Resolution::StoreWins,
        ) => restore_artifact(tx, record, path),
        (ConsistencyIssue::UnregisteredFile { path }, Resolution::FileWins) => {
            register(tx, layout, path)
        }
        (ConsistencyIssue::UnregisteredFile { path }, Resolution::StoreWins) => {
            warn!(path, "deleting artifact without a store record");
            tx.delete_file(path)
        }
        (
            ConsistencyIssue::FieldMismatch {
                record,
                field,
                file_value,
                ..
            },
            Resolution::FileWins,
        ) => overwrite_store_field(&coordinator, record, *field, file_value),
        (
            ConsistencyIssue::FieldMismatch {
                path,
                field,
                store_value,
                ..
            },
            Resolution::StoreWins,
        ) => rewrite_front_matter(tx, path, *field, store_value),
        (ConsistencyIssue::AggregateDrift { epic_num, .. }, _) => {
            if coordinator.epics().exists(*epic_num)? {
                coordinator.recompute_epic(*epic_num)?;
            }
            Ok(())
        }
        (ConsistencyIssue::UncommittedChanges { .. }, _) | (_, Resolution::Skip) => Ok(()),
    }
}

fn drop_record(coordinator: &StateCoordinator<'_>, record: &RecordRef, path: &str) -> Result<()> {
    match record {
        RecordRef::Story(story_id) => {
            warn!(story_id, path, "deleting story record whose artifact is gone");
            coordinator.delete_story(story_id)?;
        }
        RecordRef::Ceremony(id) => {
            warn!(id, path, "deleting ceremony record whose transcript is gone");
            coordinator.ceremonies().delete(*id)?;
        }
        RecordRef::Epic(epic_num) => {
            let remaining = coordinator.stories().breakdown(*epic_num)?.total();
            if remaining > 0 {
                // Story artifacts still name this epic; keep the row.
                warn!(epic_num, path, remaining, "clearing artifact path of epic with live stories");
                coordinator.epics().set_artifact_path(*epic_num, None)?;
            } else {
                warn!(epic_num, path, "deleting epic record whose artifact is gone");
                coordinator.epics().purge(*epic_num)?;
            }
        }
    }
    Ok(())
}

fn restore_artifact(tx: &mut Tx<'_>, record: &RecordRef, path: &str) -> Result<()> {
    let coordinator = tx.coordinator();
    let content = match record {
        RecordRef::Epic(epic_num) => {
            let epic = coordinator.epics().require(*epic_num)?;
            artifact::epic_document(epic.epic_num, &epic.title, "")?
        }
        RecordRef::Story(story_id) => {
            let story = coordinator.stories().require(story_id)?;
            artifact::story_document(&story.story_id, story.epic_num, &story.title, story.state, "")?
        }
        RecordRef::Ceremony(id) => {
            warn!(id, path, "transcript content cannot be rebuilt from the store; skipping");
            return Ok(());
        }
    };
    tx.write_file(path, &content)
}

fn register(tx: &mut Tx<'_>, layout: &ArtifactLayout, path: &str) -> Result<()> {
    let Some(kind) = layout.classify(path) else {
        return Ok(());
    };
    let text = tx.read_file(path)?.unwrap_or_default();
    let doc = Document::parse(&text).unwrap_or_else(|err| {
        warn!(path, %err, "front matter unreadable; inferring from body only");
        Document {
            body: text.clone(),
            ..Document::default()
        }
    });
    let coordinator = tx.coordinator();

    match kind {
        ArtifactKind::Epic { epic_num } => {
            let title = infer_title(&doc).unwrap_or_else(|| format!("Epic {epic_num}"));
            info!(epic_num, path, "registering epic from artifact");
            coordinator.create_epic(epic_num, &title, Some(path))?;
        }
        ArtifactKind::Story { epic_num, story_id } => {
            if !coordinator.epics().exists(epic_num)? {
                info!(epic_num, "registering placeholder epic for unregistered story");
                coordinator.create_epic(epic_num, &format!("Epic {epic_num}"), None)?;
            }
            let title = infer_title(&doc).unwrap_or_else(|| story_id.clone());
            info!(story_id, path, "registering story from artifact");
            coordinator.create_story(
                &NewStory {
                    story_id: story_id.clone(),
                    epic_num,
                    title,
                    ..NewStory::default()
                },
                Some(path),
            )?;
            if let Some(state) = doc.story_state().filter(|s| *s != StoryState::Todo) {
                coordinator.stories().force_state(&story_id, state)?;
                coordinator.recompute_epic(epic_num)?;
            }
        }
        ArtifactKind::Transcript { epic_num } => {
            let (kind, held_on) = transcript_identity(path)?;
            if let Some(epic_num) = epic_num {
                if !coordinator.epics().exists(epic_num)? {
                    coordinator.create_epic(epic_num, &format!("Epic {epic_num}"), None)?;
                }
            }
            info!(path, "registering ceremony from transcript");
            coordinator.record_ceremony(
                &NewCeremony {
                    kind,
                    epic_num,
                    held_on,
                    participants: Vec::new(),
                    outcomes: Vec::new(),
                    action_items_created: 0,
                },
                Some(path),
            )?;
        }
    }
    Ok(())
}

fn transcript_identity(path: &str) -> Result<(CeremonyKind, chrono::NaiveDate)> {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    for kind in CeremonyKind::ALL {
        if let Some(rest) = stem.strip_prefix(&format!("{}-", kind.as_str())) {
            if let Some(date) = rest
                .get(..10)
                .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            {
                return Ok((*kind, date));
            }
        }
    }
    Err(StateError::Validation(format!(
        "cannot infer ceremony kind and date from {path}"
    )))
}

/// Title from front matter, else the first Markdown heading.
fn infer_title(doc: &Document) -> Option<String> {
    doc.title().or_else(|| {
        doc.body
            .lines()
            .find_map(|line| line.strip_prefix("# "))
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
    })
}

fn overwrite_store_field(
    coordinator: &StateCoordinator<'_>,
    record: &RecordRef,
    field: Field,
    file_value: &str,
) -> Result<()> {
    warn!(?record, ?field, value = file_value, "overwriting store field from artifact");
    match (record, field) {
        (RecordRef::Epic(epic_num), Field::Title) => coordinator.epics().force_title(*epic_num, file_value),
        (RecordRef::Story(story_id), Field::Title) => {
            coordinator.stories().force_title(story_id, file_value)
        }
        (RecordRef::Story(story_id), Field::State) => {
            let state: StoryState = file_value.parse()?;
            let story = coordinator.stories().force_state(story_id, state)?;
            coordinator.recompute_epic(story.epic_num)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn rewrite_front_matter(tx: &mut Tx<'_>, path: &str, field: Field, store_value: &str) -> Result<()> {
    let Some(text) = tx.read_file(path)? else {
        return Ok(());
    };
    let mut doc = Document::parse(&text)?;
    let key = match field {
        Field::Title => KEY_TITLE,
        Field::State => KEY_STATE,
    };
    doc.set_str(key, store_value);
    tx.write_file(path, &doc.render()?)
}
