//! Seeded operation driver.
//!
//! Each step picks an operation from the current shadow model (sometimes an
//! illegal one on purpose), optionally arms a fault, runs it through a real
//! [`StateManager`] on a scratch git repository and hands the result to the
//! oracle.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use lockstep_core::config::{GitConfig, ProjectConfig};
use lockstep_core::model::{NewActionItem, NewLearning, StoryState};
use lockstep_core::vcs::GitRepo;
use lockstep_core::{StateError, StateManager};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::oracle::{self, InvariantViolation, Model, OracleResult};
use crate::rng::DeterministicRng;

const SIM_AUTHOR: &str = "lockstep-sim";
const SIM_EMAIL: &str = "sim@lockstep.invalid";

/// Per-step fault probabilities, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// The unit body writes a file, mutates the store, then errors.
    pub body_failure_percent: u8,
    /// A `pre-commit` hook rejects the commit.
    pub hook_failure_percent: u8,
    /// The unit runs with a deadline that has already passed.
    pub expired_deadline_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub steps: u32,
    pub max_epics: u32,
    pub max_stories_per_epic: u32,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 40,
            max_epics: 3,
            max_stories_per_epic: 4,
            fault: FaultConfig {
                body_failure_percent: 10,
                hook_failure_percent: 5,
                expired_deadline_percent: 5,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateEpic { epic_num: i64 },
    CreateStory { story_id: String, epic_num: i64 },
    Transition { story_id: String, target: StoryState },
    Complete { story_id: String, effort: u8 },
    RecordActionItem { summary: String },
    IndexLearning { topic: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    None,
    BodyFailure,
    HookRejection,
    ExpiredDeadline,
}

/// Whether a step committed, and the error code when it did not.
///
/// Revisions are left out so that two runs of one seed compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Committed,
    RolledBack { code: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: u32,
    pub operation: Operation,
    pub fault: Fault,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub commits: u32,
    pub rollbacks: u32,
    pub oracle: OracleResult,
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    // Declared before `_dir` so the store closes before the tree is removed.
    manager: StateManager,
    epics: BTreeSet<i64>,
    model: Model,
    _dir: TempDir,
}

impl Simulator {
    /// Create a scratch repository with an initialized store.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository or the store cannot be created.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let dir = TempDir::new().context("create simulation directory")?;
        let project = ProjectConfig {
            git: GitConfig {
                author_name: Some(SIM_AUTHOR.to_string()),
                author_email: Some(SIM_EMAIL.to_string()),
                ..GitConfig::default()
            },
            ..ProjectConfig::default()
        };
        GitRepo::init(dir.path(), &project.git)?;
        let manager = StateManager::init_with(dir.path(), project)?;
        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            config,
            manager,
            epics: BTreeSet::new(),
            model: Model::new(),
            _dir: dir,
        })
    }

    /// Run every step, checking the oracle after each.
    ///
    /// # Errors
    ///
    /// Returns an error only when the harness itself fails (git or the
    /// file system cannot be observed); invariant breaks are reported in
    /// the result.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(seed = self.config.seed, steps = self.config.steps, "simulation started");
        let mut trace = Vec::new();
        let mut commits = 0_u32;
        let mut rollbacks = 0_u32;
        let mut violations: Vec<InvariantViolation> = Vec::new();

        for step in 0..self.config.steps {
            let operation = self.next_operation();
            let fault = self.next_fault();
            let expected_ok = fault == Fault::None && self.is_legal(&operation);

            let before = oracle::snapshot(&self.manager)?;
            let result = self.execute(&operation, fault);
            let outcome = match &result {
                Ok(_) => {
                    commits += 1;
                    self.apply_to_model(&operation);
                    StepOutcome::Committed
                }
                Err(err) => {
                    rollbacks += 1;
                    StepOutcome::RolledBack {
                        code: err.root_cause().code().code().to_string(),
                    }
                }
            };
            debug!(step, ?operation, ?fault, ?outcome, "step finished");

            let observed = result.as_deref().map_err(|_| ());
            violations.extend(oracle::check_step(
                step,
                &self.manager,
                &before,
                expected_ok,
                observed,
                &self.model,
            )?);
            trace.push(TraceEvent {
                step,
                operation,
                fault,
                outcome,
            });
        }

        let oracle = OracleResult::from_violations(violations);
        info!(
            seed = self.config.seed,
            commits,
            rollbacks,
            passed = oracle.passed,
            "simulation finished"
        );
        Ok(SimulationResult {
            seed: self.config.seed,
            trace,
            commits,
            rollbacks,
            oracle,
        })
    }

    fn next_operation(&mut self) -> Operation {
        let roll = self.rng.below(100);
        let story_ids: Vec<String> = self.model.keys().cloned().collect();
        let max_epics = u64::from(self.config.max_epics.max(1));

        if roll < 15 || self.epics.is_empty() {
            // Repeats an existing number often enough to exercise duplicates.
            let epic_num = i64::try_from(self.rng.below(max_epics) + 1).unwrap_or(1);
            return Operation::CreateEpic { epic_num };
        }
        if roll < 45 || story_ids.is_empty() {
            // One past `max_epics` targets an epic that never exists.
            let epic_num = i64::try_from(self.rng.below(max_epics + 1) + 1).unwrap_or(1);
            let suffix = self.rng.below(u64::from(self.config.max_stories_per_epic.max(1))) + 1;
            return Operation::CreateStory {
                story_id: format!("{epic_num}.{suffix}"),
                epic_num,
            };
        }
        let story_id = self
            .rng
            .pick(&story_ids)
            .cloned()
            .unwrap_or_default();
        if roll < 75 {
            let target = self
                .rng
                .pick(StoryState::ALL)
                .copied()
                .unwrap_or(StoryState::InProgress);
            return Operation::Transition { story_id, target };
        }
        if roll < 88 {
            let effort = u8::try_from(self.rng.below(13)).unwrap_or_default();
            return Operation::Complete { story_id, effort };
        }
        let n = self.rng.below(1_000);
        if roll < 94 {
            Operation::RecordActionItem {
                summary: format!("Follow up {n}"),
            }
        } else {
            Operation::IndexLearning {
                topic: format!("topic-{n}"),
            }
        }
    }

    fn next_fault(&mut self) -> Fault {
        let fault = self.config.fault;
        if self.rng.chance(fault.body_failure_percent) {
            Fault::BodyFailure
        } else if cfg!(unix) && self.rng.chance(fault.hook_failure_percent) {
            Fault::HookRejection
        } else if self.rng.chance(fault.expired_deadline_percent) {
            Fault::ExpiredDeadline
        } else {
            Fault::None
        }
    }

    fn is_legal(&self, operation: &Operation) -> bool {
        match operation {
            Operation::CreateEpic { epic_num } => !self.epics.contains(epic_num),
            Operation::CreateStory { story_id, epic_num } => {
                self.epics.contains(epic_num) && !self.model.contains_key(story_id)
            }
            Operation::Transition { story_id, target } => self
                .model
                .get(story_id)
                .is_some_and(|state| state.can_transition_to(*target).is_ok()),
            Operation::Complete { story_id, .. } => matches!(
                self.model.get(story_id),
                Some(StoryState::InProgress | StoryState::Review)
            ),
            Operation::RecordActionItem { .. } | Operation::IndexLearning { .. } => true,
        }
    }

    fn apply_to_model(&mut self, operation: &Operation) {
        match operation {
            Operation::CreateEpic { epic_num } => {
                self.epics.insert(*epic_num);
            }
            Operation::CreateStory { story_id, .. } => {
                self.model.insert(story_id.clone(), StoryState::Todo);
            }
            Operation::Transition { story_id, target } => {
                self.model.insert(story_id.clone(), *target);
            }
            Operation::Complete { story_id, .. } => {
                self.model.insert(story_id.clone(), StoryState::Done);
            }
            Operation::RecordActionItem { .. } | Operation::IndexLearning { .. } => {}
        }
    }

    /// Run one operation under `fault`, returning the new revision.
    fn execute(&mut self, operation: &Operation, fault: Fault) -> Result<String, StateError> {
        match fault {
            Fault::None => self.perform(operation),
            Fault::BodyFailure => self.fail_inside_unit(operation),
            Fault::HookRejection => {
                let root = self.manager.repo().root().to_path_buf();
                install_rejecting_hook(&root).map_err(|err| StateError::Internal(err.to_string()))?;
                let result = self.perform(operation);
                remove_rejecting_hook(&root).map_err(|err| StateError::Internal(err.to_string()))?;
                result
            }
            Fault::ExpiredDeadline => {
                self.manager.set_deadline(Some(Instant::now()));
                let result = self.perform(operation);
                self.manager.set_deadline(None);
                result
            }
        }
    }

    fn perform(&mut self, operation: &Operation) -> Result<String, StateError> {
        let manager = &mut self.manager;
        let revision = match operation {
            Operation::CreateEpic { epic_num } => {
                manager
                    .create_epic(*epic_num, &format!("Epic {epic_num}"), "Simulated.\n")?
                    .revision
            }
            Operation::CreateStory { story_id, epic_num } => {
                manager
                    .create_story(story_id, *epic_num, &format!("Story {story_id}"), Some(3.0), "")?
                    .revision
            }
            Operation::Transition { story_id, target } => {
                manager.transition_story(story_id, *target)?.revision
            }
            Operation::Complete { story_id, effort } => {
                manager
                    .complete_story(story_id, f64::from(*effort))?
                    .revision
            }
            Operation::RecordActionItem { summary } => {
                manager
                    .record_action_item(&NewActionItem {
                        summary: summary.clone(),
                        ..NewActionItem::default()
                    })?
                    .revision
            }
            Operation::IndexLearning { topic } => {
                manager
                    .index_learning(&NewLearning {
                        topic: topic.clone(),
                        summary: "Observed during simulation".to_string(),
                        ..NewLearning::default()
                    })?
                    .revision
            }
        };
        Ok(revision)
    }

    /// Touch both sides inside a unit, then fail before it can commit.
    fn fail_inside_unit(&mut self, operation: &Operation) -> Result<String, StateError> {
        let label = format!("{operation:?}");
        self.manager
            .transactions()
            .run("Injected failure", |tx| {
                tx.write_file("notes/injected.md", &format!("{label}\n"))?;
                tx.coordinator().index_learning(&NewLearning {
                    topic: "injected".to_string(),
                    summary: label.clone(),
                    ..NewLearning::default()
                })?;
                Err::<(), _>(StateError::Internal("injected body failure".to_string()))
            })
            .map(|committed| committed.revision)
    }
}

#[cfg(unix)]
fn install_rejecting_hook(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let hooks = root.join(".git").join("hooks");
    fs::create_dir_all(&hooks)?;
    let path = hooks.join("pre-commit");
    fs::write(&path, "#!/bin/sh\nexit 1\n")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn install_rejecting_hook(_root: &Path) -> std::io::Result<()> {
    Ok(())
}

fn remove_rejecting_hook(root: &Path) -> std::io::Result<()> {
    let path = root.join(".git").join("hooks").join("pre-commit");
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
