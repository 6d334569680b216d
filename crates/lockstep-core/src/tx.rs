//! Transaction manager: one git commit per unit of work across the artifact
//! tree and the state store.
//!
//! Each unit walks an explicit state machine:
//!
//! ```text
//! Idle -> StoreTxBegun -> FilesWritten -> StoreTxCommitted -> VcsCommitted
//!            \______________\__________________\_____________-> RollingBack -> Idle
//! ```
//!
//! File writes go through [`Tx::write_file`] / [`Tx::delete_file`], which
//! record an inverse action before touching disk. On any failure the store
//! transaction is rolled back, the store connection is closed, the undo log
//! is replayed in reverse, the tree is hard-reset to `HEAD` and the store is
//! reopened. The tree therefore either gains exactly one revision or ends
//! up byte-identical to where it started.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::artifact;
use crate::config::{ContextConfig, ProjectConfig};
use crate::coordinator::StateCoordinator;
use crate::db::{self, StateStore};
use crate::error::{Result, StateError};
use crate::lock::{WRITER_LOCK_FILE, WriterLock};
use crate::vcs::GitRepo;

/// Marker line of the ignore block written at bootstrap.
pub const GITIGNORE_MARKER: &str = "# lockstep: SQLite sidecar files";

/// Protocol phase of the unit currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    StoreTxBegun,
    FilesWritten,
    StoreTxCommitted,
    VcsCommitted,
    RollingBack,
}

impl TxPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::StoreTxBegun => "store_tx_begun",
            Self::FilesWritten => "files_written",
            Self::StoreTxCommitted => "store_tx_committed",
            Self::VcsCommitted => "vcs_committed",
            Self::RollingBack => "rolling_back",
        }
    }
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a committed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    /// Full id of the revision the unit produced.
    pub revision: String,
}

#[derive(Debug)]
enum UndoAction {
    /// Put back the bytes a file held before the unit touched it.
    Restore { path: PathBuf, content: Vec<u8> },
    /// Remove a file the unit created.
    Remove { path: PathBuf },
    /// Remove a directory the unit created, if it is empty again.
    RemoveDir { path: PathBuf },
}

impl UndoAction {
    fn apply(&self) -> std::io::Result<()> {
        match self {
            Self::Restore { path, content } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, content)
            }
            Self::Remove { path } => match fs::remove_file(path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
            Self::RemoveDir { path } => {
                // Non-empty means something else lives there now; leave it.
                let _ = fs::remove_dir(path);
                Ok(())
            }
        }
    }
}

/// Undo log shared by units and bootstrap.
#[derive(Debug, Default)]
struct UndoLog {
    actions: Vec<UndoAction>,
}

impl UndoLog {
    /// Record how to revert creating or overwriting `path`, including any
    /// parent directories that do not exist yet.
    fn record_write(&mut self, root: &Path, path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || current.exists() {
                break;
            }
            missing.push(current.to_path_buf());
            dir = current.parent();
        }
        for created in missing.into_iter().rev() {
            self.actions.push(UndoAction::RemoveDir { path: created });
        }

        if path.exists() {
            let content = fs::read(path).map_err(|err| StateError::io(path, err))?;
            self.actions.push(UndoAction::Restore {
                path: path.to_path_buf(),
                content,
            });
        } else {
            self.actions.push(UndoAction::Remove {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Replay inverse actions newest-first. Keeps going past failures and
    /// reports the first one.
    fn replay(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(action) = self.actions.pop() {
            if let Err(err) = action.apply() {
                error!(?action, %err, "undo action failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(StateError::Internal(format!("undo log replay failed: {err}"))),
            None => Ok(()),
        }
    }

    fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Handle passed to a unit body: guarded file I/O plus the open store.
pub struct Tx<'m> {
    root: &'m Path,
    store: &'m StateStore,
    store_rel: &'m Path,
    limits: &'m ContextConfig,
    undo: UndoLog,
    touched: Vec<String>,
}

impl<'m> Tx<'m> {
    #[must_use]
    pub const fn store(&self) -> &'m StateStore {
        self.store
    }

    #[must_use]
    pub fn coordinator(&self) -> StateCoordinator<'m> {
        StateCoordinator::new(self.store.conn(), self.limits.clone())
    }

    #[must_use]
    pub const fn root(&self) -> &'m Path {
        self.root
    }

    /// Paths written or deleted so far, in order.
    #[must_use]
    pub fn touched(&self) -> &[String] {
        &self.touched
    }

    /// Create or overwrite `rel` with `content`.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] for a path outside the artifact tree (absolute,
    /// `..`, inside `.git`, or the store file), or an I/O error.
    pub fn write_file(&mut self, rel: &str, content: &str) -> Result<()> {
        let path = self.guard(rel)?;
        self.undo.record_write(self.root, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StateError::io(parent, err))?;
        }
        fs::write(&path, content).map_err(|err| StateError::io(&path, err))?;
        debug!(path = rel, bytes = content.len(), "artifact written");
        self.touched.push(rel.to_string());
        Ok(())
    }

    /// Delete `rel`.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the file does not exist, plus the path
    /// checks of [`Tx::write_file`].
    pub fn delete_file(&mut self, rel: &str) -> Result<()> {
        let path = self.guard(rel)?;
        if !path.is_file() {
            return Err(StateError::not_found("artifact", rel));
        }
        let content = fs::read(&path).map_err(|err| StateError::io(&path, err))?;
        self.undo.actions.push(UndoAction::Restore {
            path: path.clone(),
            content,
        });
        fs::remove_file(&path).map_err(|err| StateError::io(&path, err))?;
        debug!(path = rel, "artifact deleted");
        self.touched.push(rel.to_string());
        Ok(())
    }

    /// Read `rel` if it exists.
    ///
    /// # Errors
    ///
    /// Path checks of [`Tx::write_file`], or an I/O error other than absence.
    pub fn read_file(&self, rel: &str) -> Result<Option<String>> {
        let path = self.guard(rel)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StateError::io(&path, err)),
        }
    }

    fn guard(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        artifact::validate_relative(rel_path)?;
        if matches!(rel_path.components().next(), Some(Component::Normal(first)) if first == ".git")
        {
            return Err(StateError::Validation(format!(
                "refusing to touch git metadata: {rel}"
            )));
        }
        let protected = std::iter::once(self.store_rel.to_path_buf())
            .chain(db::sidecar_paths(self.store_rel));
        for store_file in protected {
            if rel_path == store_file {
                return Err(StateError::Validation(format!(
                    "the state store is written through the store only: {rel}"
                )));
            }
        }
        Ok(self.root.join(rel_path))
    }
}

/// Runs units of work against one working tree and its state store.
pub struct TransactionManager {
    repo: GitRepo,
    store: Option<StateStore>,
    store_rel: PathBuf,
    config: ProjectConfig,
    lock_path: PathBuf,
    deadline: Option<Instant>,
    phase: TxPhase,
}

impl TransactionManager {
    /// Attach to a working tree. The store is opened when it exists; call
    /// [`TransactionManager::bootstrap`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if git cannot resolve the repository or the store
    /// fails to open.
    pub fn open(repo: GitRepo, config: ProjectConfig) -> Result<Self> {
        let lock_path = repo.git_dir()?.join(WRITER_LOCK_FILE);
        let store_rel = config.store.path.clone();
        let store_path = repo.root().join(&store_rel);
        let store = if store_path.exists() {
            Some(StateStore::open(&store_path, config.store.busy_timeout())?)
        } else {
            None
        };
        Ok(Self {
            repo,
            store,
            store_rel,
            config,
            lock_path,
            deadline: None,
            phase: TxPhase::Idle,
        })
    }

    #[must_use]
    pub const fn repo(&self) -> &GitRepo {
        &self.repo
    }

    #[must_use]
    pub const fn config(&self) -> &ProjectConfig {
        &self.config
    }

    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.repo.root().join(&self.store_rel)
    }

    #[must_use]
    pub fn store_rel(&self) -> &Path {
        &self.store_rel
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.store.is_some()
    }

    /// Phase of the unit in flight; `Idle` between units.
    #[must_use]
    pub const fn phase(&self) -> TxPhase {
        self.phase
    }

    /// Borrow the store outside a unit, for reads.
    ///
    /// # Errors
    ///
    /// [`StateError::NotInitialized`] before bootstrap.
    pub fn store(&self) -> Result<&StateStore> {
        self.store
            .as_ref()
            .ok_or_else(|| StateError::NotInitialized(self.store_path()))
    }

    /// Read-only coordinator over the writer connection.
    ///
    /// # Errors
    ///
    /// [`StateError::NotInitialized`] before bootstrap.
    pub fn coordinator(&self) -> Result<StateCoordinator<'_>> {
        Ok(StateCoordinator::new(
            self.store()?.conn(),
            self.config.context.clone(),
        ))
    }

    /// Deadline applied to subsequent units until cleared.
    pub const fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Close the store connection and open the file again.
    ///
    /// Needed after the file was replaced underneath the connection, for
    /// example by a branch checkout.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reopened.
    pub fn reload_store(&mut self) -> Result<()> {
        if let Some(store) = self.store.take() {
            store.close()?;
        }
        let path = self.store_path();
        if path.exists() {
            self.store = Some(StateStore::open(&path, self.config.store.busy_timeout())?);
        }
        Ok(())
    }

    /// Close the store connection without reopening it.
    ///
    /// The last connection to close removes the WAL sidecars, so a branch
    /// switch that drops the store file leaves nothing untracked behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or close fails.
    pub fn release_store(&mut self) -> Result<()> {
        if let Some(store) = self.store.take() {
            store.checkpoint()?;
            store.close()?;
        }
        Ok(())
    }

    /// Create the store and the ignore rules for its sidecar files as one
    /// commit. `phase` is recorded in the store metadata when given.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyExists`] when the store exists,
    /// [`StateError::DirtyWorkingTree`] on a dirty tree, or
    /// [`StateError::TransactionFailed`] after a rollback.
    pub fn bootstrap(&mut self, message: &str, phase: Option<u32>) -> Result<String> {
        let _lock = WriterLock::acquire(&self.lock_path, self.config.store.lock_timeout())?;
        let store_path = self.store_path();
        if self.store.is_some() || store_path.exists() {
            return Err(StateError::already_exists(
                "state store",
                store_path.display(),
            ));
        }
        self.require_clean()?;

        let mut undo = UndoLog::default();
        let result = self.bootstrap_inner(message, phase, &store_path, &mut undo);
        match result {
            Ok(revision) => {
                info!(%revision, store = %store_path.display(), "state store bootstrapped");
                Ok(revision)
            }
            Err(cause) => {
                warn!(%cause, "bootstrap failed; rolling back");
                if let Some(store) = self.store.take() {
                    if let Err(err) = store.close() {
                        error!(%err, "closing store during rollback failed");
                    }
                }
                for sidecar in db::sidecar_paths(&store_path) {
                    undo.actions.push(UndoAction::Remove { path: sidecar });
                }
                if let Err(err) = undo.replay() {
                    error!(%err, "bootstrap undo failed");
                }
                if let Err(err) = self.reset_to_head() {
                    error!(%err, "bootstrap reset failed");
                }
                Err(StateError::TransactionFailed {
                    operation: message.to_string(),
                    source: Box::new(cause),
                })
            }
        }
    }

    fn bootstrap_inner(
        &mut self,
        message: &str,
        phase: Option<u32>,
        store_path: &Path,
        undo: &mut UndoLog,
    ) -> Result<String> {
        let root = self.repo.root().to_path_buf();
        let gitignore = root.join(".gitignore");
        let existing = match fs::read_to_string(&gitignore) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(StateError::io(&gitignore, err)),
        };
        if !existing.lines().any(|line| line == GITIGNORE_MARKER) {
            undo.record_write(&root, &gitignore)?;
            let mut text = existing;
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&gitignore_block(&self.store_rel));
            fs::write(&gitignore, text).map_err(|err| StateError::io(&gitignore, err))?;
        }

        undo.record_write(&root, store_path)?;
        let store = StateStore::open(store_path, self.config.store.busy_timeout())?;
        if let Some(phase) = phase {
            store.set_migration_phase(phase, None)?;
        }
        store.checkpoint()?;
        self.store = Some(store);

        self.check_deadline("bootstrap commit")?;
        self.repo.stage_all()?;
        Ok(self.repo.commit(message, false)?)
    }

    /// Run `body` as one unit and commit it with `message`.
    ///
    /// The body may write files through the [`Tx`] and mutate the store
    /// through its coordinator. Returning `Err` from the body rolls back
    /// everything it did.
    ///
    /// # Errors
    ///
    /// Fails without side effects on lock contention, a dirty tree or a
    /// missing store. Any failure after the store transaction began is
    /// returned as [`StateError::TransactionFailed`] after a full rollback.
    pub fn run<T>(
        &mut self,
        message: &str,
        body: impl FnOnce(&mut Tx<'_>) -> Result<T>,
    ) -> Result<Committed<T>> {
        let _lock = WriterLock::acquire(&self.lock_path, self.config.store.lock_timeout())?;
        if self.store.is_none() {
            return Err(StateError::NotInitialized(self.store_path()));
        }
        self.require_clean()?;

        let mut undo = UndoLog::default();
        let outcome = self.execute(message, body, &mut undo);
        match outcome {
            Ok(committed) => {
                self.set_phase(TxPhase::Idle);
                Ok(committed)
            }
            Err(cause) => {
                let failed_in = self.phase;
                self.set_phase(TxPhase::RollingBack);
                warn!(operation = message, phase = %failed_in, %cause, "unit failed; rolling back");
                if let Err(err) = self.roll_back(&mut undo) {
                    error!(operation = message, %err, "rollback incomplete");
                }
                self.set_phase(TxPhase::Idle);
                Err(StateError::TransactionFailed {
                    operation: message.to_string(),
                    source: Box::new(cause),
                })
            }
        }
    }

    fn execute<T>(
        &mut self,
        message: &str,
        body: impl FnOnce(&mut Tx<'_>) -> Result<T>,
        undo: &mut UndoLog,
    ) -> Result<Committed<T>> {
        self.check_deadline("begin")?;
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StateError::NotInitialized(self.repo.root().join(&self.store_rel)))?;
        store.begin()?;
        self.phase = TxPhase::StoreTxBegun;
        debug!(operation = message, phase = %self.phase, "unit started");

        let mut tx = Tx {
            root: self.repo.root(),
            store,
            store_rel: &self.store_rel,
            limits: &self.config.context,
            undo: UndoLog::default(),
            touched: Vec::new(),
        };
        let result = body(&mut tx);
        let Tx {
            undo: body_undo,
            touched,
            ..
        } = tx;
        undo.actions.extend(body_undo.actions);
        let value = result?;
        self.set_phase(TxPhase::FilesWritten);
        debug!(operation = message, files = touched.len(), undo = undo.len(), "body finished");

        self.check_deadline("store commit")?;
        let store = self.store()?;
        store.commit()?;
        self.set_phase(TxPhase::StoreTxCommitted);

        self.check_deadline("vcs commit")?;
        self.store()?.checkpoint()?;
        self.repo.stage_all()?;
        let revision = self.repo.commit(message, false)?;
        self.set_phase(TxPhase::VcsCommitted);
        info!(operation = message, %revision, files = touched.len(), "unit committed");

        Ok(Committed { value, revision })
    }

    fn roll_back(&mut self, undo: &mut UndoLog) -> Result<()> {
        let store_path = self.store_path();
        if let Some(store) = self.store.take() {
            if let Err(err) = store.rollback() {
                error!(%err, "store rollback failed");
            }
            // Fold any committed WAL frames into the file so the reset below
            // replaces everything the unit wrote.
            if let Err(err) = store.checkpoint() {
                warn!(%err, "checkpoint during rollback incomplete");
            }
            if let Err(err) = store.close() {
                error!(%err, "closing store during rollback failed");
            }
        }

        let replayed = undo.replay();
        let reset = self.reset_to_head();
        let reopened = if store_path.exists() {
            StateStore::open(&store_path, self.config.store.busy_timeout()).map(Some)
        } else {
            Ok(None)
        };

        replayed?;
        reset?;
        self.store = reopened?;
        Ok(())
    }

    fn reset_to_head(&self) -> Result<()> {
        if self.repo.has_commits()? {
            self.repo.hard_reset("HEAD")?;
        } else {
            self.repo.clear_index()?;
        }
        Ok(())
    }

    fn require_clean(&self) -> Result<()> {
        let dirty = self.repo.dirty_paths()?;
        if dirty.is_empty() {
            Ok(())
        } else {
            Err(StateError::DirtyWorkingTree { paths: dirty })
        }
    }

    fn check_deadline(&self, boundary: &'static str) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(StateError::DeadlineExceeded(boundary))
            }
            _ => Ok(()),
        }
    }

    fn set_phase(&mut self, phase: TxPhase) {
        debug!(from = %self.phase, to = %phase, "transaction phase");
        self.phase = phase;
    }
}

fn gitignore_block(store_rel: &Path) -> String {
    use std::fmt::Write as _;
    let mut block = String::new();
    let _ = writeln!(block, "{GITIGNORE_MARKER}");
    for sidecar in db::sidecar_paths(store_rel) {
        let _ = writeln!(block, "/{}", sidecar.to_string_lossy().replace('\\', "/"));
    }
    block
}
