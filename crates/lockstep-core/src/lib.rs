//! lockstep-core: keeps a version-controlled artifact tree and an embedded
//! SQLite state store consistent.
//!
//! Every mutation runs as one unit through [`tx::TransactionManager`]: the
//! store transaction and the file writes either land together in exactly one
//! new git revision, or the tree is restored to its prior state.
//!
//! # Conventions
//!
//! - **Errors**: library functions return [`error::Result`] carrying a typed
//!   [`StateError`].
//! - **Logging**: `tracing` macros with structured fields. Destructive steps
//!   log at `warn` before they run.

pub mod artifact;
pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod lock;
pub mod manager;
pub mod migrate;
pub mod model;
pub mod queue;
pub mod service;
pub mod tx;
pub mod vcs;

pub use consistency::{ConsistencyIssue, ConsistencyReport, RepairMode, RepairOutcome, Resolution};
pub use coordinator::{ContextReader, EpicContext, StateCoordinator, StoryUpdate};
pub use error::{ErrorCode, StateError};
pub use manager::StateManager;
pub use migrate::MigrationReport;
pub use queue::WriteQueue;
pub use tx::{Committed, TransactionManager};
pub use vcs::{GitRepo, VcsError};
