//! Research session state.
//!
//! One snapshot per session, mutated only through the store:
//! - `SessionSnapshot`: versioned state of a session
//! - `SessionStore`: serialized writes, optimistic concurrency
//! - `SnapshotPersistence`: pluggable durability behind the store

mod persistence;
mod state;
mod store;

use crate::error::WorkflowError;

fn store_err(msg: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Store(msg.to_string())
}

fn store_err_with<E: std::fmt::Display>(context: &str, err: E) -> WorkflowError {
    WorkflowError::Store(format!("{}: {}", context, err))
}

pub use persistence::{NullPersistence, SnapshotPersistence, SqliteSnapshots};
pub use state::{
    Author, FeasibilityAssessment, FeasibilityStatus, Question, QuestionStatus, ReflectionEntry,
    ScopeElement, SessionId, SessionSnapshot,
};
pub use store::{NullSink, SessionStore, StateSink};
