//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Experiment data model and compare-and-swap persistence backends."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
//! Durable record keeping for chaos experiments.
//!
//! Every backend implements [`ExperimentStore`]. The only mutation primitive is
//! [`ExperimentStore::compare_and_swap`]: a write names the version it read and
//! is rejected when another writer got there first. The store does not judge
//! lifecycle legality beyond deletability; that belongs to the engine.

pub mod memory;
pub mod model;
pub mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use model::{
    Experiment, ExperimentSpec, ExperimentState, FaultKind, LastError, ListFilter, NewExperiment,
    Operation, TargetSelector,
};
pub use sqlite::SqliteStore;

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment {0} not found")]
    NotFound(Uuid),
    #[error("experiment {id} is at version {actual}, expected {expected}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },
    #[error("idempotency key {key:?} already recorded for experiment {existing}")]
    DuplicateIdempotencyKey { key: String, existing: Uuid },
    #[error("experiment {id} cannot be deleted while {state}")]
    NotDeletable { id: Uuid, state: ExperimentState },
    /// Busy or locked storage; the same call may succeed if repeated.
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract shared by every backend.
#[async_trait]
pub trait ExperimentStore: Send + Sync + 'static {
    async fn get(&self, id: Uuid) -> Result<Experiment>;

    /// Newest first; ties on `created_at` resolve to the later insertion.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>>;

    /// Number of records in `state`, or of all records when `None`.
    async fn count(&self, state: Option<ExperimentState>) -> Result<usize>;

    /// Persist a new `pending` record under a never-used id.
    async fn create(&self, new: NewExperiment) -> Result<Experiment>;

    /// Atomically replace state and `last_error` when the stored version still
    /// equals `expected_version`; the returned record carries the bumped version.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        state: ExperimentState,
        last_error: Option<LastError>,
    ) -> Result<Experiment>;

    /// Remove a record in a deletable state and retire its id.
    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

/// Parsed form of the configured store url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    SqliteMemory,
    SqliteFile(PathBuf),
}

impl StoreLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "memory://" || url == "memory:" {
            return Ok(StoreLocation::Memory);
        }
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(StoreLocation::SqliteMemory);
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(StoreError::Fatal("sqlite url is missing a path".to_owned()));
            }
            return Ok(StoreLocation::SqliteFile(PathBuf::from(path)));
        }
        let scheme = url.split(':').next().unwrap_or(url);
        Err(StoreError::Fatal(format!(
            "unsupported store url scheme {:?}",
            scheme
        )))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            StoreLocation::Memory => memory::BACKEND,
            StoreLocation::SqliteMemory | StoreLocation::SqliteFile(_) => sqlite::BACKEND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_urls() {
        assert_eq!(StoreLocation::parse("memory://").unwrap(), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::parse("sqlite::memory:").unwrap(),
            StoreLocation::SqliteMemory
        );
        assert_eq!(
            StoreLocation::parse("sqlite://data/chaoscraft.db").unwrap(),
            StoreLocation::SqliteFile(PathBuf::from("data/chaoscraft.db"))
        );
        assert_eq!(
            StoreLocation::parse("sqlite:///var/lib/chaoscraft.db").unwrap(),
            StoreLocation::SqliteFile(PathBuf::from("/var/lib/chaoscraft.db"))
        );
    }

    #[test]
    fn rejects_unsupported_schemes() {
        let err = StoreLocation::parse("postgres://localhost/chaos").unwrap_err();
        assert!(err.to_string().contains("postgres"));
        assert!(StoreLocation::parse("sqlite://").is_err());
    }

    #[test]
    fn only_transient_errors_are_transient() {
        assert!(StoreError::Transient("busy".into()).is_transient());
        assert!(!StoreError::Fatal("disk".into()).is_transient());
        assert!(!StoreError::NotFound(Uuid::nil()).is_transient());
    }
}
