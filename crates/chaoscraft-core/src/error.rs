//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Lifecycle error taxonomy shared with the request surface."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::fmt;

use chaoscraft_store::{Experiment, StoreError};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Whether an executor failure left the target in a known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectOutcome {
    /// The effect definitely did not take hold.
    Failed,
    /// The effect may or may not be active on the target.
    Unknown,
}

impl EffectOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectOutcome::Failed => "failed",
            EffectOutcome::Unknown => "unknown",
        }
    }
}

/// Failure reported by an [`crate::InjectionExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EffectError {
    pub outcome: EffectOutcome,
    pub message: String,
}

impl EffectError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: EffectOutcome::Failed,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            outcome: EffectOutcome::Unknown,
            message: message.into(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.outcome == EffectOutcome::Unknown
    }
}

/// Why a request was refused with [`LifecycleError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Another transition holds the experiment.
    InFlight,
    /// The record changed between read and write.
    VersionRace,
    InvalidTransition,
    NotDeletable,
    /// Idempotency key replayed with a different spec.
    IdempotencyMismatch,
    /// Idempotency key belongs to an experiment that has been deleted.
    IdempotencyKeyRetired,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::InFlight => "in_flight",
            ConflictReason::VersionRace => "version_race",
            ConflictReason::InvalidTransition => "invalid_transition",
            ConflictReason::NotDeletable => "not_deletable",
            ConflictReason::IdempotencyMismatch => "idempotency_mismatch",
            ConflictReason::IdempotencyKeyRetired => "idempotency_key_retired",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable machine-readable category of a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Effect,
    StoreTransient,
    StoreFatal,
    InternalInconsistency,
    /// The request outlived its deadline; raised by the request surface, never by the engine.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Effect => "effect",
            ErrorKind::StoreTransient => "store_transient",
            ErrorKind::StoreFatal => "store_fatal",
            ErrorKind::InternalInconsistency => "internal_inconsistency",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the lifecycle engine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("experiment {0} not found")]
    NotFound(Uuid),
    #[error("conflict ({reason}): {message}")]
    Conflict {
        reason: ConflictReason,
        message: String,
    },
    #[error("invalid experiment spec: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// The executor failed; `experiment` is the persisted `failed` record.
    #[error("injection effect {}: {source}", .source.outcome.as_str())]
    Effect {
        experiment: Box<Experiment>,
        #[source]
        source: EffectError,
    },
    #[error("store temporarily unavailable: {0}")]
    StoreTransient(String),
    #[error("store failure: {0}")]
    StoreFatal(String),
    /// The effect ran but its outcome could not be recorded.
    #[error("experiment {id} is inconsistent: {message}")]
    Inconsistency { id: Uuid, message: String },
}

impl LifecycleError {
    pub fn conflict(reason: ConflictReason, message: impl Into<String>) -> Self {
        LifecycleError::Conflict {
            reason,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotFound(_) => ErrorKind::NotFound,
            LifecycleError::Conflict { .. } => ErrorKind::Conflict,
            LifecycleError::Validation(_) => ErrorKind::Validation,
            LifecycleError::Effect { .. } => ErrorKind::Effect,
            LifecycleError::StoreTransient(_) => ErrorKind::StoreTransient,
            LifecycleError::StoreFatal(_) => ErrorKind::StoreFatal,
            LifecycleError::Inconsistency { .. } => ErrorKind::InternalInconsistency,
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::StoreTransient(_) => true,
            LifecycleError::Conflict { reason, .. } => {
                matches!(reason, ConflictReason::InFlight | ConflictReason::VersionRace)
            }
            _ => false,
        }
    }

    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            LifecycleError::Conflict { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Persisted record attached to the error, when there is one.
    pub fn experiment(&self) -> Option<&Experiment> {
        match self {
            LifecycleError::Effect { experiment, .. } => Some(experiment),
            _ => None,
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => LifecycleError::conflict(
                ConflictReason::VersionRace,
                format!(
                    "experiment {} changed concurrently (read version {}, now {})",
                    id, expected, actual
                ),
            ),
            StoreError::NotDeletable { id, state } => LifecycleError::conflict(
                ConflictReason::NotDeletable,
                format!("experiment {} cannot be deleted while {}", id, state),
            ),
            err @ StoreError::DuplicateIdempotencyKey { .. } => {
                LifecycleError::conflict(ConflictReason::IdempotencyMismatch, err.to_string())
            }
            StoreError::Transient(message) => LifecycleError::StoreTransient(message),
            StoreError::Fatal(message) => LifecycleError::StoreFatal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
