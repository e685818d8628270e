//! Scheduler error types.

use thiserror::Error;

use hyperfleet_core::ConfigError;
use hyperfleet_state::StateError;

/// Errors from group store operations.
///
/// Everything except [`GroupError::State`] is a caller error and leaves the
/// store untouched, with one exception: [`GroupError::OutOfRange`] is
/// returned *after* the clamped size has been applied.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("group not found: {0}")]
    NotFound(String),

    #[error("group {group}: requested size {requested} outside [{min}, {max}], applied {applied}")]
    OutOfRange {
        group: String,
        requested: u32,
        applied: u32,
        min: u32,
        max: u32,
    },

    #[error("group {group}: increase by {delta} gives {requested}, above max {max}")]
    ExceedsMax {
        group: String,
        delta: u32,
        requested: u64,
        max: u32,
    },

    #[error("group {group}: increase delta must be positive")]
    InvalidDelta { group: String },

    #[error("group {group}: expected target size {expected}, actual {actual}")]
    PreconditionFailed {
        group: String,
        expected: u32,
        actual: u32,
    },

    #[error("instance {instance} is not a member of group {group}")]
    NotMember { group: String, instance: String },

    #[error("group {group}: deleting {count} instances would go below min size {min}")]
    BelowMin { group: String, count: u32, min: u32 },

    #[error("group {group}: request {request_id} was already used for a different call")]
    RequestConflict { group: String, request_id: String },

    #[error("invalid group definition: {0}")]
    Config(#[from] ConfigError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type GroupResult<T> = Result<T, GroupError>;

/// Errors that stop the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("reconcile task for group {group} panicked: {reason}")]
    Task { group: String, reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
