use thiserror::Error;

use hyperfleet_core::Resources;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No reachable host in the group's pool has room for the template.
    /// The instance stays pending and placement is retried next tick.
    #[error("capacity exhausted for group {group}: no host fits {requested} ({considered} hosts considered)")]
    CapacityExhausted {
        group: String,
        requested: Resources,
        considered: usize,
    },
}
