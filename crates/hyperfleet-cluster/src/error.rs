use thiserror::Error;

use hyperfleet_core::Resources;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("host already registered: {0}")]
    DuplicateHost(String),

    #[error("host {host} cannot fit {requested}; free {free}")]
    InsufficientCapacity {
        host: String,
        requested: Resources,
        free: Resources,
    },
}
