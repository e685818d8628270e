//! hyperfleet-placement — picks a host for a new VM.
//!
//! # Components
//!
//! - **`scorer`**: eligibility checks and host ordering (pure functions)
//! - **`planner`**: first-fit over the ordered hosts, reserving capacity
//!   in the [`HostRegistry`](hyperfleet_cluster::HostRegistry)

pub mod error;
pub mod planner;
pub mod scorer;

pub use error::{PlacementError, PlacementResult};
pub use planner::{Placement, PlacementPlanner};
pub use scorer::{HostScore, is_eligible, rank_hosts, score_host};
