//! hyperfleet-scheduler — autoscaling groups and the reconciliation engine.
//!
//! Owns the durable group model (desired size, bounds, members) and the
//! control loop that drives each group toward its desired size through a
//! [`VmGateway`](hyperfleet_core::VmGateway).
//!
//! # Architecture
//!
//! ```text
//! ReconciliationEngine
//!   ├── GroupStore (per-group lock, StateStore underneath)
//!   ├── PlacementPlanner (host ranking + capacity reservation)
//!   ├── RetryBook (per-instance backoff, process-local)
//!   └── VmGateway (create / destroy / status, per-host concurrency cap)
//! ```
//!
//! Instance lifecycle:
//!
//! ```text
//! Requested → Provisioning → Running → Terminating → Terminated
//!     │             │           └──────────────────────↗
//!     └─────────────┴→ Failed
//! ```

pub mod engine;
pub mod error;
pub mod groups;
pub mod memory;
pub mod recovery;
pub mod retry;

pub use engine::{
    EngineConfig, EngineStatus, GroupStatus, GroupTickReport, ReconciliationEngine, TickReport,
};
pub use error::{EngineError, EngineResult, GroupError, GroupResult};
pub use groups::{GroupDefinition, GroupGuard, GroupSnapshot, GroupStore, SyncReport};
pub use memory::MemoryGateway;
pub use recovery::RecoveryReport;
pub use retry::{RetryBook, RetryPolicy, RetryState};
