use ctx_core::memory_contracts::{ContractError, Dependency};
use ctx_core::ports::DependencyFailure;
use ctx_storage::StorageError;
use thiserror::Error;

pub mod alerts;
pub mod bootstrap;
pub mod degradation;
pub mod deterministic;
pub mod dispatch;
pub mod scheduler;
pub mod tiered_store;
pub mod tools;

pub use alerts::AlertPolicy;
pub use bootstrap::{
    BootstrapCoordinator, RebuildReport, ReprocessReport, ScaffoldReport, SessionRange,
    StatusReport,
};
pub use degradation::{CallOutcome, CircuitConfig, DegradationMonitor, HealthSnapshot};
pub use deterministic::DeterministicReasoner;
pub use dispatch::{Guarded, PortGateway, PortTimeouts};
pub use scheduler::{PipelineScheduler, SchedulerConfig, TickOutcome, TickReport};
pub use tiered_store::{
    CommitReport, CompressionOutcome, CompressionReport, HotBudget, HotSnapshot, ManualEdit,
    OutboxReport, TieredMemoryStore,
};
pub use tools::{
    CorrectionReport, CorrectionScope, LoadedContext, SearchHit, SearchResults, SearchSource,
    SessionDraft, ToolSurface,
};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("revision conflict: expected {expected}, found {found}")]
    DataConflict { expected: u64, found: u64 },
    #[error("revision invariant violated: {0}")]
    RevisionInvariant(String),
    #[error("session {0} has no cold-tier record")]
    MissingColdSession(String),
    #[error("no context available from any tier")]
    NoContextAvailable,
    #[error("session {0} is already known to the queue")]
    DuplicateEnqueue(String),
    #[error("{dependency} unavailable: {failure}")]
    Dependency {
        dependency: Dependency,
        failure: DependencyFailure,
    },
    #[error("{0} circuit is open")]
    CircuitOpen(Dependency),
    #[error("no hot entry matches {0}")]
    NoMatchingEntry(String),
}
