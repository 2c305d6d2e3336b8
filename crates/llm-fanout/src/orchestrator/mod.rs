//! Fan-out/fan-in execution of facet tasks.
//!
//! [`ParallelOrchestrator`] runs one [`TaskDescriptor`](crate::task::TaskDescriptor)
//! per facet on a bounded worker pool, isolates each facet's failure, and
//! folds every outcome into one [`AggregateResult`].

pub mod config;
pub mod error;
pub mod parallel;
pub mod result;

pub use config::ParallelOrchestratorConfig;
pub use error::OrchestratorError;
pub use parallel::ParallelOrchestrator;
pub use result::{AggregateCounts, AggregateResult, AggregateStatus, TaskErrorKind, TaskResult};
