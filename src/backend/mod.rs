use crate::error::ExecutionError;
use crate::record::{QueryEngine, ResourceCounts, ResultRecord};

pub mod command;

pub use command::{CommandBackend, CommandCounter};

/// One engine under benchmark.
///
/// The orchestrator depends only on this contract, never on engine internals.
pub trait BenchmarkBackend {
    /// Label attached to every record this backend produces
    fn engine(&self) -> QueryEngine;

    /// Number of queries one call to `run_all_queries` executes
    fn query_count(&self) -> usize;

    /// Execute every configured query once and return one record per query.
    ///
    /// Either the complete sequence is returned or the whole call fails.
    fn run_all_queries(&mut self, run_id: &str) -> Result<Vec<ResultRecord>, ExecutionError>;

    /// Release cached or in-memory state held by the backend
    fn reset(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Source of the reference resource counts captured before the first round
pub trait ResourceCounter {
    fn resource_counts(&mut self, resource_types: &[String])
    -> Result<ResourceCounts, ExecutionError>;
}
