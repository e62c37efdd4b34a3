//! Repeated, comparable benchmark rounds across FHIR analytics engines.
//!
//! A run measures the dataset once, then executes every backend's query set
//! for a fixed number of rounds, strictly one phase at a time, and writes all
//! timings to a single CSV annotated with the dataset size.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod query;
pub mod record;
pub mod retry;
pub mod sink;
pub mod stabilizer;

// Re-export main types for public API
pub use backend::{BenchmarkBackend, CommandBackend, CommandCounter, ResourceCounter};
pub use config::{BenchConfig, Overrides};
pub use error::{ExecutionError, RunError, StabilizationError};
pub use orchestrator::{RunConfig, RunOrchestrator, RunSummary};
pub use query::{QuerySource, QuerySpec};
pub use record::{QueryEngine, QueryType, ResourceCounts, ResultRecord, ResultTable};
pub use retry::{RetryOutcome, RetryPolicy};
pub use sink::{CsvSink, ResultSink};
pub use stabilizer::{ContainerManager, DockerCli, HostStabilizer, PhaseLabel, ResourceStabilizer};
