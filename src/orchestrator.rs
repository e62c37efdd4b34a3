//! Sequencing of a full benchmark run.
//!
//! One run captures the reference resource counts, then executes a fixed
//! number of rounds. Each round runs every backend once, in declared order,
//! each phase wrapped in the retry policy and followed by stabilization.
//! Everything is strictly sequential: backends compete for the same host
//! resources, so overlapping phases would corrupt the timings.

use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::backend::{BenchmarkBackend, ResourceCounter};
use crate::error::{RunError, StabilizationError};
use crate::record::ResultTable;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::sink::{ResultSink, write_table};
use crate::stabilizer::{PhaseLabel, ResourceStabilizer};

pub const DEFAULT_ROUNDS: usize = 5;

/// Run parameters
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub rounds: usize,
    pub retry: RetryPolicy,
    /// Resource types counted before the first round, in column order
    pub resource_types: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            retry: RetryPolicy::default(),
            resource_types: ["Patient", "Observation", "Encounter", "Condition"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub path: PathBuf,
    pub records: usize,
    pub rounds_completed: usize,
    /// Failed attempts across all phases, including ones later retried successfully
    pub failed_attempts: u32,
    /// Phases that contributed no records
    pub failed_phases: usize,
    pub cancelled: bool,
}

/// Bookkeeping shared by every phase of a run
#[derive(Debug, Default)]
struct RunProgress {
    table: ResultTable,
    failed_attempts: u32,
    failed_phases: usize,
}

pub struct RunOrchestrator {
    config: RunConfig,
    backends: Vec<Box<dyn BenchmarkBackend>>,
    stabilizer: Box<dyn ResourceStabilizer>,
    sink: Box<dyn ResultSink>,
    cancel: Option<Arc<AtomicBool>>,
}

impl RunOrchestrator {
    pub fn new(
        config: RunConfig,
        backends: Vec<Box<dyn BenchmarkBackend>>,
        stabilizer: Box<dyn ResourceStabilizer>,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            backends,
            stabilizer,
            sink,
            cancel: None,
        }
    }

    /// Stop starting new rounds once `flag` is set; checked between rounds only
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Execute the whole run and persist its results.
    ///
    /// Only a failed precondition or a failed write end the run with an
    /// error; backend failures are absorbed into the summary's counters.
    pub fn run(&mut self, counter: &mut dyn ResourceCounter) -> Result<RunSummary, RunError> {
        let counts = counter
            .resource_counts(&self.config.resource_types)
            .map_err(|e| {
                error!(error = %e, "could not establish reference resource counts");
                RunError::Precondition(e)
            })?;
        let benchmark_timestamp = Utc::now();

        info!(
            rounds = self.config.rounds,
            backends = self.backends.len(),
            max_attempts = self.config.retry.max_attempts(),
            resource_count_total = counts.total(),
            "starting benchmark run"
        );
        for (resource_type, count) in counts.entries() {
            info!(resource_type = resource_type.as_str(), count, "reference resource count");
        }

        let mut progress = RunProgress::default();
        let mut rounds_completed = 0;
        let mut cancelled = false;

        for round in 0..self.config.rounds {
            if self.cancel_requested() {
                warn!(round, "cancellation requested; no further rounds will start");
                cancelled = true;
                break;
            }

            let run_id = round.to_string();
            let round_start = Instant::now();
            info!(round, "round started");

            for backend in self.backends.iter_mut() {
                let phase = PhaseLabel {
                    round,
                    engine: backend.engine(),
                };
                run_phase(
                    &self.config.retry,
                    backend.as_mut(),
                    &phase,
                    &run_id,
                    &mut progress,
                );

                if let Err(e) = self.stabilizer.stabilize(&phase) {
                    warn!(phase = %phase, error = %e, "stabilization incomplete; continuing");
                }
            }

            rounds_completed += 1;
            info!(
                round,
                records = progress.table.len(),
                duration_seconds = round_start.elapsed().as_secs_f64(),
                "round finished"
            );
        }

        for (engine, records) in progress.table.counts_by_engine() {
            info!(engine = %engine, records, "records collected");
        }
        info!(
            failed_attempts = progress.failed_attempts,
            failed_phases = progress.failed_phases,
            "number of failed attempts"
        );

        let path = match self
            .sink
            .persist(&progress.table, benchmark_timestamp, &counts)
        {
            Ok(path) => path,
            Err(e) => {
                error!(
                    error = %e,
                    failed_attempts = progress.failed_attempts,
                    records = progress.table.len(),
                    "persisting results failed; writing table to stdout"
                );
                if let Err(dump) =
                    write_table(io::stdout().lock(), &progress.table, benchmark_timestamp, &counts)
                {
                    error!(error = %dump, "could not write results to stdout");
                }
                return Err(e);
            }
        };
        info!(path = %path.display(), records = progress.table.len(), "results persisted");

        Ok(RunSummary {
            path,
            records: progress.table.len(),
            rounds_completed,
            failed_attempts: progress.failed_attempts,
            failed_phases: progress.failed_phases,
            cancelled,
        })
    }
}

/// One backend's share of one round
fn run_phase(
    policy: &RetryPolicy,
    backend: &mut dyn BenchmarkBackend,
    phase: &PhaseLabel,
    run_id: &str,
    progress: &mut RunProgress,
) {
    let phase_start = Instant::now();
    info!(
        round = phase.round,
        engine = %phase.engine,
        queries = backend.query_count(),
        "phase started"
    );

    let outcome = policy.execute(backend, run_id);
    progress.failed_attempts += outcome.failed_attempts();

    let appended = match outcome {
        RetryOutcome::Succeeded { value, .. } => match progress.table.append_phase(value) {
            Ok(appended) => {
                // Release engine state so the next round starts from the same baseline
                if let Err(e) = backend.reset() {
                    let e = StabilizationError::Reset(e);
                    warn!(phase = %phase, error = %e, "reset after successful phase failed");
                }
                appended
            }
            Err(e) => {
                error!(phase = %phase, error = %e, "phase results rejected");
                progress.failed_attempts += 1;
                progress.failed_phases += 1;
                0
            }
        },
        RetryOutcome::Exhausted {
            failed_attempts,
            last_error,
        } => {
            error!(
                phase = %phase,
                failed_attempts,
                error = %last_error,
                "retries exhausted; phase contributes no records"
            );
            progress.failed_phases += 1;
            0
        }
    };

    info!(
        round = phase.round,
        engine = %phase.engine,
        records = appended,
        duration_seconds = phase_start.elapsed().as_secs_f64(),
        "phase finished"
    );
}
