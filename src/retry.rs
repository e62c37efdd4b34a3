//! Bounded retry around a backend phase.
//!
//! A failed attempt is followed by a reset of the backend before the next
//! attempt, since the observed failures are transient and tied to memory
//! pressure rather than to the queries themselves.

use tracing::{error, warn};

use crate::backend::BenchmarkBackend;
use crate::error::ExecutionError;
use crate::record::ResultRecord;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Transient bookkeeping for one (round, backend) phase
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<ExecutionError>,
}

/// Result of running an operation under a retry policy
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, failed_attempts: u32 },
    Exhausted { failed_attempts: u32, last_error: ExecutionError },
}

impl<T> RetryOutcome<T> {
    pub fn failed_attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded {
                failed_attempts, ..
            }
            | RetryOutcome::Exhausted {
                failed_attempts, ..
            } => *failed_attempts,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Some(value),
            RetryOutcome::Exhausted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// A ceiling of zero is treated as one attempt
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` until it succeeds or the ceiling is reached, calling
    /// `reset` after every failed attempt.
    ///
    /// `state` is threaded through both closures so they can share a mutable
    /// borrow of the thing being retried.
    pub fn run<S, T, A, R>(
        &self,
        label: &str,
        state: &mut S,
        mut attempt: A,
        mut reset: R,
    ) -> RetryOutcome<T>
    where
        S: ?Sized,
        A: FnMut(&mut S, u32) -> Result<T, ExecutionError>,
        R: FnMut(&mut S) -> Result<(), ExecutionError>,
    {
        let mut retry = RetryState::default();

        while retry.attempts < self.max_attempts {
            retry.attempts += 1;
            match attempt(&mut *state, retry.attempts) {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        failed_attempts: retry.attempts - 1,
                    };
                }
                Err(e) => {
                    error!(
                        phase = label,
                        attempt = retry.attempts,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "attempt failed"
                    );
                    if let Err(reset_error) = reset(&mut *state) {
                        warn!(
                            phase = label,
                            error = %reset_error,
                            "reset after failed attempt failed"
                        );
                    }
                    retry.last_error = Some(e);
                }
            }
        }

        RetryOutcome::Exhausted {
            failed_attempts: retry.attempts,
            last_error: retry
                .last_error
                .unwrap_or_else(|| ExecutionError::Backend("no attempt was made".to_string())),
        }
    }

    /// Run one backend phase under this policy.
    ///
    /// Records are checked against the phase before being accepted. A
    /// backend that returns one record per query, all labelled with this
    /// round and its engine and carrying possible timings, has succeeded;
    /// anything else counts as a failed attempt.
    pub fn execute(
        &self,
        backend: &mut dyn BenchmarkBackend,
        run_id: &str,
    ) -> RetryOutcome<Vec<ResultRecord>> {
        let label = format!("{} round {}", backend.engine(), run_id);
        self.run(
            &label,
            backend,
            |backend, _attempt| {
                let records = backend.run_all_queries(run_id)?;
                check_phase_records(&records, backend, run_id)?;
                Ok(records)
            },
            |backend| backend.reset(),
        )
    }
}

fn check_phase_records(
    records: &[ResultRecord],
    backend: &dyn BenchmarkBackend,
    run_id: &str,
) -> Result<(), ExecutionError> {
    let engine = backend.engine();
    if records.len() != backend.query_count() {
        return Err(ExecutionError::Contract(format!(
            "{} returned {} records for {} queries during run {}",
            engine,
            records.len(),
            backend.query_count(),
            run_id
        )));
    }
    for record in records {
        if record.run_id != run_id || record.engine != engine {
            return Err(ExecutionError::Contract(format!(
                "{} returned a record labelled run {} engine {} during run {}",
                engine, record.run_id, record.engine, run_id
            )));
        }
        record.check_timings()?;
    }
    Ok(())
}
