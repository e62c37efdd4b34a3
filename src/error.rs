use std::path::PathBuf;
use thiserror::Error;

/// A backend phase failed; recoverable through the retry policy
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("query `{query}` exited with {status}: {stderr}")]
    QueryFailed {
        query: String,
        status: String,
        stderr: String,
    },

    #[error("malformed output for `{query}`: {reason}")]
    MalformedOutput { query: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The backend returned something that breaks the result contract
    #[error("backend contract violated: {0}")]
    Contract(String),

    #[error("{0}")]
    Backend(String),
}

/// A step of environment stabilization failed; logged, never fatal
#[derive(Debug, Error)]
pub enum StabilizationError {
    #[error("failed to restart container `{name}`: {reason}")]
    Restart { name: String, reason: String },

    #[error("cache clearing failed: {0}")]
    CacheClear(String),

    #[error("backend reset failed: {0}")]
    Reset(#[source] ExecutionError),

    #[error("{} stabilization step(s) failed: {}", .0.len(), join_errors(.0))]
    Steps(Vec<StabilizationError>),
}

fn join_errors(errors: &[StabilizationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures that end a run
#[derive(Debug, Error)]
pub enum RunError {
    /// Reference resource counts could not be established; no round ran
    #[error("precondition failed: could not establish reference resource counts: {0}")]
    Precondition(#[source] ExecutionError),

    #[error("failed to persist results to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_message_lists_every_failure() {
        let err = StabilizationError::Steps(vec![
            StabilizationError::Restart {
                name: "minio".to_string(),
                reason: "no such container".to_string(),
            },
            StabilizationError::CacheClear("permission denied".to_string()),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 stabilization step(s) failed"));
        assert!(message.contains("minio"));
        assert!(message.contains("permission denied"));
    }
}
