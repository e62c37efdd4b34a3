use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info};

use super::{BenchmarkBackend, ResourceCounter};
use crate::error::ExecutionError;
use crate::frame::{Frame, extract_count_from_output};
use crate::query::{QuerySpec, execution_order};
use crate::record::{QueryEngine, ResourceCounts, ResultRecord, ServerTimings};

/// Substitute `{name}` placeholders in one pass; unknown placeholders are
/// left as written and substituted values are never re-expanded.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Run a command to completion and return its stdout
pub fn run_command(args: &[String], label: &str) -> Result<String, ExecutionError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| ExecutionError::Contract(format!("empty command for `{}`", label)))?;

    debug!(query = label, command = %args.join(" "), "spawning command");

    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ExecutionError::Spawn {
            command: program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecutionError::QueryFailed {
            query: label.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Backend that runs each query as a subprocess printing CSV to stdout
#[derive(Debug, Clone)]
pub struct CommandBackend {
    engine: QueryEngine,
    command: Vec<String>,
    reset_command: Vec<String>,
    stats_command: Vec<String>,
    queries: Vec<QuerySpec>,
    base_dir: PathBuf,
    output_dir: PathBuf,
}

impl CommandBackend {
    pub fn new(engine: QueryEngine, command: Vec<String>, queries: Vec<QuerySpec>) -> Self {
        Self {
            engine,
            command,
            reset_command: Vec::new(),
            stats_command: Vec::new(),
            queries,
            base_dir: PathBuf::from("."),
            output_dir: PathBuf::from("results"),
        }
    }

    /// Command run by `reset`; empty means no-op
    pub fn with_reset_command(mut self, reset_command: Vec<String>) -> Self {
        self.reset_command = reset_command;
        self
    }

    /// Command run after each query to report the engine's own timings.
    ///
    /// It takes the same placeholders as the query command and must print a
    /// CSV header `cpu_time_seconds,wall_time_seconds,elapsed_time_seconds`
    /// followed by one row. Empty means the server timings stay zero.
    pub fn with_stats_command(mut self, stats_command: Vec<String>) -> Self {
        self.stats_command = stats_command;
        self
    }

    /// Directory that relative `source_file` paths resolve against
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Root for per-query result files
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Where the result file of `query` is written
    pub fn output_path(&self, query: &QuerySpec) -> PathBuf {
        self.output_dir
            .join(self.engine.name())
            .join(query.query_type().name())
            .join(format!("{}.csv", query.name()))
    }

    fn run_query(
        &self,
        query: &QuerySpec,
        run_id: &str,
        start_timestamp: DateTime<Utc>,
    ) -> Result<ResultRecord, ExecutionError> {
        let query_type = query.query_type();
        info!(
            engine = %self.engine,
            query_type = %query_type,
            query = query.name(),
            "running query"
        );

        let source = query.source().load(&self.base_dir)?;
        let output_path = self.output_path(query);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let vars = [
            ("source", source.as_str()),
            ("query", query.name()),
            ("query_type", query_type.name()),
            ("run_id", run_id),
        ];
        let args: Vec<String> = self
            .command
            .iter()
            .map(|arg| render_template(arg, &vars))
            .collect();

        let timings_start = Instant::now();
        let stdout = run_command(&args, query.name())?;
        let fetch_duration = timings_start.elapsed();

        let post_process_start = Instant::now();
        let frame = post_process(query, &stdout)?;
        let post_process_duration = post_process_start.elapsed();

        let write_start = Instant::now();
        write_frame(&frame, &output_path, query.name())?;
        let write_duration = write_start.elapsed();

        let total_duration = timings_start.elapsed();

        // Outside the timed interval; the engine reports its own figures
        let server = if self.stats_command.is_empty() {
            ServerTimings::default()
        } else {
            let args: Vec<String> = self
                .stats_command
                .iter()
                .map(|arg| render_template(arg, &vars))
                .collect();
            let label = format!("stats {}", query.name());
            parse_server_timings(&run_command(&args, &label)?)
                .map_err(|reason| malformed(query, reason))?
        };

        info!(
            engine = %self.engine,
            query = query.name(),
            rows = frame.len(),
            total_seconds = total_duration.as_secs_f64(),
            "query finished"
        );

        let mut record = ResultRecord::new(
            run_id,
            start_timestamp,
            self.engine,
            query.name(),
            query_type,
            total_duration.as_secs_f64(),
        );
        record.fetch_duration_seconds = fetch_duration.as_secs_f64();
        record.post_process_duration_seconds = post_process_duration.as_secs_f64();
        record.write_to_file_duration_seconds = write_duration.as_secs_f64();
        record.server = server;
        Ok(record)
    }
}

fn malformed(query: &QuerySpec, reason: impl ToString) -> ExecutionError {
    ExecutionError::MalformedOutput {
        query: query.name().to_string(),
        reason: reason.to_string(),
    }
}

/// Shape raw command output into the result table for this query type
fn post_process(query: &QuerySpec, stdout: &str) -> Result<Frame, ExecutionError> {
    match query {
        QuerySpec::Count { .. } => extract_count_from_output(stdout)
            .map(Frame::scalar_count)
            .ok_or_else(|| malformed(query, "no count found in output")),
        QuerySpec::Extract {
            columns, sort_by, ..
        } => {
            let frame = Frame::from_csv(stdout.as_bytes())
                .map_err(|e| malformed(query, e))?
                .project(columns)
                .map_err(|e| malformed(query, e))?;
            match sort_by {
                Some(column) => frame.sort_by(column).map_err(|e| malformed(query, e)),
                None => Ok(frame),
            }
        }
        QuerySpec::Aggregate {
            group_by,
            count_column,
            ..
        } => Frame::from_csv(stdout.as_bytes())
            .and_then(|frame| frame.group_count(group_by, count_column))
            .map_err(|e| malformed(query, e)),
    }
}

/// Read the single row of server timings printed by a stats command
fn parse_server_timings(stdout: &str) -> Result<ServerTimings, String> {
    let mut reader = csv::Reader::from_reader(stdout.as_bytes());
    let timings: ServerTimings = reader
        .deserialize::<ServerTimings>()
        .next()
        .ok_or_else(|| "no server timings in stats output".to_string())?
        .map_err(|e| format!("bad server timings: {}", e))?;

    let values = [
        timings.cpu_time_seconds,
        timings.wall_time_seconds,
        timings.elapsed_time_seconds,
    ];
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(format!("impossible server timings {:?}", values));
    }
    Ok(timings)
}

fn write_frame(frame: &Frame, path: &Path, label: &str) -> Result<(), ExecutionError> {
    let file = File::create(path)?;
    frame
        .write_csv(BufWriter::new(file))
        .map_err(|e| ExecutionError::Backend(format!("writing result of `{}`: {}", label, e)))
}

impl BenchmarkBackend for CommandBackend {
    fn engine(&self) -> QueryEngine {
        self.engine
    }

    fn query_count(&self) -> usize {
        self.queries.len()
    }

    fn run_all_queries(&mut self, run_id: &str) -> Result<Vec<ResultRecord>, ExecutionError> {
        info!(engine = %self.engine, run_id, "begin benchmarking");
        let start_timestamp = Utc::now();

        execution_order(&self.queries)
            .into_iter()
            .map(|query| self.run_query(query, run_id, start_timestamp))
            .collect()
    }

    fn reset(&mut self) -> Result<(), ExecutionError> {
        if self.reset_command.is_empty() {
            return Ok(());
        }
        info!(engine = %self.engine, "resetting backend");
        run_command(&self.reset_command, "reset").map(|_| ())
    }
}

/// Counts resources by running one command per resource type
#[derive(Debug, Clone)]
pub struct CommandCounter {
    engine: QueryEngine,
    command: Vec<String>,
}

impl CommandCounter {
    pub fn new(engine: QueryEngine, command: Vec<String>) -> Self {
        Self { engine, command }
    }
}

impl ResourceCounter for CommandCounter {
    fn resource_counts(
        &mut self,
        resource_types: &[String],
    ) -> Result<ResourceCounts, ExecutionError> {
        let mut entries = Vec::with_capacity(resource_types.len());

        for resource_type in resource_types {
            let args: Vec<String> = self
                .command
                .iter()
                .map(|arg| render_template(arg, &[("resource_type", resource_type.as_str())]))
                .collect();

            let label = format!("count {}", resource_type);
            let stdout = run_command(&args, &label)?;
            let count = extract_count_from_output(&stdout).ok_or_else(|| {
                ExecutionError::MalformedOutput {
                    query: label.clone(),
                    reason: format!("no count found in output of {}", self.engine),
                }
            })?;
            entries.push((resource_type.clone(), count));
        }

        Ok(ResourceCounts::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QuerySource;
    use crate::record::QueryType;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn inline(source: &str) -> QuerySource {
        QuerySource::Inline {
            source: source.to_string(),
        }
    }

    #[test]
    fn test_render_template() {
        let vars = [("source", "SELECT {query}"), ("query", "diabetes")];
        assert_eq!(
            render_template("--execute={source} --name={query}", &vars),
            "--execute=SELECT {query} --name=diabetes"
        );
        assert_eq!(render_template("{unknown} {", &vars), "{unknown} {");
    }

    #[test]
    fn test_run_all_queries_writes_results() {
        let dir = tempfile::tempdir().unwrap();
        let queries = vec![
            QuerySpec::Extract {
                name: "gender-age".to_string(),
                source: inline("printf 'patient_id,gender\\np2,female\\np1,female\\n'"),
                columns: vec!["patient_id".to_string()],
                sort_by: Some("patient_id".to_string()),
            },
            QuerySpec::Count {
                name: "gender-age".to_string(),
                source: inline("echo 2"),
            },
            QuerySpec::Aggregate {
                name: "observations-by-code".to_string(),
                source: inline("printf 'code\\na\\nb\\na\\n'"),
                group_by: vec!["code".to_string()],
                count_column: "num_observations".to_string(),
            },
        ];

        let mut backend = CommandBackend::new(QueryEngine::Trino, sh("{source}"), queries)
            .with_output_dir(dir.path());
        let records = backend.run_all_queries("3").unwrap();

        assert_eq!(records.len(), 3);
        let types: Vec<QueryType> = records.iter().map(|r| r.query_type).collect();
        assert_eq!(
            types,
            vec![QueryType::Aggregate, QueryType::Count, QueryType::Extract]
        );
        for record in &records {
            assert_eq!(record.run_id, "3");
            assert_eq!(record.engine, QueryEngine::Trino);
            assert_eq!(record.start_timestamp, records[0].start_timestamp);
            record.check_timings().unwrap();
        }

        let extract =
            std::fs::read_to_string(dir.path().join("trino/extract/gender-age.csv")).unwrap();
        assert_eq!(extract, "patient_id\np1\np2\n");
        let count = std::fs::read_to_string(dir.path().join("trino/count/gender-age.csv")).unwrap();
        assert_eq!(count, "count\n2\n");
        let aggregate = std::fs::read_to_string(
            dir.path().join("trino/aggregate/observations-by-code.csv"),
        )
        .unwrap();
        assert_eq!(aggregate, "code,num_observations\na,2\nb,1\n");
    }

    #[test]
    fn test_failing_query_fails_whole_call() {
        let dir = tempfile::tempdir().unwrap();
        let queries = vec![
            QuerySpec::Count {
                name: "ok".to_string(),
                source: inline("echo 1"),
            },
            QuerySpec::Extract {
                name: "broken".to_string(),
                source: inline("echo boom >&2; exit 3"),
                columns: vec![],
                sort_by: None,
            },
        ];

        let mut backend = CommandBackend::new(QueryEngine::Pyrate, sh("{source}"), queries)
            .with_output_dir(dir.path());
        match backend.run_all_queries("0") {
            Err(ExecutionError::QueryFailed { query, stderr, .. }) => {
                assert_eq!(query, "broken");
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected QueryFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_column_is_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let queries = vec![QuerySpec::Extract {
            name: "e".to_string(),
            source: inline("printf 'a,b\\n1,2\\n'"),
            columns: vec!["c".to_string()],
            sort_by: None,
        }];
        let mut backend = CommandBackend::new(QueryEngine::Trino, sh("{source}"), queries)
            .with_output_dir(dir.path());
        assert!(matches!(
            backend.run_all_queries("0"),
            Err(ExecutionError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_empty_query_set_yields_no_records() {
        let mut backend = CommandBackend::new(QueryEngine::Pathling, sh("{source}"), vec![]);
        assert!(backend.run_all_queries("0").unwrap().is_empty());
    }

    #[test]
    fn test_reset_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reset");
        let mut backend = CommandBackend::new(QueryEngine::Pathling, sh("{source}"), vec![])
            .with_reset_command(sh(&format!("touch {}", marker.display())));
        backend.reset().unwrap();
        assert!(marker.exists());

        let mut failing = CommandBackend::new(QueryEngine::Pathling, sh("{source}"), vec![])
            .with_reset_command(sh("exit 1"));
        assert!(failing.reset().is_err());
    }

    #[test]
    fn test_command_counter() {
        let mut counter = CommandCounter::new(
            QueryEngine::Trino,
            sh("case {resource_type} in Patient) echo 10;; *) echo 5;; esac"),
        );
        let counts = counter
            .resource_counts(&["Patient".to_string(), "Observation".to_string()])
            .unwrap();
        assert_eq!(counts.get("Patient"), Some(10));
        assert_eq!(counts.get("Observation"), Some(5));
        assert_eq!(counts.total(), 15);

        let mut broken = CommandCounter::new(QueryEngine::Trino, sh("echo none"));
        assert!(broken.resource_counts(&["Patient".to_string()]).is_err());
    }

    #[test]
    fn test_stats_command_fills_server_timings() {
        let dir = tempfile::tempdir().unwrap();
        let queries = vec![QuerySpec::Count {
            name: "diabetes".to_string(),
            source: inline("echo 12"),
        }];
        let mut backend = CommandBackend::new(QueryEngine::Trino, sh("{source}"), queries)
            .with_output_dir(dir.path())
            .with_stats_command(sh(
                "test {query}-{query_type} = diabetes-count || exit 1; \
                 printf 'cpu_time_seconds,wall_time_seconds,elapsed_time_seconds\n0.5,0.75,1.5\n'",
            ));

        let records = backend.run_all_queries("0").unwrap();
        assert_eq!(
            records[0].server,
            ServerTimings {
                cpu_time_seconds: 0.5,
                wall_time_seconds: 0.75,
                elapsed_time_seconds: 1.5,
            }
        );
    }

    #[test]
    fn test_unreadable_stats_are_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let queries = vec![QuerySpec::Count {
            name: "diabetes".to_string(),
            source: inline("echo 12"),
        }];
        let mut backend = CommandBackend::new(QueryEngine::Trino, sh("{source}"), queries)
            .with_output_dir(dir.path())
            .with_stats_command(sh("echo 'query stats unavailable'"));
        assert!(matches!(
            backend.run_all_queries("0"),
            Err(ExecutionError::MalformedOutput { .. })
        ));

        assert!(parse_server_timings("").is_err());
        assert!(
            parse_server_timings(
                "cpu_time_seconds,wall_time_seconds,elapsed_time_seconds\n-1,0,0\n"
            )
            .is_err()
        );
    }
}
