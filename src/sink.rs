use chrono::{DateTime, Local, Utc};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::RunError;
use crate::record::{ResourceCounts, ResultRecord, ResultTable};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// Persists the finished result table
pub trait ResultSink {
    fn persist(
        &self,
        table: &ResultTable,
        benchmark_timestamp: DateTime<Utc>,
        counts: &ResourceCounts,
    ) -> Result<PathBuf, RunError>;
}

/// Column names, with one count column per resource type in configured order
pub fn header(counts: &ResourceCounts) -> Vec<String> {
    let mut columns: Vec<String> = [
        "run_id",
        "start_timestamp",
        "engine",
        "query",
        "query_type",
        "total_duration_seconds",
        "write_to_file_duration_seconds",
        "fetch_duration_seconds",
        "post_process_duration_seconds",
        "trino_cpu_time_seconds",
        "trino_wall_time_seconds",
        "trino_elapsed_time_seconds",
        "benchmark_timestamp",
        "resource_count_total",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    for (resource_type, _) in counts.entries() {
        columns.push(format!("resource_count_{}", resource_type.to_lowercase()));
    }
    columns
}

fn row(
    record: &ResultRecord,
    benchmark_timestamp: &str,
    counts: &ResourceCounts,
) -> Vec<String> {
    let mut fields = vec![
        record.run_id.clone(),
        record.start_timestamp.format(TIMESTAMP_FORMAT).to_string(),
        record.engine.to_string(),
        record.query.clone(),
        record.query_type.to_string(),
        record.total_duration_seconds.to_string(),
        record.write_to_file_duration_seconds.to_string(),
        record.fetch_duration_seconds.to_string(),
        record.post_process_duration_seconds.to_string(),
        record.server.cpu_time_seconds.to_string(),
        record.server.wall_time_seconds.to_string(),
        record.server.elapsed_time_seconds.to_string(),
        benchmark_timestamp.to_string(),
        counts.total().to_string(),
    ];
    fields.extend(counts.entries().iter().map(|(_, count)| count.to_string()));
    fields
}

/// Write the enriched table as CSV. The run-wide columns carry the same
/// values on every row.
pub fn write_table<W: Write>(
    writer: W,
    table: &ResultTable,
    benchmark_timestamp: DateTime<Utc>,
    counts: &ResourceCounts,
) -> csv::Result<()> {
    let benchmark_timestamp = benchmark_timestamp.format(TIMESTAMP_FORMAT).to_string();
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(header(counts))?;
    for record in table.records() {
        wtr.write_record(row(record, &benchmark_timestamp, counts))?;
    }
    wtr.flush()?;
    Ok(())
}

/// File name for one run: capture time plus the total reference count
pub fn result_file_name(captured_at: DateTime<Local>, counts: &ResourceCounts) -> String {
    format!(
        "{}-{}-benchmark-results.csv",
        captured_at.format("%Y%m%d-%H%M%S"),
        counts.total()
    )
}

/// Writes one CSV per run into a directory, atomically
#[derive(Debug, Clone)]
pub struct CsvSink {
    output_dir: PathBuf,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_atomic(
        &self,
        path: &Path,
        table: &ResultTable,
        benchmark_timestamp: DateTime<Utc>,
        counts: &ResourceCounts,
    ) -> io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;

        // Same directory as the target so the rename cannot cross filesystems
        let mut tmp = NamedTempFile::new_in(&self.output_dir)?;
        write_table(&mut tmp, table, benchmark_timestamp, counts)?;
        tmp.as_file().sync_all()?;
        // Temp files are created owner-only; results are read by other tools
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ResultSink for CsvSink {
    fn persist(
        &self,
        table: &ResultTable,
        benchmark_timestamp: DateTime<Utc>,
        counts: &ResourceCounts,
    ) -> Result<PathBuf, RunError> {
        let path = self
            .output_dir
            .join(result_file_name(Local::now(), counts));

        self.write_atomic(&path, table, benchmark_timestamp, counts)
            .map_err(|source| RunError::Persistence {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }
}
