use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::ExecutionError;

/// Slack allowed when checking that timing components fit inside the total.
/// Components are measured with separate clock reads, so they can overshoot
/// the total by a few nanoseconds.
const TIMING_EPSILON_SECONDS: f64 = 1e-6;

/// Shape of a query's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Grouped aggregate
    Aggregate,
    /// Scalar count
    Count,
    /// Row extraction
    Extract,
}

impl QueryType {
    /// All query types in execution order
    pub fn all() -> [QueryType; 3] {
        [QueryType::Aggregate, QueryType::Count, QueryType::Extract]
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryType::Aggregate => "aggregate",
            QueryType::Count => "count",
            QueryType::Extract => "extract",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Label identifying which engine produced a record.
///
/// Never drives control flow: the orchestrator only sees the list of backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryEngine {
    Pathling,
    Pyrate,
    Trino,
}

impl QueryEngine {
    pub fn name(&self) -> &'static str {
        match self {
            QueryEngine::Pathling => "pathling",
            QueryEngine::Pyrate => "pyrate",
            QueryEngine::Trino => "trino",
        }
    }
}

impl fmt::Display for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server-reported timings; only some engines expose these
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerTimings {
    pub cpu_time_seconds: f64,
    pub wall_time_seconds: f64,
    pub elapsed_time_seconds: f64,
}

/// One measured query execution within one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: String,
    /// When the backend phase that produced this record began
    pub start_timestamp: DateTime<Utc>,
    pub engine: QueryEngine,
    pub query: String,
    pub query_type: QueryType,
    pub total_duration_seconds: f64,
    pub write_to_file_duration_seconds: f64,
    pub fetch_duration_seconds: f64,
    pub post_process_duration_seconds: f64,
    pub server: ServerTimings,
}

impl ResultRecord {
    /// Record with only a total duration; the decomposed components stay zero
    pub fn new(
        run_id: impl Into<String>,
        start_timestamp: DateTime<Utc>,
        engine: QueryEngine,
        query: impl Into<String>,
        query_type: QueryType,
        total_duration_seconds: f64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            start_timestamp,
            engine,
            query: query.into(),
            query_type,
            total_duration_seconds,
            write_to_file_duration_seconds: 0.0,
            fetch_duration_seconds: 0.0,
            post_process_duration_seconds: 0.0,
            server: ServerTimings::default(),
        }
    }

    /// Key that must be unique across a result table
    pub fn key(&self) -> RecordKey {
        RecordKey {
            run_id: self.run_id.clone(),
            engine: self.engine,
            query_type: self.query_type,
            query: self.query.clone(),
        }
    }

    /// Check the timing invariants: every component is non-negative and the
    /// decomposed parts never exceed the end-to-end total.
    pub fn check_timings(&self) -> Result<(), ExecutionError> {
        let components = [
            ("total", self.total_duration_seconds),
            ("write_to_file", self.write_to_file_duration_seconds),
            ("fetch", self.fetch_duration_seconds),
            ("post_process", self.post_process_duration_seconds),
        ];
        for (name, value) in components {
            if !value.is_finite() || value < 0.0 {
                return Err(ExecutionError::Contract(format!(
                    "query `{}` reported invalid {} duration {}",
                    self.query, name, value
                )));
            }
        }

        let parts = self.write_to_file_duration_seconds
            + self.fetch_duration_seconds
            + self.post_process_duration_seconds;
        if parts > self.total_duration_seconds + TIMING_EPSILON_SECONDS {
            return Err(ExecutionError::Contract(format!(
                "query `{}` timing components ({:.6}s) exceed total ({:.6}s)",
                self.query, parts, self.total_duration_seconds
            )));
        }
        Ok(())
    }
}

/// Identity of a record inside a result table.
///
/// The query type is part of the key because one query name is reused across
/// types (`gender-age` exists as both a count and an extract), so
/// `(run_id, engine, query)` alone would reject legitimate phases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub run_id: String,
    pub engine: QueryEngine,
    pub query_type: QueryType,
    pub query: String,
}

/// Reference resource counts captured once before the first round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceCounts {
    entries: Vec<(String, u64)>,
}

impl ResourceCounts {
    pub fn new(entries: Vec<(String, u64)>) -> Self {
        Self { entries }
    }

    /// Counts in configured resource-type order
    pub fn entries(&self) -> &[(String, u64)] {
        &self.entries
    }

    pub fn get(&self, resource_type: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(name, _)| name == resource_type)
            .map(|(_, count)| *count)
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, count)| count).sum()
    }
}

/// Append-only accumulator of records for one run
#[derive(Debug, Default)]
pub struct ResultTable {
    records: Vec<ResultRecord>,
    keys: HashSet<RecordKey>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append all records of one phase.
    ///
    /// Either every record is appended or none is: a key collision with an
    /// existing row (or within the batch) rejects the whole batch.
    pub fn append_phase(&mut self, records: Vec<ResultRecord>) -> Result<usize, ExecutionError> {
        let mut batch_keys = HashSet::with_capacity(records.len());
        for record in &records {
            let key = record.key();
            if self.keys.contains(&key) || !batch_keys.insert(key) {
                return Err(ExecutionError::Contract(format!(
                    "duplicate record for run {} engine {} {} query `{}`",
                    record.run_id, record.engine, record.query_type, record.query
                )));
            }
        }

        let appended = records.len();
        self.keys.extend(batch_keys);
        self.records.extend(records);
        Ok(appended)
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records produced by each engine, in first-seen order
    pub fn counts_by_engine(&self) -> Vec<(QueryEngine, usize)> {
        let mut counts: Vec<(QueryEngine, usize)> = Vec::new();
        for record in &self.records {
            match counts.iter_mut().find(|(engine, _)| *engine == record.engine) {
                Some((_, count)) => *count += 1,
                None => counts.push((record.engine, 1)),
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str, engine: QueryEngine, query: &str) -> ResultRecord {
        ResultRecord::new(run_id, Utc::now(), engine, query, QueryType::Extract, 1.0)
    }

    #[test]
    fn test_append_rejects_duplicates_atomically() {
        let mut table = ResultTable::new();
        table
            .append_phase(vec![record("0", QueryEngine::Trino, "diabetes")])
            .unwrap();

        let result = table.append_phase(vec![
            record("0", QueryEngine::Trino, "hemoglobin"),
            record("0", QueryEngine::Trino, "diabetes"),
        ]);
        assert!(result.is_err());
        assert_eq!(table.len(), 1);

        // Same query name in another round or engine is fine
        table
            .append_phase(vec![
                record("1", QueryEngine::Trino, "diabetes"),
                record("0", QueryEngine::Pyrate, "diabetes"),
            ])
            .unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_same_name_different_type_is_distinct() {
        let mut table = ResultTable::new();
        let mut count = record("0", QueryEngine::Pathling, "gender-age");
        count.query_type = QueryType::Count;
        table
            .append_phase(vec![record("0", QueryEngine::Pathling, "gender-age"), count])
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_check_timings() {
        let mut rec = record("0", QueryEngine::Trino, "q");
        rec.fetch_duration_seconds = 0.6;
        rec.write_to_file_duration_seconds = 0.3;
        assert!(rec.check_timings().is_ok());

        rec.post_process_duration_seconds = 0.2;
        assert!(rec.check_timings().is_err());

        let mut negative = record("0", QueryEngine::Trino, "q");
        negative.fetch_duration_seconds = -0.1;
        assert!(negative.check_timings().is_err());
    }

    #[test]
    fn test_resource_counts_total_and_order() {
        let counts = ResourceCounts::new(vec![
            ("Patient".to_string(), 10),
            ("Observation".to_string(), 250),
            ("Condition".to_string(), 40),
        ]);
        assert_eq!(counts.total(), 300);
        assert_eq!(counts.get("Observation"), Some(250));
        assert_eq!(counts.get("Encounter"), None);
        assert_eq!(counts.entries()[0].0, "Patient");
    }

    #[test]
    fn test_counts_by_engine() {
        let mut table = ResultTable::new();
        table
            .append_phase(vec![
                record("0", QueryEngine::Trino, "a"),
                record("0", QueryEngine::Trino, "b"),
            ])
            .unwrap();
        table
            .append_phase(vec![record("0", QueryEngine::Pyrate, "a")])
            .unwrap();
        assert_eq!(
            table.counts_by_engine(),
            vec![(QueryEngine::Trino, 2), (QueryEngine::Pyrate, 1)]
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(QueryType::Aggregate.to_string(), "aggregate");
        assert_eq!(QueryEngine::Pathling.to_string(), "pathling");
        assert_eq!(
            QueryType::all(),
            [QueryType::Aggregate, QueryType::Count, QueryType::Extract]
        );
    }
}
