//! Per-query configuration.
//!
//! Each variant carries only the fields its result shape needs, so a count
//! query cannot be given grouping columns and an extract cannot be given an
//! aggregation target.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::record::QueryType;

/// Where the query text comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySource {
    Inline { source: String },
    File { source_file: PathBuf },
}

impl QuerySource {
    /// Load the query text, resolving relative files against `base_dir`
    pub fn load(&self, base_dir: &Path) -> std::io::Result<String> {
        match self {
            QuerySource::Inline { source } => Ok(source.clone()),
            QuerySource::File { source_file } => {
                let path = if source_file.is_absolute() {
                    source_file.clone()
                } else {
                    base_dir.join(source_file)
                };
                Ok(std::fs::read_to_string(path)?.trim().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QuerySpec {
    /// Grouped counts over the fetched rows
    Aggregate {
        name: String,
        #[serde(flatten)]
        source: QuerySource,
        group_by: Vec<String>,
        #[serde(default = "default_count_column")]
        count_column: String,
    },
    /// Single scalar count
    Count {
        name: String,
        #[serde(flatten)]
        source: QuerySource,
    },
    /// Row extraction, optionally projected and sorted
    Extract {
        name: String,
        #[serde(flatten)]
        source: QuerySource,
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        sort_by: Option<String>,
    },
}

fn default_count_column() -> String {
    "num_observations".to_string()
}

impl QuerySpec {
    pub fn name(&self) -> &str {
        match self {
            QuerySpec::Aggregate { name, .. }
            | QuerySpec::Count { name, .. }
            | QuerySpec::Extract { name, .. } => name,
        }
    }

    pub fn query_type(&self) -> QueryType {
        match self {
            QuerySpec::Aggregate { .. } => QueryType::Aggregate,
            QuerySpec::Count { .. } => QueryType::Count,
            QuerySpec::Extract { .. } => QueryType::Extract,
        }
    }

    pub fn source(&self) -> &QuerySource {
        match self {
            QuerySpec::Aggregate { source, .. }
            | QuerySpec::Count { source, .. }
            | QuerySpec::Extract { source, .. } => source,
        }
    }
}

/// Order queries for execution: by query type, then declaration order
pub fn execution_order(queries: &[QuerySpec]) -> Vec<&QuerySpec> {
    QueryType::all()
        .into_iter()
        .flat_map(|query_type| queries.iter().filter(move |q| q.query_type() == query_type))
        .collect()
}
