//! Configuration loading from fhirbench.toml
//!
//! The file describes the run parameters, the command used to establish the
//! reference resource counts, and one `[[backend]]` table per engine. When no
//! path is given it is discovered by walking up from the current directory.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BenchmarkBackend, CommandBackend, CommandCounter};
use crate::error::RunError;
use crate::orchestrator::RunConfig;
use crate::query::QuerySpec;
use crate::record::{QueryEngine, QueryType};
use crate::retry::RetryPolicy;
use crate::sink::CsvSink;
use crate::stabilizer::{DockerCli, HostStabilizer};

pub const CONFIG_FILE_NAME: &str = "fhirbench.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub run: RunSection,
    /// Designated backend for the reference resource counts
    pub counts: CountsSection,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
    /// Directory of the loaded file; relative `source_file` paths resolve here
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after each phase (e.g. "30s", "500ms")
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<String>,
    /// Where the run's CSV lands
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Where per-query result files land
    #[serde(default = "default_query_output_dir")]
    pub query_output_dir: PathBuf,
    #[serde(default)]
    pub clear_cache: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            max_attempts: default_max_attempts(),
            cooldown: default_cooldown(),
            resource_types: default_resource_types(),
            output_dir: default_output_dir(),
            query_output_dir: default_query_output_dir(),
            clear_cache: false,
        }
    }
}

fn default_rounds() -> usize {
    crate::orchestrator::DEFAULT_ROUNDS
}
fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}
fn default_cooldown() -> String {
    "30s".to_string()
}
fn default_resource_types() -> Vec<String> {
    RunConfig::default().resource_types
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("results/benchmark-runs")
}
fn default_query_output_dir() -> PathBuf {
    PathBuf::from("results")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountsSection {
    pub engine: QueryEngine,
    /// Run once per resource type with `{resource_type}` substituted
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub engine: QueryEngine,
    /// Run once per query; see `CommandBackend` for placeholders
    pub command: Vec<String>,
    #[serde(default)]
    pub reset_command: Vec<String>,
    /// Reports the engine's own timings after each query
    #[serde(default)]
    pub stats_command: Vec<String>,
    /// Containers restarted after each of this backend's phases
    #[serde(default)]
    pub restart_containers: Vec<String>,
    #[serde(default, rename = "query")]
    pub queries: Vec<QuerySpec>,
}

/// Values given on the command line; `None` keeps the file's value
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rounds: Option<usize>,
    pub max_attempts: Option<u32>,
    pub cooldown: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub clear_cache: bool,
}

impl BenchConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.validate()?;
        Ok(config)
    }

    /// Find fhirbench.toml by walking up from the current directory
    pub fn discover() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Check everything that would otherwise fail halfway through a run
    pub fn validate(&self) -> Result<(), RunError> {
        let invalid = |msg: String| -> Result<(), RunError> { Err(RunError::Config(msg)) };

        if self.run.rounds == 0 {
            return invalid("run.rounds must be at least 1".to_string());
        }
        if self.run.max_attempts == 0 {
            return invalid("run.max_attempts must be at least 1".to_string());
        }
        if self.run.resource_types.is_empty() {
            return invalid("run.resource_types must name at least one resource type".to_string());
        }
        if let Err(e) = parse_duration(&self.run.cooldown) {
            return invalid(format!("run.cooldown: {}", e));
        }
        if self.counts.command.is_empty() {
            return invalid("counts.command must not be empty".to_string());
        }

        let mut engines = HashSet::new();
        for backend in &self.backends {
            if !engines.insert(backend.engine) {
                return invalid(format!("backend `{}` is configured twice", backend.engine));
            }
            if backend.command.is_empty() {
                return invalid(format!("backend `{}` has an empty command", backend.engine));
            }

            let mut queries: HashSet<(QueryType, &str)> = HashSet::new();
            for query in &backend.queries {
                if !queries.insert((query.query_type(), query.name())) {
                    return invalid(format!(
                        "backend `{}` declares {} query `{}` twice",
                        backend.engine,
                        query.query_type(),
                        query.name()
                    ));
                }
                if let QuerySpec::Aggregate { group_by, .. } = query {
                    if group_by.is_empty() {
                        return invalid(format!(
                            "aggregate query `{}` of backend `{}` needs group_by columns",
                            query.name(),
                            backend.engine
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply command-line values on top of the file and re-validate
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<(), RunError> {
        if let Some(rounds) = overrides.rounds {
            self.run.rounds = rounds;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.run.max_attempts = max_attempts;
        }
        if let Some(cooldown) = &overrides.cooldown {
            self.run.cooldown = cooldown.clone();
        }
        if let Some(output_dir) = &overrides.output_dir {
            self.run.output_dir = output_dir.clone();
        }
        if overrides.clear_cache {
            self.run.clear_cache = true;
        }
        self.validate()
    }

    pub fn cooldown(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.run.cooldown)
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            rounds: self.run.rounds,
            retry: RetryPolicy::new(self.run.max_attempts),
            resource_types: self.run.resource_types.clone(),
        }
    }

    /// Backends in declared order
    pub fn build_backends(&self) -> Vec<Box<dyn BenchmarkBackend>> {
        self.backends
            .iter()
            .map(|backend| {
                Box::new(
                    CommandBackend::new(
                        backend.engine,
                        backend.command.clone(),
                        backend.queries.clone(),
                    )
                    .with_reset_command(backend.reset_command.clone())
                    .with_stats_command(backend.stats_command.clone())
                    .with_base_dir(&self.base_dir)
                    .with_output_dir(&self.run.query_output_dir),
                ) as Box<dyn BenchmarkBackend>
            })
            .collect()
    }

    pub fn build_counter(&self) -> CommandCounter {
        CommandCounter::new(self.counts.engine, self.counts.command.clone())
    }

    pub fn build_stabilizer(&self) -> anyhow::Result<HostStabilizer<DockerCli>> {
        let mut stabilizer = HostStabilizer::new(DockerCli::new())
            .with_cooldown(self.cooldown()?)
            .with_cache_clearing(self.run.clear_cache);
        for backend in &self.backends {
            if !backend.restart_containers.is_empty() {
                stabilizer =
                    stabilizer.restart_after(backend.engine, backend.restart_containers.clone());
            }
        }
        Ok(stabilizer)
    }

    pub fn build_sink(&self) -> CsvSink {
        CsvSink::new(&self.run.output_dir)
    }
}

/// Parse a duration string (e.g. "30s", "500ms", "2m"); a bare number is seconds
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration string"));
    }

    // Find where the number ends and unit begins
    let (num_part, unit_part) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| s.split_at(i))
        .unwrap_or((s, "s"));

    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid duration number: {}", num_part))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("Duration must be non-negative: {}", s));
    }

    let seconds_per_unit = match unit_part.to_lowercase().as_str() {
        "ns" => 1e-9,
        "us" | "µs" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" | "min" => 60.0,
        _ => return Err(anyhow!("Unknown duration unit: {}", unit_part)),
    };

    Ok(Duration::from_secs_f64(value * seconds_per_unit))
}
