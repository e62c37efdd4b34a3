//! Restoring the shared host to a clean baseline between backend phases.
//!
//! Backends share memory, page cache, and background containers, so each
//! phase is followed by container restarts, optional cache clearing, and a
//! cooldown. Every step is best-effort: failures are collected and reported
//! to the caller, which logs them and carries on.

use std::collections::HashMap;
use std::fmt;
use std::process::Command;
use std::thread;
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, info, warn};

use crate::error::StabilizationError;
use crate::record::QueryEngine;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Identifies the phase that just finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLabel {
    pub round: usize,
    pub engine: QueryEngine,
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} round {}", self.engine, self.round)
    }
}

/// Restarts named external processes
pub trait ContainerManager {
    fn restart(&self, name: &str) -> Result<(), StabilizationError>;
}

/// Container manager backed by the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different CLI binary (e.g. `podman`)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerManager for DockerCli {
    fn restart(&self, name: &str) -> Result<(), StabilizationError> {
        let output = Command::new(&self.binary)
            .args(["restart", name])
            .output()
            .map_err(|e| StabilizationError::Restart {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(StabilizationError::Restart {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Resets the shared environment after a phase
pub trait ResourceStabilizer {
    fn stabilize(&mut self, phase: &PhaseLabel) -> Result<(), StabilizationError>;
}

/// Run one cache-clearing command, failing on spawn errors or a non-zero exit
fn run_cache_step(program: &str, args: &[&str]) -> Result<(), StabilizationError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| StabilizationError::CacheClear(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        return Err(StabilizationError::CacheClear(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Drop OS file caches (needs sudo on Linux and macOS)
pub fn clear_system_cache() -> Result<(), StabilizationError> {
    #[cfg(target_os = "macos")]
    {
        run_cache_step("sudo", &["purge"])
    }

    #[cfg(target_os = "linux")]
    {
        // Dirty pages survive drop_caches, so flush them first
        run_cache_step("sync", &[])?;
        run_cache_step(
            "sh",
            &["-c", "echo 3 | sudo -n tee /proc/sys/vm/drop_caches >/dev/null"],
        )
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(StabilizationError::CacheClear(
            "not supported on this platform".to_string(),
        ))
    }
}

/// Stabilizer for a single host: restart the phase's containers, optionally
/// drop caches, then wait out the cooldown.
pub struct HostStabilizer<C: ContainerManager> {
    containers: C,
    restarts: HashMap<QueryEngine, Vec<String>>,
    clear_cache: bool,
    cooldown: Duration,
    system: System,
}

impl<C: ContainerManager> HostStabilizer<C> {
    pub fn new(containers: C) -> Self {
        Self {
            containers,
            restarts: HashMap::new(),
            clear_cache: false,
            cooldown: DEFAULT_COOLDOWN,
            system: System::new(),
        }
    }

    /// Containers restarted after every phase of `engine`
    pub fn restart_after(mut self, engine: QueryEngine, containers: Vec<String>) -> Self {
        self.restarts.entry(engine).or_default().extend(containers);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_cache_clearing(mut self, clear_cache: bool) -> Self {
        self.clear_cache = clear_cache;
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn log_memory(&mut self, phase: &PhaseLabel) {
        self.system.refresh_memory();
        let used_mb = self.system.used_memory() as f64 / 1_048_576.0;
        let total_mb = self.system.total_memory() as f64 / 1_048_576.0;
        debug!(
            phase = %phase,
            used_memory_mb = used_mb.round(),
            total_memory_mb = total_mb.round(),
            "host memory after stabilization"
        );
    }
}

impl<C: ContainerManager> ResourceStabilizer for HostStabilizer<C> {
    fn stabilize(&mut self, phase: &PhaseLabel) -> Result<(), StabilizationError> {
        let mut failures = Vec::new();

        if let Some(names) = self.restarts.get(&phase.engine) {
            for name in names {
                info!(phase = %phase, container = name.as_str(), "restarting container");
                if let Err(e) = self.containers.restart(name) {
                    warn!(phase = %phase, error = %e, "container restart failed");
                    failures.push(e);
                }
            }
        }

        if self.clear_cache {
            if let Err(e) = clear_system_cache() {
                warn!(phase = %phase, error = %e, "cache clearing failed");
                failures.push(e);
            }
        }

        if !self.cooldown.is_zero() {
            info!(
                phase = %phase,
                cooldown_seconds = self.cooldown.as_secs_f64(),
                "waiting for resource usage to settle"
            );
            thread::sleep(self.cooldown);
        }

        self.log_memory(phase);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StabilizationError::Steps(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingManager {
        restarted: RefCell<Vec<String>>,
        broken: Vec<String>,
    }

    impl ContainerManager for RecordingManager {
        fn restart(&self, name: &str) -> Result<(), StabilizationError> {
            self.restarted.borrow_mut().push(name.to_string());
            if self.broken.iter().any(|b| b == name) {
                return Err(StabilizationError::Restart {
                    name: name.to_string(),
                    reason: "no such container".to_string(),
                });
            }
            Ok(())
        }
    }

    fn phase(engine: QueryEngine) -> PhaseLabel {
        PhaseLabel { round: 0, engine }
    }

    #[test]
    fn test_restarts_only_phase_containers() {
        let mut stabilizer = HostStabilizer::new(RecordingManager::default())
            .restart_after(
                QueryEngine::Trino,
                vec!["minio-1".to_string(), "trino-1".to_string()],
            )
            .restart_after(QueryEngine::Pyrate, vec!["blaze-1".to_string()])
            .with_cooldown(Duration::ZERO);

        stabilizer.stabilize(&phase(QueryEngine::Trino)).unwrap();
        assert_eq!(
            *stabilizer.containers.restarted.borrow(),
            vec!["minio-1".to_string(), "trino-1".to_string()]
        );

        stabilizer.stabilize(&phase(QueryEngine::Pathling)).unwrap();
        assert_eq!(stabilizer.containers.restarted.borrow().len(), 2);
    }

    #[test]
    fn test_failed_restart_does_not_stop_other_steps() {
        let manager = RecordingManager {
            broken: vec!["minio-1".to_string()],
            ..Default::default()
        };
        let mut stabilizer = HostStabilizer::new(manager)
            .restart_after(
                QueryEngine::Trino,
                vec!["minio-1".to_string(), "trino-1".to_string()],
            )
            .with_cooldown(Duration::ZERO);

        let err = stabilizer.stabilize(&phase(QueryEngine::Trino)).unwrap_err();
        assert!(matches!(err, StabilizationError::Steps(ref steps) if steps.len() == 1));
        // The second container was still restarted
        assert_eq!(stabilizer.containers.restarted.borrow().len(), 2);
    }

    #[test]
    fn test_cooldown_waits() {
        let mut stabilizer = HostStabilizer::new(RecordingManager::default())
            .with_cooldown(Duration::from_millis(50));
        let start = std::time::Instant::now();
        stabilizer.stabilize(&phase(QueryEngine::Pyrate)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_docker_cli_reports_spawn_failure() {
        let cli = DockerCli::with_binary("definitely-not-a-container-cli");
        assert!(matches!(
            cli.restart("trino-1"),
            Err(StabilizationError::Restart { .. })
        ));
    }

    #[test]
    fn test_cache_step_failures_are_reported() {
        assert!(matches!(
            run_cache_step("definitely-not-sync", &[]),
            Err(StabilizationError::CacheClear(_))
        ));
        match run_cache_step("sh", &["-c", "echo 'sudo: a password is required' >&2; exit 1"]) {
            Err(StabilizationError::CacheClear(reason)) => {
                assert!(reason.contains("password is required"), "{}", reason)
            }
            other => panic!("expected a cache-clear failure, got {:?}", other),
        }
        assert!(run_cache_step("sh", &["-c", "true"]).is_ok());
    }

    #[test]
    fn test_phase_label_display() {
        assert_eq!(
            PhaseLabel {
                round: 2,
                engine: QueryEngine::Pathling
            }
            .to_string(),
            "pathling round 2"
        );
    }
}
