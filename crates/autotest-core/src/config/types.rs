//! Configuration type definitions for the grading service
//!
//! Every field carries a default so that a minimal YAML file (or none at all)
//! yields a usable single-worker setup. The loaded value is immutable and is
//! handed to each component at construction.

use crate::errors::AutotestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Queue names understood by the broker, in default priority order.
pub const KNOWN_QUEUES: [&str; 4] = ["settings", "high", "low", "batch"];

/// Resource limit names accepted in `rlimit_settings`.
pub const KNOWN_RLIMITS: [&str; 10] = [
    "nproc", "cpu", "fsize", "data", "stack", "core", "rss", "nofile", "as", "memlock",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotestConfig {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_supervisor_url")]
    pub supervisor_url: String,
    /// `(soft, hard)` pairs keyed by limit name; negative values mean unlimited
    #[serde(default = "default_rlimit_settings")]
    pub rlimit_settings: BTreeMap<String, (i64, i64)>,
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_settings_job_timeout")]
    pub settings_job_timeout: u64,
    #[serde(default = "default_ttl")]
    pub result_ttl: u64,
    #[serde(default = "default_ttl")]
    pub feedback_ttl: u64,
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    /// Directory containing the `testers/` package imported by tester subprocesses
    #[serde(default = "default_testers_dir")]
    pub testers_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub user: String,
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<String>,
    #[serde(default)]
    pub resources: Option<WorkerResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    #[serde(default)]
    pub port: Option<PortRange>,
    #[serde(default)]
    pub postgresql_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit: u64,
    #[serde(default = "default_true")]
    pub allow_high_priority: bool,
    /// When set, error bodies are returned without api-key redaction
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default)]
    pub error_log: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_rate_limit: default_rate_limit(),
            allow_high_priority: true,
            debug: false,
            access_log: None,
            error_log: None,
        }
    }
}

impl Default for AutotestConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            redis_url: default_redis_url(),
            supervisor_url: default_supervisor_url(),
            rlimit_settings: default_rlimit_settings(),
            workers: default_workers(),
            server: ServerSettings::default(),
            settings_job_timeout: default_settings_job_timeout(),
            result_ttl: default_ttl(),
            feedback_ttl: default_ttl(),
            timeout_multiplier: default_timeout_multiplier(),
            testers_dir: default_testers_dir(),
        }
    }
}

impl AutotestConfig {
    pub fn scripts_dir(&self) -> PathBuf {
        self.workspace.join("scripts")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.workspace.join("workers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace.join("logs")
    }

    /// Scratch directory used as the cwd of every test run by `user`.
    pub fn worker_dir(&self, user: &str) -> PathBuf {
        self.workers_dir().join(user)
    }

    /// Shared environment handed to testers that need no isolated one.
    pub fn default_env_dir(&self) -> PathBuf {
        self.scripts_dir().join("defaultvenv")
    }

    pub fn settings_dir(&self, settings_id: i64) -> PathBuf {
        self.scripts_dir().join(settings_id.to_string())
    }

    pub fn worker(&self, user: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.user == user)
    }

    pub fn validate(&self) -> Result<(), AutotestError> {
        if self.workspace.as_os_str().is_empty() {
            return Err(AutotestError::ConfigError(
                "workspace must not be empty".to_string(),
            ));
        }

        for worker in &self.workers {
            if worker.user.trim().is_empty() {
                return Err(AutotestError::ConfigError(
                    "worker user must not be empty".to_string(),
                ));
            }
            if worker.queues.is_empty() {
                return Err(AutotestError::ConfigError(format!(
                    "worker '{}' has no queues",
                    worker.user
                )));
            }
            if let Some(queue) = worker
                .queues
                .iter()
                .find(|q| !KNOWN_QUEUES.contains(&q.as_str()))
            {
                return Err(AutotestError::ConfigError(format!(
                    "worker '{}' references unknown queue '{}'",
                    worker.user, queue
                )));
            }
            if let Some(port) = worker.resources.as_ref().and_then(|r| r.port) {
                if port.min > port.max {
                    return Err(AutotestError::ConfigError(format!(
                        "worker '{}' has an empty port range {}..{}",
                        worker.user, port.min, port.max
                    )));
                }
            }
        }

        for (name, (soft, hard)) in &self.rlimit_settings {
            if !KNOWN_RLIMITS.contains(&name.as_str()) {
                return Err(AutotestError::ConfigError(format!(
                    "unknown rlimit '{}'",
                    name
                )));
            }
            if *soft >= 0 && *hard >= 0 && soft > hard {
                return Err(AutotestError::ConfigError(format!(
                    "rlimit '{}' has soft limit {} above hard limit {}",
                    name, soft, hard
                )));
            }
        }

        if self.timeout_multiplier <= 0.0 {
            return Err(AutotestError::ConfigError(
                "timeout_multiplier must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from("/home/autotest/workspace")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_supervisor_url() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_rlimit_settings() -> BTreeMap<String, (i64, i64)> {
    let mut limits = BTreeMap::new();
    limits.insert("nproc".to_string(), (300, 300));
    limits
}

fn default_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig {
        user: "autotst0".to_string(),
        queues: default_worker_queues(),
        resources: None,
    }]
}

fn default_worker_queues() -> Vec<String> {
    vec!["high".to_string(), "low".to_string(), "batch".to_string()]
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_rate_limit() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_settings_job_timeout() -> u64 {
    600
}

fn default_ttl() -> u64 {
    3600
}

fn default_timeout_multiplier() -> f64 {
    1.5
}

fn default_testers_dir() -> PathBuf {
    PathBuf::from("/home/autotest/testers")
}
