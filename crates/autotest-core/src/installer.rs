//! Host installation: prerequisite checks, workspace layout and tester
//! installation followed by publishing the settings schema.

use crate::config::AutotestConfig;
use crate::errors::AutotestError;
use crate::kv::KvStore;
use crate::resources::check_database;
use crate::runner::files::set_mode;
use crate::schema;
use crate::testers::{get_tester, run_checked, TESTER_NAMES};
use crate::users;
use serde_json::Value;
use std::fmt;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub outcome: Result<(), String>,
}

impl Check {
    fn new(name: impl Into<String>, outcome: Result<(), AutotestError>) -> Self {
        Self {
            name: name.into(),
            outcome: outcome.map_err(|e| e.to_string()),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(()) => write!(f, "[ok]     {}", self.name),
            Err(e) => write!(f, "[failed] {}: {}", self.name, e),
        }
    }
}

/// Verify that the host can run the configured workers.
pub async fn check_environment(config: &AutotestConfig, kv: &dyn KvStore) -> Vec<Check> {
    let mut checks = vec![Check::new("key-value store reachable", kv.ping().await)];
    let current = users::current_user();

    for worker in &config.workers {
        let user = &worker.user;
        let exists = match users::user_id(user) {
            Some(_) => Ok(()),
            None => Err(AutotestError::ConfigError(format!("user '{}' does not exist", user))),
        };
        let exists_ok = exists.is_ok();
        checks.push(Check::new(format!("worker user {} exists", user), exists));
        if !exists_ok {
            continue;
        }

        if current.as_deref().ok() != Some(user.as_str()) {
            let mut cmd = Command::new("sudo");
            cmd.args(["-u", user, "--", "echo", "test"]);
            checks.push(Check::new(
                format!("current user can run commands as {}", user),
                run_checked(cmd, &format!("sudo as {}", user)).await,
            ));

            let joined = match &current {
                Ok(me) if users::user_in_group(me, user) => Ok(()),
                Ok(me) => Err(AutotestError::ConfigError(format!(
                    "user '{}' is not a member of group '{}'",
                    me, user
                ))),
                Err(e) => Err(AutotestError::ConfigError(e.to_string())),
            };
            checks.push(Check::new(format!("current user in group {}", user), joined));
        }

        if let Some(url) = worker.resources.as_ref().and_then(|r| r.postgresql_url.as_deref()) {
            checks.push(Check::new(
                format!("database for {} reachable", user),
                check_database(url).await,
            ));
        }
    }
    checks
}

/// Create the workspace directories.
pub fn create_workspace(config: &AutotestConfig) -> Result<(), AutotestError> {
    for dir in [config.scripts_dir(), config.workers_dir(), config.logs_dir()] {
        std::fs::create_dir_all(&dir)?;
    }
    set_mode(&config.workers_dir(), 0o755)?;
    for worker in &config.workers {
        std::fs::create_dir_all(config.worker_dir(&worker.user))?;
    }
    Ok(())
}

/// Install the named testers (all of them when `names` is empty) and
/// publish a schema listing the ones that succeeded.
pub async fn install_testers(
    config: &AutotestConfig,
    kv: &dyn KvStore,
    names: &[String],
) -> Result<Vec<String>, AutotestError> {
    let selected: Vec<&str> = if names.is_empty() {
        TESTER_NAMES.to_vec()
    } else {
        names.iter().map(String::as_str).collect()
    };

    let mut installed: Vec<(String, Value)> = Vec::new();
    let mut failures = Vec::new();
    for name in selected {
        let tester = get_tester(name, &config.testers_dir)?;
        log::info!("Installing tester {}", name);
        match tester.install().await {
            Ok(()) => installed.push((name.to_string(), tester.settings_schema())),
            Err(e) => {
                log::error!("Installing tester {} failed: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }
    }

    schema::store(kv, &schema::build_schema(&installed)).await?;
    if !failures.is_empty() {
        return Err(AutotestError::InstallerError(failures.join("\n")));
    }
    Ok(installed.into_iter().map(|(name, _)| name).collect())
}

/// Full installation. Stops before touching testers when a check fails.
pub async fn install(
    config: &AutotestConfig,
    kv: &dyn KvStore,
    testers: &[String],
) -> Result<Vec<String>, AutotestError> {
    let checks = check_environment(config, kv).await;
    for check in &checks {
        log::info!("{}", check);
    }
    let failed: Vec<String> = checks
        .iter()
        .filter(|c| !c.passed())
        .map(|c| c.to_string())
        .collect();
    if !failed.is_empty() {
        return Err(AutotestError::InstallerError(format!(
            "environment checks failed:\n{}",
            failed.join("\n")
        )));
    }
    create_workspace(config)?;
    install_testers(config, kv, testers).await
}
