//! Sandboxed execution of test jobs
//!
//! A test job materializes the submission and the instructor files in the
//! worker's scratch directory, runs every selected test group through its
//! tester subprocess and publishes the collected results. Cleanup of the
//! scratch is tied to a guard so it happens however the job ends.

pub mod env;
pub mod feedback;
pub mod files;
pub mod partial_json;
pub mod process;
pub mod result;
pub mod rlimits;
pub mod workspace;

#[cfg(test)]
mod tests;

use crate::config::{AutotestConfig, WorkerConfig};
use crate::errors::AutotestError;
use crate::fetch::{download, load_credentials};
use crate::kv::{keys, SharedStore};
use crate::resources::resource_env;
use crate::settings::{load_settings, touch_last_access};
use crate::testers::TESTER_NAMES;
use crate::users;
use env::{base_env, overlay_env, EnvMap};
use files::EntryKind;
use process::Invocation;
pub use result::{TestGroupResult, TestRunResult};
use rlimits::RlimitPlan;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use workspace::ScratchGuard;

/// Arguments of a `run_test` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJob {
    pub settings_id: i64,
    pub test_id: i64,
    pub files_url: String,
    pub categories: Vec<String>,
    /// Api key of the client that enqueued the test
    pub user: String,
    #[serde(default)]
    pub test_env_vars: EnvMap,
}

/// The worker user a job runs as and its scratch directory.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker: WorkerConfig,
    pub scratch: PathBuf,
    /// Set when the worker user is not the user running this process
    pub run_as: Option<String>,
}

pub struct Runner {
    config: Arc<AutotestConfig>,
    kv: SharedStore,
    http: reqwest::Client,
    worker_user: Option<String>,
}

/// Python snippet importing and running the tester for `tester_type`.
pub fn tester_bootstrap(testers_dir: &Path, tester_type: &str) -> String {
    let mut class = tester_type.to_string();
    if let Some(first) = class.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    [
        "import sys, json".to_string(),
        format!("sys.path.append({:?})", testers_dir.display().to_string()),
        format!(
            "from testers.{t}.{t}_tester import {c}Tester as Tester",
            t = tester_type,
            c = class
        ),
        "from testers.specs import TestSpecs".to_string(),
        "Tester(specs=TestSpecs.from_json(sys.stdin.read())).run()".to_string(),
    ]
    .join("; ")
}

fn category_selected(test_data: &Value, categories: &[String]) -> bool {
    test_data
        .get("category")
        .and_then(Value::as_array)
        .map(|cats| {
            cats.iter()
                .filter_map(Value::as_str)
                .any(|c| categories.iter().any(|wanted| wanted == c))
        })
        .unwrap_or(false)
}

fn env_map(value: Option<&Value>) -> EnvMap {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl Runner {
    pub fn new(config: Arc<AutotestConfig>, kv: SharedStore, worker_user: Option<String>) -> Self {
        Self {
            config,
            kv,
            http: reqwest::Client::new(),
            worker_user,
        }
    }

    pub fn identity(&self) -> Result<WorkerIdentity, AutotestError> {
        let user = self.worker_user.as_deref().ok_or_else(|| {
            AutotestError::ConfigError("No worker users available to run this job".to_string())
        })?;
        let worker = self.config.worker(user).cloned().ok_or_else(|| {
            AutotestError::ConfigError(format!("No worker configured for user: {}", user))
        })?;
        let run_as = match users::current_user() {
            Ok(current) if current == user => None,
            _ => Some(user.to_string()),
        };
        Ok(WorkerIdentity {
            worker,
            scratch: self.config.worker_dir(user),
            run_as,
        })
    }

    /// Run a test job and publish its result. Failures are reported in the
    /// published `error`; only a failure to publish is returned.
    pub async fn run_test(&self, job: &TestJob) -> Result<TestRunResult, AutotestError> {
        let mut groups = Vec::new();
        let error = match self.run_job(job, &mut groups).await {
            Ok(()) => None,
            Err(e) => {
                log::warn!("Test {} failed: {}", job.test_id, e);
                Some(e.to_string())
            }
        };
        let result = TestRunResult {
            test_groups: groups,
            error,
        };
        self.publish(job.test_id, &result).await?;
        Ok(result)
    }

    async fn publish(&self, test_id: i64, result: &TestRunResult) -> Result<(), AutotestError> {
        let payload = serde_json::to_vec(result)?;
        self.kv
            .set(&keys::test_result(test_id), &payload, Some(self.config.result_ttl))
            .await
    }

    async fn run_job(
        &self,
        job: &TestJob,
        groups: &mut Vec<TestGroupResult>,
    ) -> Result<(), AutotestError> {
        let settings = load_settings(self.kv.as_ref(), job.settings_id)
            .await?
            .ok_or_else(|| {
                AutotestError::NotFound(format!("settings {} do not exist", job.settings_id))
            })?;
        touch_last_access(self.kv.as_ref(), job.settings_id).await?;

        let identity = self.identity()?;
        workspace::prepare_scratch(&identity.scratch, &identity.worker.user)?;
        let guard = ScratchGuard::new(identity.scratch.clone(), identity.run_as.clone());

        let outcome = self.run_in_scratch(job, &settings, &identity, groups).await;

        if let Err(e) = tokio::task::spawn_blocking(move || drop(guard)).await {
            log::error!("Scratch cleanup panicked: {}", e);
        }
        outcome
    }

    async fn materialize(
        &self,
        job: &TestJob,
        settings: &Value,
        identity: &WorkerIdentity,
    ) -> Result<(), AutotestError> {
        let scratch = &identity.scratch;
        let gid = users::group_id(&identity.worker.user);

        let credentials = load_credentials(self.kv.as_ref(), &job.user).await?;
        let archive = download(&self.http, &job.files_url, &credentials).await?;
        files::extract_zip(archive, scratch, 1)?;
        for (_, path) in files::walk(scratch)? {
            files::set_mode(&path, 0o770)?;
            if let Some(gid) = gid {
                files::chown_group(&path, gid)?;
            }
        }

        let instructor_files = settings
            .get("_files")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AutotestError::TestExecutionError(
                    "settings have no installed instructor files".to_string(),
                )
            })?;
        for (kind, path, executable) in files::copy_tree(Path::new(instructor_files), scratch)? {
            let mode = match kind {
                EntryKind::Dir => workspace::SCRATCH_MODE,
                EntryKind::File if executable => 0o750,
                EntryKind::File => 0o640,
            };
            files::set_mode(&path, mode)?;
            if let Some(gid) = gid {
                files::chown_group(&path, gid)?;
            }
        }
        Ok(())
    }

    async fn run_in_scratch(
        &self,
        job: &TestJob,
        settings: &Value,
        identity: &WorkerIdentity,
        groups: &mut Vec<TestGroupResult>,
    ) -> Result<(), AutotestError> {
        self.materialize(job, settings, identity).await?;
        let rlimits = RlimitPlan::from_settings(&self.config.rlimit_settings)?;

        let testers = settings
            .get("testers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tester in testers {
            let tester_type = tester
                .get("tester_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !TESTER_NAMES.contains(&tester_type) {
                return Err(AutotestError::TestExecutionError(format!(
                    "tester {} is not installed",
                    tester_type
                )));
            }
            let tester_env = env_map(tester.get("_env"));
            let program = tester_env.get("PYTHON").cloned().ok_or_else(|| {
                AutotestError::TestExecutionError(format!(
                    "environment for tester {} has no PYTHON",
                    tester_type
                ))
            })?;
            let bootstrap = tester_bootstrap(&self.config.testers_dir, tester_type);

            let test_data = tester
                .get("test_data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for data in test_data {
                if !category_selected(&data, &job.categories) {
                    continue;
                }
                let resources = resource_env(self.kv.as_ref(), &identity.worker).await?;
                let env = overlay_env(base_env([&resources, &tester_env]), &job.test_env_vars)?;

                let mut spec = tester.clone();
                if let Some(obj) = spec.as_object_mut() {
                    obj.insert("test_data".to_string(), data.clone());
                }
                let timeout = data.get("timeout").and_then(Value::as_u64);

                let invocation = Invocation {
                    program: program.clone(),
                    args: vec!["-c".to_string(), bootstrap.clone()],
                    cwd: identity.scratch.clone(),
                    env,
                    stdin: serde_json::to_string(&spec)?,
                    timeout: timeout.map(Duration::from_secs),
                    run_as: identity.run_as.clone(),
                    rlimits: rlimits.clone(),
                };
                log::info!(
                    "Running {} test group for test {} (timeout {:?})",
                    tester_type,
                    job.test_id,
                    timeout
                );
                let outcome = process::run(&invocation).await?;

                let feedback_names: Vec<String> = data
                    .get("feedback_file_names")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let feedback = feedback::collect_feedback(
                    self.kv.as_ref(),
                    &identity.scratch,
                    &feedback_names,
                    job.test_id,
                    self.config.feedback_ttl,
                )
                .await?;

                groups.push(TestGroupResult::from_output(
                    &outcome.stdout,
                    &outcome.stderr,
                    outcome.elapsed.as_millis() as u64,
                    data.get("extra_info").cloned().unwrap_or(Value::Null),
                    feedback,
                    if outcome.timed_out { timeout } else { None },
                ));
            }
        }
        Ok(())
    }
}
