//! Worker loop: pop one job at a time and run it to completion

use crate::config::AutotestConfig;
use crate::errors::AutotestError;
use crate::kv::SharedStore;
use crate::queue::{stats, Broker, Job};
use crate::runner::{Runner, TestJob};
use crate::settings::{SettingsJob, SettingsManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const RUN_TEST: &str = "run_test";
pub const UPDATE_TEST_SETTINGS: &str = "update_test_settings";
pub const JOB_TIMEOUT_MESSAGE: &str = "Job exceeded maximum timeout value";

/// How long a pop blocks before the shutdown flag is checked again.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Worker {
    broker: Broker,
    queues: Vec<String>,
    runner: Runner,
    settings: SettingsManager,
}

impl Worker {
    pub fn new(
        config: Arc<AutotestConfig>,
        kv: SharedStore,
        worker_user: Option<String>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            broker: Broker::new(kv.clone()),
            queues,
            runner: Runner::new(config.clone(), kv.clone(), worker_user),
            settings: SettingsManager::new(config, kv),
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Process jobs until `shutdown` turns true. A running job is always
    /// finished before the flag is honoured.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AutotestError> {
        log::info!("Worker listening on queues: {}", self.queues.join(", "));
        loop {
            if *shutdown.borrow_and_update() {
                log::info!("Shutdown requested, worker stopping");
                return Ok(());
            }
            match self.work_one(POP_TIMEOUT).await {
                Ok(_) => {}
                Err(AutotestError::KvUnavailable(e)) => {
                    log::error!("Key-value store unavailable: {}", e);
                    tokio::time::sleep(POP_TIMEOUT).await;
                }
                Err(e) => log::error!("Worker error: {}", e),
            }
        }
    }

    /// Pop and perform at most one job. Returns whether a job ran.
    pub async fn work_one(&self, wait: Duration) -> Result<bool, AutotestError> {
        let Some(job) = self.broker.blocking_pop(&self.queues, wait).await? else {
            return Ok(false);
        };
        self.perform(job).await?;
        Ok(true)
    }

    async fn perform(&self, mut job: Job) -> Result<(), AutotestError> {
        let kv = self.broker.store().clone();
        stats::record_pop(kv.as_ref(), &job.queue).await?;
        log::info!("Starting job {} ({}) from {}", job.id, job.function, job.queue);

        let outcome = if job.timeout == 0 {
            Some(self.dispatch(&job).await)
        } else {
            tokio::time::timeout(Duration::from_secs(job.timeout), self.dispatch(&job))
                .await
                .ok()
        };
        match outcome {
            Some(Ok(())) => {
                log::info!("Job {} finished", job.id);
                self.broker.finish(&mut job).await?;
            }
            Some(Err(e)) => {
                log::warn!("Job {} failed: {}", job.id, e);
                self.broker.fail(&mut job, e.to_string()).await?;
            }
            None => {
                log::warn!("Job {} timed out after {}s", job.id, job.timeout);
                self.broker.fail(&mut job, JOB_TIMEOUT_MESSAGE).await?;
            }
        }

        for queue in &self.queues {
            if self.broker.queue_len(queue).await? == 0 {
                stats::clear(kv.as_ref(), queue).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, job: &Job) -> Result<(), AutotestError> {
        match job.function.as_str() {
            RUN_TEST => {
                let args: TestJob = serde_json::from_value(job.kwargs.clone())?;
                self.runner.run_test(&args).await.map(|_| ())
            }
            UPDATE_TEST_SETTINGS => {
                let args: SettingsJob = serde_json::from_value(job.kwargs.clone())?;
                self.settings.update_test_settings(&args).await.map(|_| ())
            }
            other => Err(AutotestError::QueueError(format!(
                "unknown job function '{}'",
                other
            ))),
        }
    }
}
