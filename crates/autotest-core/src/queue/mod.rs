//! Multi-queue job broker over the key-value store
//!
//! A job is a JSON record stored at `autotest:job:{id}`; a queue is a list of
//! job ids at `autotest:queue:{name}`. Enqueueing writes the record and then
//! appends the id, so a popped id always resolves unless its record expired.
//! No retries happen at this layer.

pub mod stats;


use crate::errors::AutotestError;
use crate::kv::{keys, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const SETTINGS_QUEUE: &str = "settings";
pub const HIGH_QUEUE: &str = "high";
pub const LOW_QUEUE: &str = "low";
pub const BATCH_QUEUE: &str = "batch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Canceled,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Name of the job kind the worker dispatches on
    pub function: String,
    pub kwargs: Value,
    /// Seconds the job may run before the worker aborts it
    pub timeout: u64,
    pub result_ttl: u64,
    pub failure_ttl: u64,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exc_info: Option<String>,
}

/// Parameters of a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue: String,
    pub function: String,
    pub kwargs: Value,
    pub job_id: String,
    pub timeout: u64,
    pub result_ttl: u64,
    pub failure_ttl: u64,
}

#[derive(Clone)]
pub struct Broker {
    kv: SharedStore,
}

impl Broker {
    pub fn new(kv: SharedStore) -> Self {
        Self { kv }
    }

    pub fn store(&self) -> &SharedStore {
        &self.kv
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, AutotestError> {
        let job = Job {
            id: request.job_id,
            queue: request.queue,
            function: request.function,
            kwargs: request.kwargs,
            timeout: request.timeout,
            result_ttl: request.result_ttl,
            failure_ttl: request.failure_ttl,
            status: JobStatus::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exc_info: None,
        };
        self.save(&job, None).await?;
        self.kv.rpush(&keys::queue(&job.queue), &job.id).await?;
        log::debug!("Enqueued job {} on queue {}", job.id, job.queue);
        Ok(job)
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Option<Job>, AutotestError> {
        match self.kv.get(&keys::job(job_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, AutotestError> {
        Ok(self
            .fetch(job_id)
            .await?
            .map(|job| job.status)
            .unwrap_or(JobStatus::Unknown))
    }

    /// Remove a queued job from its queue and mark it canceled. Jobs that
    /// already started are left alone.
    ///
    /// Removing the id from the list is the claim: a job whose id a worker
    /// already popped is never marked canceled.
    pub async fn cancel(&self, job_id: &str) -> Result<(), AutotestError> {
        let Some(mut job) = self.fetch(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            return Ok(());
        }
        if self.kv.lrem(&keys::queue(&job.queue), &job.id).await? == 0 {
            log::debug!("Job {} left its queue before it could be canceled", job_id);
            return Ok(());
        }
        job.status = JobStatus::Canceled;
        job.ended_at = Some(Utc::now());
        let ttl = job.failure_ttl;
        self.save(&job, Some(ttl)).await?;
        log::info!("Canceled job {}", job_id);
        Ok(())
    }

    pub async fn delete(&self, job_id: &str) -> Result<(), AutotestError> {
        self.kv.del(&keys::job(job_id)).await?;
        Ok(())
    }

    /// Pop the next job from the first non-empty queue, marking it started.
    /// Ids whose record vanished or that are no longer queued are skipped.
    pub async fn blocking_pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Job>, AutotestError> {
        let lists: Vec<String> = queues.iter().map(|q| keys::queue(q)).collect();
        let Some((_, job_id)) = self.kv.blpop(&lists, timeout).await? else {
            return Ok(None);
        };
        let Some(mut job) = self.fetch(&job_id).await? else {
            log::warn!("Popped job {} has no record, skipping", job_id);
            return Ok(None);
        };
        if job.status != JobStatus::Queued {
            log::debug!("Popped job {} is {}, skipping", job_id, job.status);
            return Ok(None);
        }
        job.status = JobStatus::Started;
        job.started_at = Some(Utc::now());
        self.save(&job, None).await?;
        Ok(Some(job))
    }

    pub async fn finish(&self, job: &mut Job) -> Result<(), AutotestError> {
        job.status = JobStatus::Finished;
        job.ended_at = Some(Utc::now());
        self.save(job, Some(job.result_ttl)).await
    }

    pub async fn fail(&self, job: &mut Job, exc_info: impl Into<String>) -> Result<(), AutotestError> {
        job.status = JobStatus::Failed;
        job.ended_at = Some(Utc::now());
        job.exc_info = Some(exc_info.into());
        self.save(job, Some(job.failure_ttl)).await
    }

    pub async fn queue_len(&self, queue: &str) -> Result<i64, AutotestError> {
        self.kv.llen(&keys::queue(queue)).await
    }

    async fn save(&self, job: &Job, ttl: Option<u64>) -> Result<(), AutotestError> {
        let payload = serde_json::to_vec(job)?;
        self.kv.set(&keys::job(&job.id), &payload, ttl).await
    }
}
