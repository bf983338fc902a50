//! Core library of the autotest grading service.
//!
//! Clients upload test settings and submit student work over HTTP; the jobs
//! travel through a Redis-backed priority queue to workers that run each
//! test group in a sandboxed scratch directory and publish the results.
//!
//! # Subsystems
//!
//! - **Configuration**: one immutable YAML-backed [`AutotestConfig`] per process
//! - **Key-value store**: the [`kv::KvStore`] seam shared by the front end and workers
//! - **Queue**: job records and the four priority queues ([`Broker`])
//! - **Settings**: installing test settings and provisioning tester environments
//! - **Runner**: materializing submissions and running tester processes under limits
//! - **Schema**: the settings JSON schema with default filling and validation
//! - **Installer**: host checks and tester installation

pub mod config;
pub mod errors;
pub mod fetch;
pub mod installer;
pub mod kv;
pub mod queue;
pub mod resources;
pub mod runner;
pub mod schema;
pub mod settings;
pub mod testers;
pub mod users;
pub mod worker;

pub use config::*;
pub use errors::AutotestError;
pub use kv::{KvStore, MemoryStore, RedisStore, SharedStore};
pub use queue::{Broker, EnqueueRequest, Job, JobStatus};
pub use runner::{Runner, TestJob, TestRunResult};
pub use settings::{SettingsJob, SettingsManager};
pub use worker::Worker;

#[cfg(test)]
pub(crate) mod test_utils;
