//! Append-only access and error logs.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Stdout,
    Stderr,
}

/// A log written to `path`, or to the fallback stream when no path is set.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: Option<PathBuf>,
    fallback: Fallback,
    lock: Arc<Mutex<()>>,
}

impl LogSink {
    pub fn new(path: Option<PathBuf>, fallback: Fallback) -> Self {
        Self {
            path,
            fallback,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub async fn append(&self, entry: &str) {
        let _guard = self.lock.lock().await;
        let result = match &self.path {
            Some(path) => {
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                {
                    Ok(mut file) => file.write_all(entry.as_bytes()).await,
                    Err(e) => Err(e),
                }
            }
            None => match self.fallback {
                Fallback::Stdout => tokio::io::stdout().write_all(entry.as_bytes()).await,
                Fallback::Stderr => tokio::io::stderr().write_all(entry.as_bytes()).await,
            },
        };
        if let Err(e) = result {
            log::warn!("Failed to write log entry to {:?}: {}", self.path, e);
        }
    }
}
