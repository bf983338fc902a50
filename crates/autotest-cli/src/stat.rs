//! Queue statistics for the `stat` command.

use autotest_core::config::KNOWN_QUEUES;
use autotest_core::kv::{keys, KvStore};
use autotest_core::queue::stats::average_interval;
use autotest_core::AutotestError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStat {
    pub name: String,
    pub length: i64,
    /// Mean seconds between pops in the current window
    pub average_interval: Option<f64>,
}

impl QueueStat {
    /// Seconds until the last queued job is picked up at the current rate.
    pub fn estimate(&self) -> Option<f64> {
        self.average_interval.map(|avg| avg * self.length as f64)
    }
}

impl fmt::Display for QueueStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = |v: Option<f64>| match v {
            Some(v) => format!("{:.1}s", v),
            None => "-".to_string(),
        };
        write!(
            f,
            "{:<10} length {:>5}  avg interval {:>8}  estimate {:>8}",
            self.name,
            self.length,
            seconds(self.average_interval),
            seconds(self.estimate())
        )
    }
}

pub async fn queue_stats(kv: &dyn KvStore) -> Result<Vec<QueueStat>, AutotestError> {
    let mut stats = Vec::with_capacity(KNOWN_QUEUES.len());
    for name in KNOWN_QUEUES {
        stats.push(QueueStat {
            name: name.to_string(),
            length: kv.llen(&keys::queue(name)).await?,
            average_interval: average_interval(kv, name).await?,
        });
    }
    Ok(stats)
}
