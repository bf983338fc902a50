//! Rolling pop-interval statistics per queue, kept in the `pop_intervals` hash.

use crate::errors::AutotestError;
use crate::kv::{keys, KvStore};

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Record that a job was just popped from `queue`.
pub async fn record_pop(kv: &dyn KvStore, queue: &str) -> Result<(), AutotestError> {
    let now = now_secs().to_string();
    kv.hsetnx(keys::POP_INTERVALS, &format!("{}_start", queue), &now)
        .await?;
    kv.hset(keys::POP_INTERVALS, &format!("{}_last", queue), &now)
        .await?;
    kv.hincr(keys::POP_INTERVALS, &format!("{}_count", queue), 1)
        .await?;
    Ok(())
}

/// Reset the statistics of `queue` so the next pop starts a new window.
pub async fn clear(kv: &dyn KvStore, queue: &str) -> Result<(), AutotestError> {
    kv.hdel(keys::POP_INTERVALS, &format!("{}_start", queue))
        .await?;
    kv.hset(keys::POP_INTERVALS, &format!("{}_last", queue), "0")
        .await?;
    kv.hset(keys::POP_INTERVALS, &format!("{}_count", queue), "0")
        .await?;
    Ok(())
}

/// Average seconds between pops, or `None` when nothing was recorded.
pub async fn average_interval(kv: &dyn KvStore, queue: &str) -> Result<Option<f64>, AutotestError> {
    let start = read_field(kv, &format!("{}_start", queue)).await?;
    let last = read_field(kv, &format!("{}_last", queue)).await?;
    let count = read_field(kv, &format!("{}_count", queue)).await?;
    match (start, last, count) {
        (Some(start), Some(last), Some(count)) if count >= 1.0 => {
            if count < 2.0 {
                Ok(Some(0.0))
            } else {
                Ok(Some((last - start) / (count - 1.0)))
            }
        }
        _ => Ok(None),
    }
}

async fn read_field(kv: &dyn KvStore, field: &str) -> Result<Option<f64>, AutotestError> {
    Ok(kv
        .hget(keys::POP_INTERVALS, field)
        .await?
        .and_then(|v| v.parse::<f64>().ok()))
}
