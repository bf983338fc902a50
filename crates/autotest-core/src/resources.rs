//! Per-worker resources exported to tester processes.

use crate::config::{PortRange, WorkerConfig};
use crate::errors::AutotestError;
use crate::kv::{keys, KvStore};
use crate::runner::env::EnvMap;
use sqlx::Connection;
use std::net::TcpListener;

/// Pick the next port in `range` that can be bound on localhost.
///
/// A shared counter spreads consecutive allocations across the range so
/// concurrent workers rarely try the same port.
pub async fn next_port(kv: &dyn KvStore, range: PortRange) -> Result<u16, AutotestError> {
    let span = i64::from(range.max) - i64::from(range.min) + 1;
    for _ in 0..span {
        let counter = kv.incr(keys::PORT_COUNTER).await?;
        let port = (i64::from(range.min) + (counter - 1).rem_euclid(span)) as u16;
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                log::debug!("Port {} in use, trying the next one", port);
            }
            Err(e) => {
                return Err(AutotestError::ResourceError(format!(
                    "could not check port {}: {}",
                    port, e
                )))
            }
        }
    }
    Err(AutotestError::ResourceError(format!(
        "no free port between {} and {}",
        range.min, range.max
    )))
}

/// Drop everything the worker's database role owns.
pub async fn reset_database(url: &str) -> Result<(), AutotestError> {
    let mut conn = sqlx::PgConnection::connect(url).await?;
    sqlx::query("DROP OWNED BY CURRENT_USER")
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    Ok(())
}

pub async fn check_database(url: &str) -> Result<(), AutotestError> {
    let conn = sqlx::PgConnection::connect(url).await?;
    conn.close().await?;
    Ok(())
}

/// Environment variables describing the worker's resources for the next test.
pub async fn resource_env(kv: &dyn KvStore, worker: &WorkerConfig) -> Result<EnvMap, AutotestError> {
    let mut env = EnvMap::new();
    let Some(resources) = &worker.resources else {
        return Ok(env);
    };
    if let Some(range) = resources.port {
        env.insert("PORT".to_string(), next_port(kv, range).await?.to_string());
    }
    if let Some(url) = &resources.postgresql_url {
        reset_database(url).await?;
        env.insert("DATABASE_URL".to_string(), url.clone());
        env.insert("AUTOTESTENV".to_string(), "true".to_string());
    }
    Ok(env)
}
