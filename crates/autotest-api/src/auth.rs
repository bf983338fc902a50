//! Api keys, rate limiting and the ownership chain
//!
//! Authorization short-circuits in order: resolve the key, charge the
//! per-key rate bucket, then require ownership of the settings id and, for
//! test routes, that the test id belongs to those settings. Every outcome is
//! appended to the access log.

use crate::error::{ApiError, Result};
use crate::AppState;
use autotest_core::kv::{keys, KvStore};
use autotest_core::settings::load_settings;
use axum::http::{HeaderMap, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Timelike, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;

pub const API_KEY_HEADER: &str = "Api-Key";

/// Seconds a rate bucket lives; buckets are keyed by wall-clock minute.
const RATE_BUCKET_TTL: u64 = 59;

/// 24 random bytes, base64 encoded to 32 characters.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Short, non-secret label for a key in logs.
pub fn key_label(api_key: &str) -> String {
    let prefix: String = api_key.chars().take(6).collect();
    format!("{}...", prefix)
}

pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

/// The caller that passed authorization, with the settings record when the
/// route names one.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub user: String,
    pub settings: Option<Value>,
}

pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    settings_id: Option<i64>,
    test_id: Option<i64>,
) -> Result<Authorized> {
    let user = api_key(headers).map(str::to_string);
    let outcome = authorize_chain(state, user.as_deref(), settings_id, test_id).await;
    let label = user.as_deref().map(key_label).unwrap_or_else(|| "None".to_string());
    let timestamp = Utc::now().to_rfc3339();
    let entry = match &outcome {
        Ok(_) => format!(
            "AUTHORIZED\n\t{}\n\turl: {}\n\tuser: {}\n",
            timestamp, uri, label
        ),
        Err(e) => format!(
            "UNAUTHORIZED\n\t{}\n\turl: {}\n\tuser: {}\n\tresponse: {} {}\n",
            timestamp,
            uri,
            label,
            e.status_code().as_u16(),
            e
        ),
    };
    state.access_log.append(&entry).await;
    outcome
}

async fn authorize_chain(
    state: &AppState,
    user: Option<&str>,
    settings_id: Option<i64>,
    test_id: Option<i64>,
) -> Result<Authorized> {
    let kv = state.kv.as_ref();
    let user = resolve_user(kv, user).await?;
    check_rate_limit(kv, &user, state.config.server.default_rate_limit).await?;

    let settings = match settings_id {
        Some(id) => Some(require_settings_owner(kv, &user, id).await?),
        None => None,
    };
    if let (Some(settings_id), Some(test_id)) = (settings_id, test_id) {
        require_test_of_settings(kv, settings_id, test_id).await?;
    }
    Ok(Authorized { user, settings })
}

async fn resolve_user(kv: &dyn KvStore, api_key: Option<&str>) -> Result<String> {
    let Some(key) = api_key.filter(|k| !k.is_empty()) else {
        return Err(ApiError::Unauthorized);
    };
    match kv.hget(keys::USER_CREDENTIALS, key).await? {
        Some(_) => Ok(key.to_string()),
        None => Err(ApiError::Unauthorized),
    }
}

/// Charge one request to the current minute's bucket.
pub async fn check_rate_limit(kv: &dyn KvStore, api_key: &str, default_limit: u64) -> Result<()> {
    let limit = kv
        .get_string(&keys::ratelimit_override(api_key))
        .await?
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default_limit as i64);
    let bucket = keys::ratelimit(api_key, Utc::now().minute() as i64);
    let count = kv.incr(&bucket).await?;
    kv.expire(&bucket, RATE_BUCKET_TTL).await?;
    if count > limit {
        log::debug!("Rate limit {} exceeded for {}", limit, key_label(api_key));
        return Err(ApiError::RateLimited);
    }
    Ok(())
}

async fn require_settings_owner(kv: &dyn KvStore, user: &str, settings_id: i64) -> Result<Value> {
    let settings = load_settings(kv, settings_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Settings not found"))?;
    if settings.get("_user").and_then(Value::as_str) != Some(user) {
        return Err(ApiError::Unauthorized);
    }
    Ok(settings)
}

async fn require_test_of_settings(kv: &dyn KvStore, settings_id: i64, test_id: i64) -> Result<()> {
    let owner = kv
        .hget(keys::TESTS, &test_id.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found("Test not found"))?;
    if owner != settings_id.to_string() {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotest_core::MemoryStore;

    #[test]
    fn test_generated_keys_are_32_chars() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(key_label(&a).len(), 9);
    }

    #[tokio::test]
    async fn test_rate_limit_counts_per_minute() {
        let kv = MemoryStore::new();
        for _ in 0..3 {
            check_rate_limit(&kv, "k", 3).await.unwrap();
        }
        assert!(matches!(
            check_rate_limit(&kv, "k", 3).await,
            Err(ApiError::RateLimited)
        ));
        check_rate_limit(&kv, "other", 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_override() {
        let kv = MemoryStore::new();
        kv.set(&keys::ratelimit_override("k"), b"1", None).await.unwrap();
        check_rate_limit(&kv, "k", 20).await.unwrap();
        assert!(check_rate_limit(&kv, "k", 20).await.is_err());
    }
}
