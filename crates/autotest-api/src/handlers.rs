//! Route handlers.

use crate::auth::{authorize, generate_api_key};
use crate::error::{ApiError, Result};
use crate::AppState;
use autotest_core::fetch::Credentials;
use autotest_core::kv::keys;
use autotest_core::queue::{BATCH_QUEUE, HIGH_QUEUE, LOW_QUEUE, SETTINGS_QUEUE};
use autotest_core::runner::env::EnvMap;
use autotest_core::schema;
use autotest_core::settings::{public_view, save_settings, SettingsJob};
use autotest_core::worker::{RUN_TEST, UPDATE_TEST_SETTINGS};
use autotest_core::{EnqueueRequest, JobStatus, TestJob};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Component;

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    pub auth_type: String,
    pub credentials: String,
}

#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    #[serde(default)]
    pub settings: Option<Value>,
    pub file_url: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub file_url: String,
    #[serde(default)]
    pub env_vars: EnvMap,
}

#[derive(Debug, Deserialize)]
pub struct RunTestsBody {
    pub test_data: Vec<TestRequest>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub request_high_priority: bool,
}

#[derive(Debug, Deserialize)]
pub struct TestIdsBody {
    pub test_ids: Vec<i64>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<Value>> {
    let credentials = serde_json::to_string(&Credentials {
        auth_type: body.auth_type,
        credentials: body.credentials,
    })
    .map_err(autotest_core::AutotestError::from)?;
    loop {
        let api_key = generate_api_key();
        if state
            .kv
            .hsetnx(keys::USER_CREDENTIALS, &api_key, &credentials)
            .await?
        {
            log::info!("Registered new api key {}", crate::auth::key_label(&api_key));
            return Ok(Json(json!({ "api_key": api_key })));
        }
    }
}

pub async fn reset_credentials(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<Value>> {
    let auth = authorize(&state, &headers, &uri, None, None).await?;
    let credentials = serde_json::to_string(&Credentials {
        auth_type: body.auth_type,
        credentials: body.credentials,
    })
    .map_err(autotest_core::AutotestError::from)?;
    state
        .kv
        .hset(keys::USER_CREDENTIALS, &auth.user, &credentials)
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_schema(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    authorize(&state, &headers, &uri, None, None).await?;
    let schema = schema::load(state.kv.as_ref()).await?;
    Ok(Json(schema.unwrap_or_else(|| json!({}))))
}

pub async fn create_settings(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<SettingsBody>,
) -> Result<Json<Value>> {
    let auth = authorize(&state, &headers, &uri, None, None).await?;
    let test_settings = validated_settings(&state, &body).await?;
    let settings_id = state.kv.incr(keys::SETTINGS_ID).await?;
    save_settings(state.kv.as_ref(), settings_id, &json!({ "_user": auth.user })).await?;
    enqueue_settings_job(&state, &auth.user, settings_id, test_settings, body.file_url).await?;
    Ok(Json(json!({ "settings_id": settings_id })))
}

pub async fn get_settings(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path(settings_id): Path<i64>,
) -> Result<Json<Value>> {
    let auth = authorize(&state, &headers, &uri, Some(settings_id), None).await?;
    let settings = auth.settings.unwrap_or_else(|| json!({}));
    Ok(Json(public_view(&settings)))
}

pub async fn update_settings(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path(settings_id): Path<i64>,
    Json(body): Json<SettingsBody>,
) -> Result<Json<Value>> {
    let auth = authorize(&state, &headers, &uri, Some(settings_id), None).await?;
    let test_settings = validated_settings(&state, &body).await?;
    enqueue_settings_job(&state, &auth.user, settings_id, test_settings, body.file_url).await?;
    Ok(Json(json!({ "settings_id": settings_id })))
}

pub async fn run_tests(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path(settings_id): Path<i64>,
    Json(body): Json<RunTestsBody>,
) -> Result<Json<Value>> {
    let auth = authorize(&state, &headers, &uri, Some(settings_id), None).await?;
    let settings = auth.settings.unwrap_or_else(|| json!({}));
    if let Some(error) = settings.get("_error").and_then(Value::as_str) {
        return Err(ApiError::unprocessable(format!("Settings Error: {}", error)));
    }

    let queue = select_queue(
        body.test_data.len(),
        body.request_high_priority,
        state.config.server.allow_high_priority,
    );
    let timeout = job_timeout(&settings, state.config.timeout_multiplier);

    let mut test_ids = Vec::with_capacity(body.test_data.len());
    for request in body.test_data {
        let test_id = state.kv.incr(keys::TESTS_ID).await?;
        state
            .kv
            .hset(keys::TESTS, &test_id.to_string(), &settings_id.to_string())
            .await?;
        let job = TestJob {
            settings_id,
            test_id,
            files_url: request.file_url,
            categories: body.categories.clone(),
            user: auth.user.clone(),
            test_env_vars: request.env_vars,
        };
        let kwargs = serde_json::to_value(&job).map_err(autotest_core::AutotestError::from)?;
        state
            .broker
            .enqueue(EnqueueRequest {
                queue: queue.to_string(),
                function: RUN_TEST.to_string(),
                kwargs,
                job_id: test_id.to_string(),
                timeout,
                result_ttl: state.config.result_ttl,
                failure_ttl: state.config.result_ttl,
            })
            .await?;
        test_ids.push(test_id);
    }
    log::info!(
        "Enqueued tests {:?} for settings {} on {} (timeout {}s)",
        test_ids,
        settings_id,
        queue,
        timeout
    );
    Ok(Json(json!({ "test_ids": test_ids })))
}

pub async fn get_result(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path((settings_id, test_id)): Path<(i64, i64)>,
) -> Result<Json<Value>> {
    authorize(&state, &headers, &uri, Some(settings_id), Some(test_id)).await?;
    let job_id = test_id.to_string();
    let job = state
        .broker
        .fetch(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Test not found"))?;

    let mut result = Map::new();
    result.insert("status".to_string(), json!(job.status));
    let result_key = keys::test_result(test_id);
    match job.status {
        JobStatus::Finished => match state.kv.get_string(&result_key).await? {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(payload)) => result.extend(payload),
                _ => {
                    result.insert("error".to_string(), json!(format!("invalid json: {}", raw)));
                }
            },
            None => {
                result.insert("error".to_string(), json!("no result was published"));
            }
        },
        JobStatus::Failed => {
            result.insert("error".to_string(), json!(job.exc_info));
        }
        _ => {}
    }

    if job.status.is_terminal() {
        state.broker.delete(&job_id).await?;
        state.kv.del(&result_key).await?;
    }
    Ok(Json(Value::Object(result)))
}

pub async fn get_feedback(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path((settings_id, test_id, feedback_id)): Path<(i64, i64, i64)>,
) -> Result<Response> {
    authorize(&state, &headers, &uri, Some(settings_id), Some(test_id)).await?;
    let key = keys::feedback_file(test_id, feedback_id);
    let data = state
        .kv
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::not_found("File doesn't exist"))?;
    state.kv.del(&key).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", feedback_id),
            ),
        ],
        data,
    )
        .into_response())
}

pub async fn get_statuses(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path(settings_id): Path<i64>,
    Json(body): Json<TestIdsBody>,
) -> Result<Json<Value>> {
    authorize(&state, &headers, &uri, Some(settings_id), None).await?;
    let mut statuses = Map::new();
    for test_id in body.test_ids {
        let status = if owned_by(&state, test_id, settings_id).await? {
            json!(state.broker.status(&test_id.to_string()).await?)
        } else {
            Value::Null
        };
        statuses.insert(test_id.to_string(), status);
    }
    Ok(Json(Value::Object(statuses)))
}

pub async fn cancel_tests(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Path(settings_id): Path<i64>,
    Json(body): Json<TestIdsBody>,
) -> Result<Json<Value>> {
    authorize(&state, &headers, &uri, Some(settings_id), None).await?;
    for test_id in body.test_ids {
        if owned_by(&state, test_id, settings_id).await? {
            state.broker.cancel(&test_id.to_string()).await?;
        }
    }
    Ok(Json(json!({ "success": true })))
}

async fn owned_by(state: &AppState, test_id: i64, settings_id: i64) -> Result<bool> {
    let owner = state.kv.hget(keys::TESTS, &test_id.to_string()).await?;
    Ok(owner.as_deref() == Some(settings_id.to_string().as_str()))
}

/// Check the uploaded names and validate the settings, returning the
/// default-filled settings.
async fn validated_settings(state: &AppState, body: &SettingsBody) -> Result<Value> {
    check_filenames(&body.files)?;
    let mut settings = body.settings.clone().unwrap_or_else(|| json!({}));
    let schema = schema::load(state.kv.as_ref())
        .await?
        .unwrap_or_else(|| schema::build_schema(&[]));
    schema::validate_against_schema(&mut settings, &schema, &body.files)?;
    Ok(settings)
}

pub fn check_filenames(files: &[String]) -> Result<()> {
    for name in files {
        let path = std::path::Path::new(name);
        if path.is_absolute() {
            return Err(ApiError::unprocessable(
                "uploaded files cannot include an absolute path",
            ));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ApiError::unprocessable(".. not allowed in uploaded file path"));
        }
    }
    Ok(())
}

async fn enqueue_settings_job(
    state: &AppState,
    user: &str,
    settings_id: i64,
    test_settings: Value,
    file_url: String,
) -> Result<()> {
    let job = SettingsJob {
        user: user.to_string(),
        settings_id,
        test_settings,
        file_url,
    };
    let kwargs = serde_json::to_value(&job).map_err(autotest_core::AutotestError::from)?;
    state
        .broker
        .enqueue(EnqueueRequest {
            queue: SETTINGS_QUEUE.to_string(),
            function: UPDATE_TEST_SETTINGS.to_string(),
            kwargs,
            job_id: format!("settings_{}", settings_id),
            timeout: state.config.settings_job_timeout,
            result_ttl: state.config.result_ttl,
            failure_ttl: state.config.result_ttl,
        })
        .await?;
    Ok(())
}

/// More than one submission goes to `batch`; otherwise `high` when asked
/// for and allowed, else `low`.
pub fn select_queue(submissions: usize, high_priority: bool, allow_high: bool) -> &'static str {
    if submissions > 1 {
        BATCH_QUEUE
    } else if high_priority && allow_high {
        HIGH_QUEUE
    } else {
        LOW_QUEUE
    }
}

/// `ceil(multiplier × Σ timeout)` over every test group of every tester.
pub fn job_timeout(settings: &Value, multiplier: f64) -> u64 {
    let total: u64 = settings
        .get("testers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|tester| tester.get("test_data").and_then(Value::as_array))
        .flatten()
        .filter_map(|group| group.get("timeout").and_then(Value::as_u64))
        .sum();
    (total as f64 * multiplier).ceil() as u64
}
