use super::*;
use autotest_core::kv::{keys, KvStore};
use autotest_core::settings::{load_settings, save_settings};
use autotest_core::testers::all_testers;
use autotest_core::{JobStatus, MemoryStore, TestJob};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

const KEY: &str = "owner-key";
const OTHER: &str = "other-key";

struct Fixture {
    dir: TempDir,
    state: AppState,
    router: Router,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = AutotestConfig::default();
    config.workspace = dir.path().join("workspace");
    config.server.access_log = Some(dir.path().join("access.log"));
    config.server.error_log = Some(dir.path().join("error.log"));
    let kv: SharedStore = Arc::new(MemoryStore::new());

    let testers: Vec<(String, Value)> = all_testers(dir.path())
        .unwrap()
        .iter()
        .map(|t| (t.name().to_string(), t.settings_schema()))
        .collect();
    autotest_core::schema::store(kv.as_ref(), &autotest_core::schema::build_schema(&testers))
        .await
        .unwrap();
    for key in [KEY, OTHER] {
        kv.hset(
            keys::USER_CREDENTIALS,
            key,
            r#"{"auth_type":"Bearer","credentials":"token"}"#,
        )
        .await
        .unwrap();
    }

    let state = AppState::new(Arc::new(config), kv);
    let router = ApiServer::new(state.clone()).build_router();
    Fixture { dir, state, router }
}

impl Fixture {
    async fn send_raw(
        &self,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(auth::API_KEY_HEADER, key);
        }
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, bytes) = self.send_raw(method, uri, key, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn install_settings(&self, id: i64, owner: &str, extra: Value) {
        let mut settings = json!({
            "_user": owner,
            "_files": "/tmp/files",
            "testers": [{
                "tester_type": "custom",
                "_env": {"PYTHON": "/usr/bin/python3"},
                "test_data": [
                    {"script_files": ["a.py"], "timeout": 10},
                    {"script_files": ["b.py"], "timeout": 5}
                ]
            }]
        });
        if let (Some(obj), Value::Object(extra)) = (settings.as_object_mut(), extra) {
            obj.extend(extra);
        }
        save_settings(self.state.kv.as_ref(), id, &settings).await.unwrap();
    }

    async fn run_tests(&self, id: i64, count: usize) -> Vec<i64> {
        let test_data: Vec<Value> = (0..count)
            .map(|_| json!({"file_url": "http://lms/submission.zip", "env_vars": {}}))
            .collect();
        let (status, body) = self
            .send(
                "PUT",
                &format!("/settings/{}/test", id),
                Some(KEY),
                Some(json!({"test_data": test_data, "categories": ["instructor"]})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["test_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect()
    }

    fn read_log(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }
}

fn settings_body(files: &[&str]) -> Value {
    json!({
        "settings": {
            "testers": [{
                "tester_type": "custom",
                "test_data": [{"script_files": ["a.py"], "category": ["instructor"], "timeout": 30}]
            }]
        },
        "file_url": "http://lms/files.zip",
        "files": files
    })
}

#[tokio::test]
async fn test_register_returns_key_and_stores_credentials() {
    let fx = fixture().await;
    let (status, body) = fx
        .send(
            "POST",
            "/register",
            None,
            Some(json!({"auth_type": "basic", "credentials": "abc"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let key = body["api_key"].as_str().unwrap();
    assert_eq!(key.len(), 32);

    let stored = fx.state.kv.hget(keys::USER_CREDENTIALS, key).await.unwrap().unwrap();
    let stored: Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(stored, json!({"auth_type": "basic", "credentials": "abc"}));

    let (status, _) = fx.send("GET", "/schema", Some(key), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_key_is_unauthorized_and_logged() {
    let fx = fixture().await;
    let (status, body) = fx.send("GET", "/schema", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized");

    let (status, _) = fx.send("GET", "/schema", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let access = fx.read_log("access.log");
    assert!(access.contains("UNAUTHORIZED"));
    assert!(access.contains("url: /schema"));
    assert!(fx.read_log("error.log").contains("401 Unauthorized"));
}

#[tokio::test]
async fn test_authorized_requests_are_logged() {
    let fx = fixture().await;
    let (status, body) = fx.send("GET", "/schema", Some(KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["definitions"]["installed_testers"].is_object());
    let access = fx.read_log("access.log");
    assert!(access.starts_with("AUTHORIZED"));
    assert!(!access.contains(KEY));
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let fx = fixture().await;
    fx.state
        .kv
        .set(&keys::ratelimit_override(KEY), b"1", None)
        .await
        .unwrap();
    let (first, _) = fx.send("GET", "/schema", Some(KEY), None).await;
    let (second, body) = fx.send("GET", "/schema", Some(KEY), None).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Too many requests");
}

#[tokio::test]
async fn test_create_settings_enqueues_settings_job() {
    let fx = fixture().await;
    let (status, body) = fx
        .send("POST", "/settings", Some(KEY), Some(settings_body(&["a.py"])))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["settings_id"], 1);

    let stored = load_settings(fx.state.kv.as_ref(), 1).await.unwrap().unwrap();
    assert_eq!(stored, json!({"_user": KEY}));

    let job = fx.state.broker.fetch("settings_1").await.unwrap().unwrap();
    assert_eq!(job.queue, "settings");
    assert_eq!(job.function, "update_test_settings");
    assert_eq!(job.timeout, fx.state.config.settings_job_timeout);
    assert_eq!(job.kwargs["user"], KEY);
    assert_eq!(
        job.kwargs["test_settings"]["testers"][0]["test_data"][0]["feedback_file_names"],
        json!([])
    );
}

#[tokio::test]
async fn test_uploaded_filenames_are_checked() {
    let fx = fixture().await;
    let (status, body) = fx
        .send("POST", "/settings", Some(KEY), Some(settings_body(&["../a.py"])))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["message"], ".. not allowed in uploaded file path");

    let (status, _) = fx
        .send("POST", "/settings", Some(KEY), Some(settings_body(&["/etc/a.py"])))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(fx.state.kv.get_string(keys::SETTINGS_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let fx = fixture().await;
    let mut body = settings_body(&["a.py"]);
    body["settings"]["testers"][0]["tester_type"] = json!("cobol");
    let (status, _) = fx.send("POST", "/settings", Some(KEY), Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let mut body = settings_body(&["a.py"]);
    body["settings"]["testers"][0]["test_data"][0]["script_files"] = json!(["missing.py"]);
    let (status, _) = fx.send("POST", "/settings", Some(KEY), Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_settings_isolated_between_keys() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;

    let (status, _) = fx.send("GET", "/settings/1", Some(OTHER), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = fx
        .send("PUT", "/settings/1", Some(OTHER), Some(settings_body(&["a.py"])))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = fx.send("GET", "/settings/2", Some(KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Settings not found");
}

#[tokio::test]
async fn test_get_settings_hides_private_fields() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({"_error": "install failed"})).await;
    let (status, body) = fx.send("GET", "/settings/1", Some(KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("_user").is_none());
    assert!(body.get("_files").is_none());
    assert_eq!(body["_error"], "install failed");
    assert!(body["testers"][0].get("_env").is_none());
    assert_eq!(body["testers"][0]["tester_type"], "custom");
}

#[tokio::test]
async fn test_update_settings_requeues() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let (status, body) = fx
        .send("PUT", "/settings/1", Some(KEY), Some(settings_body(&["a.py"])))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings_id"], 1);
    assert_eq!(
        fx.state.broker.status("settings_1").await.unwrap(),
        JobStatus::Queued
    );
}

#[tokio::test]
async fn test_two_submissions_go_to_batch() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let ids = fx.run_tests(1, 2).await;
    assert_eq!(ids, vec![1, 2]);

    for id in &ids {
        let job = fx.state.broker.fetch(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(job.queue, "batch");
        assert_eq!(job.timeout, 23);
        let args: TestJob = serde_json::from_value(job.kwargs).unwrap();
        assert_eq!(args.settings_id, 1);
        assert_eq!(args.test_id, *id);
        assert_eq!(args.user, KEY);
        assert_eq!(
            fx.state.kv.hget(keys::TESTS, &id.to_string()).await.unwrap().as_deref(),
            Some("1")
        );
    }
    assert_eq!(fx.state.broker.queue_len("batch").await.unwrap(), 2);
}

#[tokio::test]
async fn test_env_vars_travel_with_the_job() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let (status, body) = fx
        .send(
            "PUT",
            "/settings/1/test",
            Some(KEY),
            Some(json!({
                "test_data": [{"file_url": "http://lms/s.zip", "env_vars": {"PORT": "9999"}}],
                "categories": ["instructor"],
                "request_high_priority": true
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["test_ids"][0].as_i64().unwrap();
    let job = fx.state.broker.fetch(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(job.queue, "high");
    assert_eq!(job.kwargs["test_env_vars"]["PORT"], "9999");
}

#[test]
fn test_queue_selection() {
    assert_eq!(handlers::select_queue(2, true, true), "batch");
    assert_eq!(handlers::select_queue(1, true, true), "high");
    assert_eq!(handlers::select_queue(1, true, false), "low");
    assert_eq!(handlers::select_queue(1, false, true), "low");
}

#[test]
fn test_job_timeout_sums_all_groups() {
    let settings = json!({"testers": [
        {"test_data": [{"timeout": 10}, {"timeout": 5}]},
        {"test_data": [{"timeout": 1}]}
    ]});
    assert_eq!(handlers::job_timeout(&settings, 1.5), 24);
    assert_eq!(handlers::job_timeout(&json!({}), 1.5), 0);
}

#[tokio::test]
async fn test_errored_settings_cannot_run() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({"_error": "boom"})).await;
    let (status, body) = fx
        .send(
            "PUT",
            "/settings/1/test",
            Some(KEY),
            Some(json!({"test_data": [{"file_url": "u"}], "categories": []})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["message"], "Settings Error: boom");
}

#[tokio::test]
async fn test_finished_result_is_returned_once() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let id = fx.run_tests(1, 1).await[0];

    let mut job = fx.state.broker.fetch(&id.to_string()).await.unwrap().unwrap();
    fx.state.broker.finish(&mut job).await.unwrap();
    let payload = json!({"test_groups": [{"time": 5, "tests": []}], "error": null});
    fx.state
        .kv
        .set(&keys::test_result(id), payload.to_string().as_bytes(), Some(3600))
        .await
        .unwrap();

    let uri = format!("/settings/1/test/{}", id);
    let (status, body) = fx.send("GET", &uri, Some(KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["test_groups"][0]["time"], 5);

    let (status, _) = fx.send("GET", &uri, Some(KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(fx.state.kv.get(&keys::test_result(id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_and_queued_results() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let ids = fx.run_tests(1, 1).await;
    let uri = format!("/settings/1/test/{}", ids[0]);

    let (_, body) = fx.send("GET", &uri, Some(KEY), None).await;
    assert_eq!(body["status"], "queued");
    assert!(body.get("error").is_none());

    let mut job = fx.state.broker.fetch(&ids[0].to_string()).await.unwrap().unwrap();
    fx.state
        .broker
        .fail(&mut job, "Job exceeded maximum timeout value")
        .await
        .unwrap();
    let (_, body) = fx.send("GET", &uri, Some(KEY), None).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "Job exceeded maximum timeout value");
}

#[tokio::test]
async fn test_result_requires_test_of_settings() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    fx.install_settings(2, KEY, json!({})).await;
    let id = fx.run_tests(1, 1).await[0];

    let (status, _) = fx
        .send("GET", &format!("/settings/2/test/{}", id), Some(KEY), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = fx.send("GET", "/settings/1/test/99", Some(KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Test not found");
}

#[tokio::test]
async fn test_feedback_is_single_use() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    let id = fx.run_tests(1, 1).await[0];
    let blob = autotest_core::runner::feedback::gzip(b"well done").unwrap();
    fx.state
        .kv
        .set(&keys::feedback_file(id, 7), &blob, Some(3600))
        .await
        .unwrap();

    let uri = format!("/settings/1/test/{}/feedback/7", id);
    let (status, bytes) = fx.send_raw("GET", &uri, Some(KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, blob);

    let (status, body) = fx.send("GET", &uri, Some(KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "File doesn't exist");
}

#[tokio::test]
async fn test_statuses_and_cancel() {
    let fx = fixture().await;
    fx.install_settings(1, KEY, json!({})).await;
    fx.install_settings(2, KEY, json!({})).await;
    let ours = fx.run_tests(1, 1).await[0];
    let theirs = fx.run_tests(2, 1).await[0];

    let (status, body) = fx
        .send(
            "GET",
            "/settings/1/tests/status",
            Some(KEY),
            Some(json!({"test_ids": [ours, theirs, 42]})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[ours.to_string()], "queued");
    assert_eq!(body[theirs.to_string()], Value::Null);
    assert_eq!(body["42"], Value::Null);

    let (status, body) = fx
        .send(
            "DELETE",
            "/settings/1/tests/cancel",
            Some(KEY),
            Some(json!({"test_ids": [ours, theirs]})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(
        fx.state.broker.status(&ours.to_string()).await.unwrap(),
        JobStatus::Canceled
    );
    assert_eq!(
        fx.state.broker.status(&theirs.to_string()).await.unwrap(),
        JobStatus::Queued
    );
}

#[tokio::test]
async fn test_reset_credentials() {
    let fx = fixture().await;
    let (status, body) = fx
        .send(
            "PUT",
            "/reset_credentials",
            Some(KEY),
            Some(json!({"auth_type": "Token", "credentials": "new"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let stored = fx.state.kv.hget(keys::USER_CREDENTIALS, KEY).await.unwrap().unwrap();
    assert!(stored.contains("\"new\""));
}

#[tokio::test]
async fn test_malformed_body_gets_message() {
    let fx = fixture().await;
    let (status, body) = fx
        .send("POST", "/settings", Some(KEY), Some(json!({"settings": {}})))
        .await;
    assert!(status.is_client_error());
    assert!(body["message"].as_str().unwrap().contains("file_url"));
}
