use super::*;
use crate::config::{PortRange, WorkerResources};
use crate::kv::MemoryStore;
use crate::settings::{last_access, save_settings};
use crate::test_utils::{register, serve_files, test_config, zip_bytes};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    config: Arc<AutotestConfig>,
    kv: SharedStore,
    files_url: String,
}

/// A stand-in interpreter: ignores its arguments, records that it ran and
/// prints one passing test plus whatever `$EXTRA` says.
const FAKE_TESTER: &str = r#"#!/bin/sh
cat > spec.json
touch "$MARKER"
echo '{"name":"test_a","output":"","marks_earned":1,"marks_total":1,"status":"pass","time":null}'
if [ -n "$EXTRA" ]; then echo "$EXTRA"; fi
if [ -f sleep_forever ]; then sleep 30; fi
echo "feedback" > feedback.txt
echo "warning" >&2
"#;

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(dir.path()));
    let kv: SharedStore = Arc::new(MemoryStore::new());
    register(kv.as_ref(), "key").await;

    let submission = zip_bytes(&[
        ("submission/", None),
        ("submission/a.py", Some("def f(): return 1")),
    ]);
    let base = serve_files(vec![("/submission.zip", submission)]).await;

    let instructor = config.settings_dir(1).join("files");
    fs::create_dir_all(instructor.join("tests")).unwrap();
    fs::write(instructor.join("tests").join("test_a.py"), "assert True").unwrap();

    let python = dir.path().join("fake_python");
    fs::write(&python, FAKE_TESTER).unwrap();
    files::set_mode(&python, 0o755).unwrap();

    Fixture {
        dir,
        config,
        kv,
        files_url: format!("{}/submission.zip", base),
    }
}

impl Fixture {
    fn marker(&self) -> PathBuf {
        self.dir.path().join("ran")
    }

    fn tester_env(&self, extra: Option<&str>) -> Value {
        let mut env = json!({
            "PYTHON": self.dir.path().join("fake_python").display().to_string(),
            "MARKER": self.marker().display().to_string()
        });
        if let Some(extra) = extra {
            env["EXTRA"] = json!(extra);
        }
        env
    }

    async fn install_settings(&self, test_data: Value, extra: Option<&str>) {
        let settings = json!({
            "_user": "key",
            "_files": self.config.settings_dir(1).join("files").display().to_string(),
            "testers": [{
                "tester_type": "custom",
                "_env": self.tester_env(extra),
                "test_data": test_data
            }]
        });
        save_settings(self.kv.as_ref(), 1, &settings).await.unwrap();
    }

    fn job(&self) -> TestJob {
        TestJob {
            settings_id: 1,
            test_id: 9,
            files_url: self.files_url.clone(),
            categories: vec!["instructor".to_string()],
            user: "key".to_string(),
            test_env_vars: EnvMap::new(),
        }
    }

    fn runner(&self) -> Runner {
        let user = self.config.workers[0].user.clone();
        Runner::new(self.config.clone(), self.kv.clone(), Some(user))
    }

    fn scratch(&self) -> PathBuf {
        self.config.worker_dir(&self.config.workers[0].user)
    }

    async fn published(&self) -> TestRunResult {
        let raw = self.kv.get(&keys::test_result(9)).await.unwrap().unwrap();
        serde_json::from_slice(&raw).unwrap()
    }
}

#[tokio::test]
async fn test_runs_selected_groups_and_publishes() {
    let fx = fixture().await;
    fx.install_settings(
        json!([
            {"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10,
             "feedback_file_names": ["feedback.txt"], "extra_info": {"name": "group 1"}},
            {"script_files": ["tests/test_a.py"], "category": ["student"], "timeout": 10}
        ]),
        Some(r#"{"annotations":[{"filename":"a.py","content":"nit"}]}"#),
    )
    .await;

    let result = fx.runner().run_test(&fx.job()).await.unwrap();
    assert_eq!(result.error, None);
    assert_eq!(result.test_groups.len(), 1);

    let group = &result.test_groups[0];
    assert_eq!(group.tests.len(), 1);
    assert_eq!(group.tests[0]["status"], "pass");
    assert_eq!(group.annotations, Some(json!([{"filename": "a.py", "content": "nit"}])));
    assert_eq!(group.stderr.as_deref().map(str::trim), Some("warning"));
    assert_eq!(group.malformed, None);
    assert_eq!(group.timeout, None);
    assert_eq!(group.extra_info, json!({"name": "group 1"}));
    assert_eq!(group.feedback.len(), 1);
    assert_eq!(group.feedback[0].filename, "feedback.txt");
    assert!(fx
        .kv
        .get(&keys::feedback_file(9, group.feedback[0].id))
        .await
        .unwrap()
        .is_some());

    assert_eq!(fx.published().await, result);
    assert!(last_access(fx.kv.as_ref(), 1).await.unwrap().is_some());
    let settings = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
    assert!(settings.get("_last_access").is_none());

    let scratch = fx.scratch();
    assert!(scratch.is_dir());
    assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
}

#[tokio::test]
async fn test_tester_receives_spec_and_files() {
    let fx = fixture().await;
    // Without the cleanup guard the scratch keeps what the tester saw.
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10}]),
        None,
    )
    .await;
    let runner = fx.runner();
    let identity = runner.identity().unwrap();
    workspace::prepare_scratch(&identity.scratch, &identity.worker.user).unwrap();
    let settings = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
    let mut groups = Vec::new();
    runner
        .run_in_scratch(&fx.job(), &settings, &identity, &mut groups)
        .await
        .unwrap();

    let scratch = &identity.scratch;
    assert!(scratch.join("a.py").is_file());
    assert!(scratch.join("tests/test_a.py").is_file());
    let spec: Value = serde_json::from_str(&fs::read_to_string(scratch.join("spec.json")).unwrap()).unwrap();
    assert_eq!(spec["tester_type"], "custom");
    assert_eq!(spec["test_data"]["timeout"], 10);

    use std::os::unix::fs::PermissionsExt;
    let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode(&scratch.join("a.py")), 0o770);
    assert_eq!(mode(&scratch.join("tests")), 0o1770);
    assert_eq!(mode(&scratch.join("tests/test_a.py")), 0o640);
}

#[tokio::test]
async fn test_env_conflict_fails_before_spawn() {
    let fx = fixture().await;
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10}]),
        None,
    )
    .await;
    let mut job = fx.job();
    job.test_env_vars.insert("PYTHON".to_string(), "/bin/false".to_string());

    let result = fx.runner().run_test(&job).await.unwrap();
    assert!(result.test_groups.is_empty());
    assert_eq!(
        result.error.as_deref(),
        Some("The following environment variables cannot be overwritten for this test: PYTHON")
    );
    assert!(!fx.marker().exists());
    assert_eq!(fs::read_dir(fx.scratch()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_port_resource_cannot_be_overwritten() {
    let fx = fixture().await;
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10}]),
        None,
    )
    .await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut config = (*fx.config).clone();
    config.workers[0].resources = Some(WorkerResources {
        port: Some(PortRange { min: port, max: port }),
        postgresql_url: None,
    });
    let user = config.workers[0].user.clone();
    let runner = Runner::new(Arc::new(config), fx.kv.clone(), Some(user));

    let mut job = fx.job();
    job.test_env_vars.insert("PORT".to_string(), "8080".to_string());
    let result = runner.run_test(&job).await.unwrap();
    assert!(result.test_groups.is_empty());
    assert_eq!(
        result.error.as_deref(),
        Some("The following environment variables cannot be overwritten for this test: PORT")
    );
    assert!(!fx.marker().exists());
}

#[tokio::test]
async fn test_run_leaves_settings_blob_untouched() {
    let fx = fixture().await;
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10}]),
        None,
    )
    .await;
    let before = fx.kv.hget(keys::SETTINGS, "1").await.unwrap().unwrap();

    let result = fx.runner().run_test(&fx.job()).await.unwrap();
    assert_eq!(result.error, None);
    assert_eq!(fx.kv.hget(keys::SETTINGS, "1").await.unwrap().unwrap(), before);
    let accessed = last_access(fx.kv.as_ref(), 1).await.unwrap().unwrap();
    assert!(accessed >= chrono::Utc::now().timestamp() - 60);
}

#[tokio::test]
async fn test_timeout_is_not_an_error() {
    let fx = fixture().await;
    fs::write(fx.config.settings_dir(1).join("files").join("sleep_forever"), "").unwrap();
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 1}]),
        None,
    )
    .await;

    let result = fx.runner().run_test(&fx.job()).await.unwrap();
    assert_eq!(result.error, None);
    let group = &result.test_groups[0];
    assert_eq!(group.timeout, Some(1));
    assert_eq!(group.tests.len(), 1);
    assert!(group.time >= 1000);
}

#[tokio::test]
async fn test_missing_feedback_file_fails_job() {
    let fx = fixture().await;
    fx.install_settings(
        json!([{"script_files": ["tests/test_a.py"], "category": ["instructor"], "timeout": 10,
                "feedback_file_names": ["missing.html"]}]),
        None,
    )
    .await;
    let result = fx.runner().run_test(&fx.job()).await.unwrap();
    assert!(result.test_groups.is_empty());
    assert!(result.error.unwrap().starts_with("Cannot find feedback file at"));
}

#[tokio::test]
async fn test_missing_settings_is_published_as_error() {
    let fx = fixture().await;
    let result = fx.runner().run_test(&fx.job()).await.unwrap();
    assert!(result.error.unwrap().contains("settings 1 do not exist"));
    assert!(fx.published().await.test_groups.is_empty());
}

#[tokio::test]
async fn test_missing_worker_user_fails_job() {
    let fx = fixture().await;
    fx.install_settings(json!([]), None).await;
    let runner = Runner::new(fx.config.clone(), fx.kv.clone(), None);
    let result = runner.run_test(&fx.job()).await.unwrap();
    assert!(result.error.unwrap().contains("No worker users available to run this job"));
}

#[test]
fn test_bootstrap_imports_tester_module() {
    let script = tester_bootstrap(Path::new("/opt/testers"), "pyta");
    assert_eq!(
        script,
        "import sys, json; sys.path.append(\"/opt/testers\"); \
         from testers.pyta.pyta_tester import PytaTester as Tester; \
         from testers.specs import TestSpecs; \
         Tester(specs=TestSpecs.from_json(sys.stdin.read())).run()"
    );
}

#[test]
fn test_category_selection() {
    let categories = vec!["instructor".to_string()];
    assert!(category_selected(&json!({"category": ["student", "instructor"]}), &categories));
    assert!(!category_selected(&json!({"category": ["student"]}), &categories));
    assert!(!category_selected(&json!({}), &categories));
}
