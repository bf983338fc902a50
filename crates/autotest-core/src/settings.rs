//! Test settings records and the job that installs them
//!
//! Settings are stored as JSON blobs in the `settings` hash, keyed by id.
//! Client-supplied fields are kept as sent; the service maintains the
//! underscore-prefixed fields (`_user`, `_files`, `_error` and each
//! tester's `_env`). Last use is tracked apart from the blob in
//! `settings_last_access`, so test jobs never write the settings back.

use crate::config::AutotestConfig;
use crate::errors::AutotestError;
use crate::fetch::{download, load_credentials};
use crate::kv::{keys, KvStore, SharedStore};
use crate::runner::files;
use crate::schema;
use crate::testers::{get_tester, run_checked};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

pub const EXPIRED_MESSAGE: &str =
    "the settings for this test have expired, please re-upload the settings.";

/// Arguments of an `update_test_settings` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsJob {
    pub user: String,
    pub settings_id: i64,
    pub test_settings: Value,
    pub file_url: String,
}

pub async fn load_settings(kv: &dyn KvStore, settings_id: i64) -> Result<Option<Value>, AutotestError> {
    match kv.hget(keys::SETTINGS, &settings_id.to_string()).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_settings(kv: &dyn KvStore, settings_id: i64, settings: &Value) -> Result<(), AutotestError> {
    kv.hset(
        keys::SETTINGS,
        &settings_id.to_string(),
        &serde_json::to_string(settings)?,
    )
    .await
}

pub async fn touch_last_access(kv: &dyn KvStore, settings_id: i64) -> Result<(), AutotestError> {
    kv.hset(
        keys::SETTINGS_LAST_ACCESS,
        &settings_id.to_string(),
        &chrono::Utc::now().timestamp().to_string(),
    )
    .await
}

pub async fn last_access(kv: &dyn KvStore, settings_id: i64) -> Result<Option<i64>, AutotestError> {
    Ok(kv
        .hget(keys::SETTINGS_LAST_ACCESS, &settings_id.to_string())
        .await?
        .and_then(|raw| raw.parse().ok()))
}

/// The settings as shown to their owner: service-maintained fields are
/// dropped except `_error`, which reports a failed installation.
pub fn public_view(settings: &Value) -> Value {
    let mut view = settings.clone();
    if let Some(obj) = view.as_object_mut() {
        obj.retain(|key, _| !key.starts_with('_') || key == "_error");
        if let Some(testers) = obj.get_mut("testers").and_then(Value::as_array_mut) {
            for tester in testers {
                if let Some(tester) = tester.as_object_mut() {
                    tester.retain(|key, _| !key.starts_with('_'));
                }
            }
        }
    }
    view
}

/// Create the shared default environment when it does not exist yet.
pub async fn ensure_default_env(dir: &Path) -> Result<(), AutotestError> {
    if dir.is_dir() {
        return Ok(());
    }
    log::info!("Creating default environment at {}", dir.display());
    let mut venv = Command::new("python3");
    venv.arg("-m").arg("venv").arg(dir);
    run_checked(venv, "python3 -m venv").await
}

pub struct SettingsManager {
    config: Arc<AutotestConfig>,
    kv: SharedStore,
    http: reqwest::Client,
}

impl SettingsManager {
    pub fn new(config: Arc<AutotestConfig>, kv: SharedStore) -> Self {
        Self {
            config,
            kv,
            http: reqwest::Client::new(),
        }
    }

    /// Install the instructor files and provision every tester environment,
    /// then write the settings back. The stored record carries `_error`
    /// exactly when this fails.
    pub async fn update_test_settings(&self, job: &SettingsJob) -> Result<Value, AutotestError> {
        let mut settings = job.test_settings.clone();
        let outcome = self.install(job, &mut settings).await;

        if let Some(obj) = settings.as_object_mut() {
            match &outcome {
                Ok(()) => {
                    obj.remove("_error");
                }
                Err(e) => {
                    obj.insert("_error".to_string(), json!(e.to_string()));
                }
            }
            obj.insert("_user".to_string(), json!(job.user));
        }
        save_settings(self.kv.as_ref(), job.settings_id, &settings).await?;

        match outcome {
            Ok(()) => {
                log::info!("Installed settings {}", job.settings_id);
                Ok(settings)
            }
            Err(e) => {
                log::warn!("Installing settings {} failed: {}", job.settings_id, e);
                Err(e)
            }
        }
    }

    async fn install(&self, job: &SettingsJob, settings: &mut Value) -> Result<(), AutotestError> {
        let scripts_dir = self.config.scripts_dir();
        let settings_dir = self.config.settings_dir(job.settings_id);
        tokio::fs::create_dir_all(&settings_dir).await?;
        files::set_mode(&scripts_dir, 0o755)?;

        let files_dir = settings_dir.join("files");
        match tokio::fs::remove_dir_all(&files_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&files_dir).await?;

        let credentials = load_credentials(self.kv.as_ref(), &job.user).await?;
        let archive = download(&self.http, &job.file_url, &credentials).await?;
        files::extract_zip(archive, &files_dir, 0)?;

        let schema = schema::load(self.kv.as_ref()).await?.ok_or_else(|| {
            AutotestError::ConfigError("no tester schema installed".to_string())
        })?;
        let installed = schema::installed_testers(&schema);
        let default_env = self.config.default_env_dir();

        let testers = settings
            .get_mut("testers")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| AutotestError::ValidationError("settings have no testers".to_string()))?;
        for (i, tester_settings) in testers.iter_mut().enumerate() {
            let tester_type = tester_settings
                .get("tester_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !installed.contains(&tester_type) {
                return Err(AutotestError::ValidationError(format!(
                    "tester {} is not installed",
                    tester_type
                )));
            }
            let env_dir = settings_dir.join(format!("{}_{}", tester_type, i));
            let tester = get_tester(&tester_type, &self.config.testers_dir)?;
            ensure_default_env(&default_env).await?;

            let env = tester
                .create_environment(tester_settings, &env_dir, &default_env)
                .await
                .map_err(|e| match e {
                    AutotestError::TesterCreationError(msg) => AutotestError::TesterCreationError(msg),
                    other => AutotestError::TesterCreationError(other.to_string()),
                })?;
            log::debug!("Provisioned {} in {}", tester_type, env_dir.display());
            if let Some(obj) = tester_settings.as_object_mut() {
                obj.insert("_env".to_string(), json!(env));
            }
        }

        if let Some(obj) = settings.as_object_mut() {
            obj.insert("_files".to_string(), json!(files_dir.display().to_string()));
        }
        Ok(())
    }

    /// Remove the installed files of settings not used for `age_days` days
    /// and mark them expired. Returns the affected ids.
    pub async fn clean_stale(&self, age_days: u64, dry_run: bool) -> Result<Vec<i64>, AutotestError> {
        let cutoff = chrono::Utc::now().timestamp() - (age_days as i64) * 86_400;
        let mut expired = Vec::new();

        let mut all: Vec<(i64, String)> = self
            .kv
            .hgetall(keys::SETTINGS)
            .await?
            .into_iter()
            .filter_map(|(id, raw)| id.parse().ok().map(|id| (id, raw)))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        let accessed = self.kv.hgetall(keys::SETTINGS_LAST_ACCESS).await?;

        for (id, raw) in all {
            let mut settings: Value = match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Skipping unreadable settings {}: {}", id, e);
                    continue;
                }
            };
            let last_access = accessed
                .get(&id.to_string())
                .and_then(|raw| raw.parse::<i64>().ok());
            if last_access.is_some_and(|t| t >= cutoff) {
                continue;
            }
            if settings.get("_error").and_then(Value::as_str) == Some(EXPIRED_MESSAGE) {
                continue;
            }
            expired.push(id);
            if dry_run {
                continue;
            }

            let dir = self.config.settings_dir(id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(obj) = settings.as_object_mut() {
                obj.insert("_error".to_string(), json!(EXPIRED_MESSAGE));
            }
            save_settings(self.kv.as_ref(), id, &settings).await?;
            log::info!("Expired settings {}", id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::testers::all_testers;
    use crate::test_utils::{register, serve_files, test_config, zip_bytes};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Arc<AutotestConfig>,
        kv: SharedStore,
        url: String,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        std::fs::create_dir_all(config.default_env_dir()).unwrap();

        let kv: SharedStore = Arc::new(MemoryStore::new());
        register(kv.as_ref(), "key").await;
        let testers: Vec<(String, Value)> = all_testers(&config.testers_dir)
            .unwrap()
            .iter()
            .map(|t| (t.name().to_string(), t.settings_schema()))
            .collect();
        schema::store(kv.as_ref(), &schema::build_schema(&testers)).await.unwrap();

        let archive = zip_bytes(&[("a.py", Some("def f(): pass")), ("b.py", Some("x = 1"))]);
        let base = serve_files(vec![("/files.zip", archive)]).await;
        Fixture {
            _dir: dir,
            config,
            kv,
            url: format!("{}/files.zip", base),
        }
    }

    fn job(fx: &Fixture, test_settings: Value) -> SettingsJob {
        SettingsJob {
            user: "key".to_string(),
            settings_id: 1,
            test_settings,
            file_url: fx.url.clone(),
        }
    }

    #[tokio::test]
    async fn test_successful_install_sets_private_fields() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let settings = json!({
            "_error": "previous failure",
            "testers": [{"tester_type": "custom", "test_data": [{"script_files": ["a.py"], "timeout": 30}]}]
        });
        manager.update_test_settings(&job(&fx, settings)).await.unwrap();

        let stored = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
        assert_eq!(stored["_user"], "key");
        assert!(stored.get("_error").is_none());
        let files_dir = stored["_files"].as_str().unwrap();
        assert!(files_dir.ends_with("/scripts/1/files"));
        assert!(Path::new(files_dir).join("a.py").is_file());
        assert!(Path::new(files_dir).join("b.py").is_file());
        assert_eq!(
            stored["testers"][0]["_env"]["PYTHON"],
            fx.config.default_env_dir().join("bin/python3").display().to_string()
        );
    }

    #[tokio::test]
    async fn test_python_tester_gets_its_own_venv() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let settings = json!({
            "testers": [{
                "tester_type": "python",
                "env_data": {"python_version": "3", "pip_requirements": ""},
                "test_data": [{"script_files": ["a.py"], "timeout": 30}]
            }]
        });
        manager.update_test_settings(&job(&fx, settings)).await.unwrap();

        let stored = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
        assert!(stored.get("_error").is_none());
        let env_dir = fx.config.settings_dir(1).join("python_0");
        let python = env_dir.join("bin/python3");
        assert_eq!(stored["testers"][0]["_env"]["PYTHON"], python.display().to_string());
        assert!(python.exists());
        assert!(env_dir.join("pyvenv.cfg").is_file());
    }

    #[tokio::test]
    async fn test_reinstall_replaces_files() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let stale = fx.config.settings_dir(1).join("files").join("old.py");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "").unwrap();

        let settings = json!({"testers": [{"tester_type": "custom", "test_data": []}]});
        manager.update_test_settings(&job(&fx, settings)).await.unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_uninstalled_tester_records_error() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let settings = json!({"testers": [{"tester_type": "cobol", "test_data": []}]});
        assert!(manager.update_test_settings(&job(&fx, settings)).await.is_err());

        let stored = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
        assert_eq!(stored["_error"], "tester cobol is not installed");
        assert_eq!(stored["_user"], "key");
        assert!(stored.get("_files").is_none());
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_tester_creation_error() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let settings = json!({
            "testers": [{"tester_type": "r", "env_data": {"requirements": true}, "test_data": []}]
        });
        let err = manager.update_test_settings(&job(&fx, settings)).await.unwrap_err();
        assert!(matches!(err, AutotestError::TesterCreationError(_)));

        let stored = load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap();
        let message = stored["_error"].as_str().unwrap();
        assert!(message.starts_with("create tester environment failed:\n"));
        assert_eq!(message.matches("create tester environment failed").count(), 1);
    }

    #[test]
    fn test_public_view_hides_private_fields() {
        let settings = json!({
            "_user": "key",
            "_files": "/ws/scripts/1/files",
            "_error": "boom",
            "testers": [{"tester_type": "custom", "_env": {"PYTHON": "/x"}, "test_data": []}]
        });
        assert_eq!(
            public_view(&settings),
            json!({
                "_error": "boom",
                "testers": [{"tester_type": "custom", "test_data": []}]
            })
        );
    }

    #[tokio::test]
    async fn test_clean_stale_settings() {
        let fx = fixture().await;
        let manager = SettingsManager::new(fx.config.clone(), fx.kv.clone());
        let now = chrono::Utc::now().timestamp();
        for id in 1..=3 {
            save_settings(fx.kv.as_ref(), id, &json!({"_user": "key"})).await.unwrap();
        }
        touch_last_access(fx.kv.as_ref(), 1).await.unwrap();
        fx.kv
            .hset(keys::SETTINGS_LAST_ACCESS, "2", &(now - 40 * 86_400).to_string())
            .await
            .unwrap();
        std::fs::create_dir_all(fx.config.settings_dir(2).join("files")).unwrap();

        assert_eq!(manager.clean_stale(30, true).await.unwrap(), vec![2, 3]);
        assert!(fx.config.settings_dir(2).exists());

        assert_eq!(manager.clean_stale(30, false).await.unwrap(), vec![2, 3]);
        assert!(!fx.config.settings_dir(2).exists());
        let stored = load_settings(fx.kv.as_ref(), 2).await.unwrap().unwrap();
        assert_eq!(stored["_error"], EXPIRED_MESSAGE);
        assert!(load_settings(fx.kv.as_ref(), 1).await.unwrap().unwrap().get("_error").is_none());

        assert!(manager.clean_stale(30, false).await.unwrap().is_empty());
    }
}
