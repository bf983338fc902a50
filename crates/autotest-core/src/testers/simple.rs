use super::{
    default_python, run_system_requirements, test_data_schema, tester_schema, TesterEnv,
    TesterSetup,
};
use crate::errors::AutotestError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const JUNIT_URL: &str = "https://repo1.maven.org/maven2/org/junit/platform/junit-platform-console-standalone/1.7.0/junit-platform-console-standalone-1.7.0.jar";

/// Runs instructor-supplied scripts directly.
pub struct CustomTester {
    pub(crate) package_dir: PathBuf,
}

pub struct JavaTester {
    pub(crate) package_dir: PathBuf,
}

pub struct RacketTester {
    pub(crate) package_dir: PathBuf,
}

#[async_trait]
impl TesterSetup for CustomTester {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn settings_schema(&self) -> Value {
        tester_schema(
            "custom",
            "Custom",
            None,
            test_data_schema(json!({}), &["script_files"]),
        )
    }

    async fn install(&self) -> Result<(), AutotestError> {
        log::debug!("custom tester has nothing to install at {}", self.package_dir.display());
        Ok(())
    }

    async fn create_environment(
        &self,
        _settings: &Value,
        _env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        Ok(default_python(default_env_dir))
    }
}

#[async_trait]
impl TesterSetup for JavaTester {
    fn name(&self) -> &'static str {
        "java"
    }

    fn settings_schema(&self) -> Value {
        let test_data = test_data_schema(
            json!({
                "classpath": { "type": "string", "title": "Java Class Path", "default": "." },
                "sources_path": { "type": "string", "title": "Java Sources (glob)", "default": "" }
            }),
            &["script_files"],
        );
        tester_schema("java", "Java", None, test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        run_system_requirements(&self.package_dir).await?;

        let lib_dir = self.package_dir.join("lib");
        tokio::fs::create_dir_all(&lib_dir).await?;
        log::info!("Downloading JUnit console launcher into {}", lib_dir.display());
        let response = reqwest::get(JUNIT_URL).await?;
        if !response.status().is_success() {
            return Err(AutotestError::InstallerError(format!(
                "Failed to download JUnit: HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(lib_dir.join("junit-platform-console-standalone.jar"), &bytes).await?;
        Ok(())
    }

    async fn create_environment(
        &self,
        _settings: &Value,
        _env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        Ok(default_python(default_env_dir))
    }
}

#[async_trait]
impl TesterSetup for RacketTester {
    fn name(&self) -> &'static str {
        "racket"
    }

    fn settings_schema(&self) -> Value {
        let test_data = test_data_schema(
            json!({
                "test_suite_name": {
                    "type": "string",
                    "title": "Test suite name",
                    "default": "all-tests"
                }
            }),
            &["script_files"],
        );
        tester_schema("racket", "Racket", None, test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        run_system_requirements(&self.package_dir).await
    }

    async fn create_environment(
        &self,
        _settings: &Value,
        _env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        Ok(default_python(default_env_dir))
    }
}
