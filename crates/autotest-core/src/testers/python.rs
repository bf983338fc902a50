//! Python-based testers, each provisioned as an isolated virtualenv.

use super::{
    available_python_versions, env_str, run_checked, test_data_schema, tester_schema,
    TesterEnv, TesterSetup,
};
use crate::errors::AutotestError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;

const PYTA_VERSION: &str = "2.7.0";

pub struct PythonTester {
    pub(crate) package_dir: PathBuf,
}

pub struct PytaTester {
    pub(crate) package_dir: PathBuf,
}

pub struct JupyterTester {
    pub(crate) package_dir: PathBuf,
}

fn python_env_schema(versions: Vec<String>, mut extra: Value) -> Value {
    let mut python_version = json!({ "type": "string", "title": "Python version" });
    match versions.last().cloned() {
        Some(latest) => {
            python_version["default"] = json!(latest);
            python_version["enum"] = json!(versions);
        }
        None => python_version["default"] = json!("3"),
    }
    let mut properties = json!({
        "python_version": python_version,
        "pip_requirements": {
            "type": "string",
            "title": "Package requirements",
            "default": ""
        }
    });
    if let (Some(properties), Some(extra)) = (properties.as_object_mut(), extra.as_object_mut()) {
        properties.append(extra);
    }
    json!({
        "type": "object",
        "title": "Python environment",
        "properties": properties
    })
}

/// Accept only dotted numeric versions such as `3` or `3.12`.
pub(crate) fn check_python_version(version: &str) -> Result<(), AutotestError> {
    let pattern = Regex::new(r"^\d+(\.\d+)*$")
        .map_err(|e| AutotestError::InternalError(format!("invalid version pattern: {}", e)))?;
    if !pattern.is_match(version) {
        return Err(AutotestError::ValidationError(format!(
            "invalid python version '{}'",
            version
        )));
    }
    Ok(())
}

/// Create a virtualenv in `env_dir` and install the package requirements,
/// `packages`, and the settings' own pip requirements into it.
async fn create_venv(
    settings: &Value,
    env_dir: &Path,
    package_dir: &Path,
    mut packages: Vec<String>,
    allow_requirements_file: bool,
) -> Result<TesterEnv, AutotestError> {
    let version = env_str(settings, "python_version").unwrap_or("3");
    check_python_version(version)?;
    let mut venv = Command::new(format!("python{}", version));
    venv.arg("-m").arg("venv").arg("--clear").arg(env_dir);
    run_checked(venv, &format!("python{} -m venv", version)).await?;

    packages.extend(
        env_str(settings, "pip_requirements")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string),
    );

    let mut pip = Command::new(env_dir.join("bin").join("pip"));
    pip.arg("install");
    let mut install = !packages.is_empty();

    let requirements = package_dir.join("requirements.txt");
    if requirements.is_file() {
        pip.arg("-r").arg(&requirements);
        install = true;
    }
    if allow_requirements_file {
        if let Some(file) = env_str(settings, "pip_requirements_file").filter(|f| !f.is_empty()) {
            pip.arg("-r").arg(env_dir.join("..").join("files").join(file));
            install = true;
        }
    }

    if install {
        pip.arg("wheel").args(&packages);
        run_checked(pip, "pip install").await?;
    }

    let mut env = TesterEnv::new();
    env.insert(
        "PYTHON".to_string(),
        env_dir.join("bin").join("python3").display().to_string(),
    );
    Ok(env)
}

#[async_trait]
impl TesterSetup for PythonTester {
    fn name(&self) -> &'static str {
        "python"
    }

    fn settings_schema(&self) -> Value {
        let env_data = python_env_schema(
            available_python_versions(11..=13),
            json!({
                "pip_requirements_file": {
                    "type": "string",
                    "title": "Package requirements file"
                }
            }),
        );
        let test_data = test_data_schema(
            json!({
                "tester": {
                    "type": "string",
                    "title": "Test runner",
                    "enum": ["pytest", "unittest"],
                    "default": "pytest"
                },
                "output_verbosity": {
                    "type": "string",
                    "title": "Output verbosity",
                    "enum": ["short", "long", "auto", "line", "native", "no"],
                    "default": "short"
                }
            }),
            &["script_files"],
        );
        tester_schema("python", "Python", Some(env_data), test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        Ok(())
    }

    async fn create_environment(
        &self,
        settings: &Value,
        env_dir: &Path,
        _default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        create_venv(settings, env_dir, &self.package_dir, Vec::new(), true).await
    }
}

#[async_trait]
impl TesterSetup for PytaTester {
    fn name(&self) -> &'static str {
        "pyta"
    }

    fn settings_schema(&self) -> Value {
        let env_data = python_env_schema(
            available_python_versions(11..=13),
            json!({
                "pip_requirements_file": {
                    "type": "string",
                    "title": "Package requirements file"
                },
                "pyta_version": {
                    "type": "string",
                    "title": "PyTA version",
                    "default": PYTA_VERSION
                }
            }),
        );
        let test_data = test_data_schema(
            json!({
                "student_files": {
                    "type": "array",
                    "title": "Student files",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "file_path": { "type": "string", "title": "Path" },
                            "max_points": { "type": "integer", "title": "Maximum mark", "default": 10 }
                        },
                        "required": ["file_path"]
                    }
                },
                "config_file_name": { "type": "string", "title": "PyTA configuration" },
                "upload_annotations": {
                    "type": "boolean",
                    "title": "Upload annotations",
                    "default": true
                }
            }),
            &["student_files"],
        );
        tester_schema("pyta", "PyTA", Some(env_data), test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        Ok(())
    }

    async fn create_environment(
        &self,
        settings: &Value,
        env_dir: &Path,
        _default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        let version = env_str(settings, "pyta_version").unwrap_or(PYTA_VERSION);
        let packages = vec![format!("python-ta=={}", version)];
        create_venv(settings, env_dir, &self.package_dir, packages, true).await
    }
}

#[async_trait]
impl TesterSetup for JupyterTester {
    fn name(&self) -> &'static str {
        "jupyter"
    }

    fn settings_schema(&self) -> Value {
        let env_data = python_env_schema(available_python_versions(7..=12), json!({}));
        let test_data = test_data_schema(
            json!({
                "test_merge": {
                    "type": "boolean",
                    "title": "Check that notebooks can be merged",
                    "default": false
                }
            }),
            &["script_files"],
        );
        tester_schema("jupyter", "Jupyter", Some(env_data), test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        Ok(())
    }

    async fn create_environment(
        &self,
        settings: &Value,
        env_dir: &Path,
        _default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        create_venv(settings, env_dir, &self.package_dir, Vec::new(), false).await
    }
}
