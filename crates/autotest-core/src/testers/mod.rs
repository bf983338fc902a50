//! Built-in tester registry
//!
//! Each tester type knows its settings schema, how to install its system
//! prerequisites and how to provision the per-settings environment the
//! tester subprocess runs in. The registry is a fixed match over the
//! supported names; the tester programs themselves live out of process in
//! the `testers/` package under the configured testers directory.

mod haskell;
mod python;
mod r;
mod simple;


use crate::errors::AutotestError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;

pub use haskell::HaskellTester;
pub use python::{JupyterTester, PytaTester, PythonTester};
pub use r::RTester;
pub use simple::{CustomTester, JavaTester, RacketTester};

/// Environment variables a tester environment exports to its test runs.
pub type TesterEnv = BTreeMap<String, String>;

/// A relative path whose segments are never `..`.
const RELATIVE_PATH_PATTERN: &str =
    r"^(?:[^/.][^/]*|\.[^/.][^/]*|\.\.[^/]+|\.)(?:/(?:[^/.][^/]*|\.[^/.][^/]*|\.\.[^/]+|\.))*$";

pub const TESTER_NAMES: [&str; 8] = [
    "custom", "python", "pyta", "jupyter", "haskell", "java", "racket", "r",
];

#[async_trait]
pub trait TesterSetup: Send + Sync {
    fn name(&self) -> &'static str;

    /// JSON schema for one entry of the settings' `testers` array.
    fn settings_schema(&self) -> Value;

    /// Install system-wide prerequisites. Runs once per host.
    async fn install(&self) -> Result<(), AutotestError>;

    /// Provision an environment for `settings` in `env_dir`.
    async fn create_environment(
        &self,
        settings: &Value,
        env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError>;
}

/// Resolve the tester registered as `name`. `testers_dir` is the directory
/// holding the `testers/` package.
pub fn get_tester(name: &str, testers_dir: &Path) -> Result<Box<dyn TesterSetup>, AutotestError> {
    let package_dir = testers_dir.join("testers").join(name);
    match name {
        "custom" => Ok(Box::new(CustomTester { package_dir })),
        "python" => Ok(Box::new(PythonTester { package_dir })),
        "pyta" => Ok(Box::new(PytaTester { package_dir })),
        "jupyter" => Ok(Box::new(JupyterTester { package_dir })),
        "haskell" => Ok(Box::new(HaskellTester { package_dir })),
        "java" => Ok(Box::new(JavaTester { package_dir })),
        "racket" => Ok(Box::new(RacketTester { package_dir })),
        "r" => Ok(Box::new(RTester { package_dir })),
        _ => Err(AutotestError::ConfigError(format!(
            "Unsupported tester type: {}",
            name
        ))),
    }
}

pub fn all_testers(testers_dir: &Path) -> Result<Vec<Box<dyn TesterSetup>>, AutotestError> {
    TESTER_NAMES
        .iter()
        .map(|name| get_tester(name, testers_dir))
        .collect()
}

/// The default environment's interpreter, shared by testers without their own.
pub(crate) fn default_python(default_env_dir: &Path) -> TesterEnv {
    let mut env = TesterEnv::new();
    env.insert(
        "PYTHON".to_string(),
        default_env_dir.join("bin").join("python3").display().to_string(),
    );
    env
}

pub(crate) fn env_str<'a>(settings: &'a Value, key: &str) -> Option<&'a str> {
    settings
        .get("env_data")
        .and_then(|env| env.get(key))
        .and_then(Value::as_str)
}

/// Run `cmd` to completion, failing with its stderr when it exits non-zero.
pub(crate) async fn run_checked(mut cmd: Command, what: &str) -> Result<(), AutotestError> {
    log::debug!("Running {}: {:?}", what, cmd);
    let output = cmd
        .output()
        .await
        .map_err(|e| AutotestError::CommandFailed(format!("could not run {}: {}", what, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AutotestError::CommandFailed(format!(
            "{} exited with {}: {}",
            what,
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Run the package's `requirements.system` script when it ships one.
pub(crate) async fn run_system_requirements(package_dir: &Path) -> Result<(), AutotestError> {
    let script = package_dir.join("requirements.system");
    if !script.is_file() {
        log::debug!("No system requirements at {}", script.display());
        return Ok(());
    }
    run_checked(Command::new(&script), &script.display().to_string())
        .await
        .map_err(|e| {
            AutotestError::InstallerError(format!(
                "{}\nYou may try to install the tester manually by running {} and then rerunning the installer.",
                e,
                script.display()
            ))
        })
}

/// Interpreter versions `python3.<minor>` found on PATH for the given minors.
pub(crate) fn available_python_versions(minors: std::ops::RangeInclusive<u32>) -> Vec<String> {
    minors
        .map(|minor| format!("3.{}", minor))
        .filter(|version| which::which(format!("python{}", version)).is_ok())
        .collect()
}

/// Schema for one `test_data` entry: the shared fields plus `extra`.
pub(crate) fn test_data_schema(extra: Value, required: &[&str]) -> Value {
    let mut properties = json!({
        "script_files": {
            "type": "array",
            "title": "Test files",
            "minItems": 1,
            "items": { "$ref": "#/definitions/files_list" }
        },
        "category": {
            "type": "array",
            "title": "Category",
            "uniqueItems": true,
            "items": { "$ref": "#/definitions/test_data_categories" }
        },
        "timeout": {
            "type": "integer",
            "title": "Timeout",
            "minimum": 1,
            "default": 30
        },
        "feedback_file_names": {
            "type": "array",
            "title": "Feedback files",
            "items": { "type": "string", "pattern": RELATIVE_PATH_PATTERN }
        },
        "extra_info": { "$ref": "#/definitions/extra_group_data" }
    });
    if let (Some(base), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        base.extend(extra);
    }
    let mut required: Vec<&str> = required.to_vec();
    required.push("timeout");
    json!({
        "type": "array",
        "title": "Test Groups",
        "minItems": 1,
        "items": {
            "type": "object",
            "properties": properties,
            "required": required
        }
    })
}

/// Top-level tester entry schema; `tester_type` is the discriminator.
pub(crate) fn tester_schema(
    name: &str,
    title: &str,
    env_data: Option<Value>,
    test_data: Value,
) -> Value {
    let mut properties = json!({
        "tester_type": { "type": "string", "enum": [name] },
        "test_data": test_data
    });
    if let (Some(env_data), Some(properties)) = (env_data, properties.as_object_mut()) {
        properties.insert("env_data".to_string(), env_data);
    }
    json!({
        "type": "object",
        "title": title,
        "properties": properties,
        "required": ["tester_type", "test_data"]
    })
}
