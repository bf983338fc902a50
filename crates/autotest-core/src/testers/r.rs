use super::{
    default_python, run_checked, run_system_requirements, test_data_schema, tester_schema,
    TesterEnv, TesterSetup,
};
use crate::errors::AutotestError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// R tester. Packages are installed into a per-settings library directory.
pub struct RTester {
    pub(crate) package_dir: PathBuf,
}

#[async_trait]
impl TesterSetup for RTester {
    fn name(&self) -> &'static str {
        "r"
    }

    fn settings_schema(&self) -> Value {
        let env_data = json!({
            "type": "object",
            "title": "R environment",
            "properties": {
                "requirements": {
                    "type": "boolean",
                    "title": "Restore packages from renv.lock",
                    "default": false
                }
            }
        });
        tester_schema(
            "r",
            "R",
            Some(env_data),
            test_data_schema(json!({}), &["script_files"]),
        )
    }

    async fn install(&self) -> Result<(), AutotestError> {
        run_system_requirements(&self.package_dir).await
    }

    async fn create_environment(
        &self,
        settings: &Value,
        env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        tokio::fs::create_dir_all(env_dir).await?;
        let library = env_dir.display().to_string();
        let mut env = TesterEnv::new();
        env.insert("R_LIBS_SITE".to_string(), library.clone());
        env.insert("R_LIBS_USER".to_string(), library.clone());

        let restore = settings
            .pointer("/env_data/requirements")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if restore {
            let lock_file = self.package_dir.join("renv.lock");
            if !lock_file.is_file() {
                return Err(AutotestError::TesterCreationError(format!(
                    "renv.lock file not found in {}",
                    self.package_dir.display()
                )));
            }
            let mut rscript = Command::new("Rscript");
            rscript
                .arg(self.package_dir.join("lib").join("r_renv_setup.R"))
                .arg(&lock_file)
                .arg(env_dir)
                .env("R_LIBS_SITE", &library)
                .env("R_LIBS_USER", &library);
            run_checked(rscript, "Rscript r_renv_setup.R").await?;
        }

        env.extend(default_python(default_env_dir));
        Ok(env)
    }
}
