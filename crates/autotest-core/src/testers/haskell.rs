use super::{
    default_python, run_checked, run_system_requirements, test_data_schema, tester_schema,
    TesterEnv, TesterSetup,
};
use crate::errors::AutotestError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;

const STACK_RESOLVER: &str = "lts-14.27";
const TEST_DEPS: [&str; 2] = ["tasty-discover", "tasty-quickcheck"];

pub struct HaskellTester {
    pub(crate) package_dir: PathBuf,
}

#[async_trait]
impl TesterSetup for HaskellTester {
    fn name(&self) -> &'static str {
        "haskell"
    }

    fn settings_schema(&self) -> Value {
        let test_data = test_data_schema(
            json!({
                "test_timeout": {
                    "type": "integer",
                    "title": "Per-test timeout",
                    "minimum": 1,
                    "default": 10
                },
                "test_cases": {
                    "type": "integer",
                    "title": "Number of QuickCheck test cases",
                    "minimum": 1,
                    "default": 100
                }
            }),
            &["script_files"],
        );
        tester_schema("haskell", "Haskell", None, test_data)
    }

    async fn install(&self) -> Result<(), AutotestError> {
        run_system_requirements(&self.package_dir).await
    }

    /// Builds the test dependencies into the shared stack snapshot.
    async fn create_environment(
        &self,
        _settings: &Value,
        _env_dir: &Path,
        default_env_dir: &Path,
    ) -> Result<TesterEnv, AutotestError> {
        let mut stack = Command::new("stack");
        stack
            .arg("build")
            .arg("--resolver")
            .arg(STACK_RESOLVER)
            .arg("--system-ghc")
            .args(TEST_DEPS);
        run_checked(stack, "stack build").await?;
        Ok(default_python(default_env_dir))
    }
}
