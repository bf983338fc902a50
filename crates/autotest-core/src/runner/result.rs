use super::feedback::FeedbackRecord;
use super::partial_json::{loads_partial_json, JsonKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of running one test group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGroupResult {
    /// Wall-clock milliseconds
    pub time: u64,
    /// The group's timeout in seconds when it expired
    pub timeout: Option<u64>,
    pub tests: Vec<Value>,
    pub stderr: Option<String>,
    /// The raw stdout when it could not be fully decoded
    pub malformed: Option<String>,
    pub extra_info: Value,
    pub annotations: Option<Value>,
    pub feedback: Vec<FeedbackRecord>,
}

/// Payload published at `test_result:{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub test_groups: Vec<TestGroupResult>,
    pub error: Option<String>,
}

impl TestGroupResult {
    pub fn from_output(
        stdout: &str,
        stderr: &str,
        time: u64,
        extra_info: Value,
        feedback: Vec<FeedbackRecord>,
        timeout: Option<u64>,
    ) -> Self {
        let (values, malformed) = loads_partial_json(stdout, Some(JsonKind::Object));
        let mut tests = Vec::new();
        let mut annotations = None;
        for mut value in values {
            match value.as_object_mut().and_then(|o| o.remove("annotations")) {
                Some(found) => annotations = Some(found),
                None => tests.push(value),
            }
        }
        let extra_info = match extra_info {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            time,
            timeout,
            tests,
            stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
            malformed: malformed.then(|| stdout.to_string()),
            extra_info,
            annotations,
            feedback,
        }
    }
}
