//! Key layout. All keys share the `autotest:` prefix.

pub const PREFIX: &str = "autotest";

pub const USER_CREDENTIALS: &str = "autotest:user_credentials";
pub const SETTINGS_ID: &str = "autotest:settings_id";
pub const SETTINGS: &str = "autotest:settings";
/// Unix time each settings id was last used by a test job
pub const SETTINGS_LAST_ACCESS: &str = "autotest:settings_last_access";
pub const TESTS_ID: &str = "autotest:tests_id";
pub const TESTS: &str = "autotest:tests";
pub const FEEDBACK_FILES_ID: &str = "autotest:feedback_files_id";
pub const SCHEMA: &str = "autotest:schema";
pub const POP_INTERVALS: &str = "autotest:pop_intervals";
pub const PORT_COUNTER: &str = "autotest:port_counter";

pub fn ratelimit(api_key: &str, minute: i64) -> String {
    format!("{}:ratelimit:{}:{}", PREFIX, api_key, minute)
}

pub fn ratelimit_override(api_key: &str) -> String {
    format!("{}:ratelimit:{}:limit", PREFIX, api_key)
}

pub fn test_result(test_id: i64) -> String {
    format!("{}:test_result:{}", PREFIX, test_id)
}

pub fn feedback_file(test_id: i64, feedback_id: i64) -> String {
    format!("{}:feedback_file:{}:{}", PREFIX, test_id, feedback_id)
}

pub fn queue(name: &str) -> String {
    format!("{}:queue:{}", PREFIX, name)
}

pub fn job(job_id: &str) -> String {
    format!("{}:job:{}", PREFIX, job_id)
}
