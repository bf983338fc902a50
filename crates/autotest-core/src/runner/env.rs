use crate::errors::AutotestError;
use std::collections::BTreeMap;

pub type EnvMap = BTreeMap<String, String>;

/// Layer caller-supplied variables over `base`, refusing any key the
/// service already set.
pub fn overlay_env(mut base: EnvMap, caller: &EnvMap) -> Result<EnvMap, AutotestError> {
    let conflicts: Vec<&str> = caller
        .keys()
        .filter(|key| base.contains_key(*key))
        .map(String::as_str)
        .collect();
    if !conflicts.is_empty() {
        return Err(AutotestError::TestExecutionError(format!(
            "The following environment variables cannot be overwritten for this test: {}",
            conflicts.join(", ")
        )));
    }
    base.extend(caller.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(base)
}

/// Environment a tester starts from: the worker's own environment, then the
/// worker resources, then the tester environment's exports.
pub fn base_env<'a>(layers: impl IntoIterator<Item = &'a EnvMap>) -> EnvMap {
    let mut env: EnvMap = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    for layer in layers {
        env.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}
