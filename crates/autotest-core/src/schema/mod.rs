//! Settings schema and form validation
//!
//! The schema is a skeleton whose `installed_testers` enum and
//! `tester_schemas` oneOf are filled at install time from the tester
//! registry. Uploaded settings are validated with default filling so that
//! instructors can submit sparse tester configurations.

pub mod defaults;


use crate::errors::AutotestError;
use crate::kv::{keys, KvStore};
use jsonschema::JSONSchema;
use serde_json::{json, Value};

pub use defaults::fill_defaults;

/// Empty schema skeleton, before any tester is installed.
pub fn skeleton() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "definitions": {
            "files_list": {
                "type": "string",
                "enum": []
            },
            "test_data_categories": {
                "type": "string",
                "enum": ["instructor", "student"],
                "enumNames": ["Instructor", "Student"]
            },
            "installed_testers": {
                "type": "string",
                "enum": []
            },
            "tester_schemas": {
                "type": "object",
                "oneOf": []
            },
            "extra_group_data": {
                "type": "object",
                "title": "Extra group data",
                "default": {}
            }
        },
        "properties": {
            "testers": {
                "type": "array",
                "title": "Testers",
                "minItems": 1,
                "items": { "$ref": "#/definitions/tester_schemas" }
            }
        },
        "required": ["testers"]
    })
}

/// Fill the skeleton with one `(name, settings schema)` pair per tester.
pub fn build_schema(testers: &[(String, Value)]) -> Value {
    let mut schema = skeleton();
    let names: Vec<Value> = testers.iter().map(|(name, _)| json!(name)).collect();
    let schemas: Vec<Value> = testers.iter().map(|(_, schema)| schema.clone()).collect();
    schema["definitions"]["installed_testers"]["enum"] = Value::Array(names);
    schema["definitions"]["tester_schemas"]["oneOf"] = Value::Array(schemas);
    schema
}

/// Names listed in the schema's `installed_testers` enum.
pub fn installed_testers(schema: &Value) -> Vec<String> {
    schema
        .pointer("/definitions/installed_testers/enum")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub async fn load(kv: &dyn KvStore) -> Result<Option<Value>, AutotestError> {
    match kv.get(keys::SCHEMA).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn store(kv: &dyn KvStore, schema: &Value) -> Result<(), AutotestError> {
    kv.set(keys::SCHEMA, &serde_json::to_vec(schema)?, None).await
}

/// Validate `settings` in place against `schema`, filling defaults first.
///
/// `files_list` is narrowed to the uploaded file names and categories are not
/// enforced. On success `settings` holds the default-filled instance.
pub fn validate_against_schema(
    settings: &mut Value,
    schema: &Value,
    filenames: &[String],
) -> Result<(), AutotestError> {
    let mut schema = schema.clone();
    if let Some(files) = schema.pointer_mut("/definitions/files_list") {
        files["enum"] = json!(filenames);
    }
    if let Some(Value::Object(categories)) = schema.pointer_mut("/definitions/test_data_categories")
    {
        categories.remove("enum");
        categories.remove("enumNames");
    }

    let mut errors = fill_defaults(settings, &schema);
    if errors.is_empty() {
        errors = strict_errors(settings, &schema)?;
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AutotestError::ValidationError(errors.join("\n")))
    }
}

fn strict_errors(instance: &Value, schema: &Value) -> Result<Vec<String>, AutotestError> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| AutotestError::ConfigError(format!("Invalid settings schema: {}", e)))?;
    let errors = match compiled.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect(),
    };
    Ok(errors)
}
