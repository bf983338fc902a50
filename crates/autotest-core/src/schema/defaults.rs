//! Default-filling walk over a JSON schema.
//!
//! Missing or null properties take the declared `default`, or an empty
//! array/object for array/object types. An empty array whose `items` schema
//! yields a default gets that default as its single element. For `oneOf`,
//! each alternative is filled on a copy of the instance and the instance is
//! replaced by the one copy that validates; zero or several matches are
//! reported as errors.

use jsonschema::JSONSchema;
use serde_json::{Map, Value};

const MAX_REF_DEPTH: usize = 32;

/// Fill defaults into `instance` according to `root`, returning the `oneOf`
/// selection errors encountered.
pub fn fill_defaults(instance: &mut Value, root: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    fill(instance, root, root, &mut errors);
    errors
}

fn fill(instance: &mut Value, schema: &Value, root: &Value, errors: &mut Vec<String>) {
    let schema = resolve(schema, root);

    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        instance.as_object_mut(),
    ) {
        for (name, subschema) in properties {
            if object.get(name).map_or(true, Value::is_null) {
                if let Some(default) = default_for(subschema, root) {
                    object.insert(name.clone(), default);
                }
            }
            if let Some(child) = object.get_mut(name) {
                fill(child, subschema, root, errors);
            }
        }
    }

    if let (Some(items), Some(array)) = (
        schema.get("items").filter(|items| items.is_object()),
        instance.as_array_mut(),
    ) {
        if array.is_empty() {
            if let Some(default) = default_for(items, root) {
                array.push(default);
            }
        }
        for child in array.iter_mut() {
            fill(child, items, root, errors);
        }
    }

    if let Some(alternatives) = schema.get("oneOf").and_then(Value::as_array) {
        select_one_of(instance, alternatives, root, errors);
    }
}

fn select_one_of(instance: &mut Value, alternatives: &[Value], root: &Value, errors: &mut Vec<String>) {
    let mut matches: Vec<(&Value, Value)> = Vec::new();
    for alternative in alternatives {
        let mut candidate = instance.clone();
        let mut candidate_errors = Vec::new();
        fill(&mut candidate, alternative, root, &mut candidate_errors);
        if candidate_errors.is_empty() && is_valid(&candidate, alternative, root) {
            matches.push((alternative, candidate));
        }
    }

    match matches.len() {
        0 => errors.push(format!(
            "{} is not valid under any of the given schemas",
            instance
        )),
        1 => {
            if let Some((_, candidate)) = matches.pop() {
                *instance = candidate;
            }
        }
        _ => {
            let schemas: Vec<String> = matches.iter().map(|(s, _)| s.to_string()).collect();
            errors.push(format!(
                "{} is valid under each of {}",
                instance,
                schemas.join(", ")
            ));
        }
    }
}

/// Validate against a sub-schema, carrying the root definitions along so
/// local `$ref`s still resolve.
fn is_valid(instance: &Value, schema: &Value, root: &Value) -> bool {
    let mut standalone = match resolve(schema, root) {
        Value::Object(map) => map.clone(),
        Value::Bool(accept) => return *accept,
        _ => Map::new(),
    };
    if let Some(definitions) = root.get("definitions") {
        standalone
            .entry("definitions".to_string())
            .or_insert_with(|| definitions.clone());
    }
    match JSONSchema::compile(&Value::Object(standalone)) {
        Ok(compiled) => compiled.is_valid(instance),
        Err(e) => {
            log::warn!("Skipping uncompilable oneOf alternative: {}", e);
            false
        }
    }
}

fn default_for(schema: &Value, root: &Value) -> Option<Value> {
    let schema = resolve(schema, root);
    if let Some(default) = schema.get("default") {
        return Some(default.clone());
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("array") => Some(Value::Array(Vec::new())),
        Some("object") => Some(Value::Object(Map::new())),
        _ => None,
    }
}

/// Follow local `#/...` references until a concrete schema is reached.
fn resolve<'a>(mut schema: &'a Value, root: &'a Value) -> &'a Value {
    for _ in 0..MAX_REF_DEPTH {
        let Some(reference) = schema.get("$ref").and_then(Value::as_str) else {
            return schema;
        };
        let Some(pointer) = reference.strip_prefix('#') else {
            return schema;
        };
        match root.pointer(pointer) {
            Some(target) => schema = target,
            None => return schema,
        }
    }
    schema
}
