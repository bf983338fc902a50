//! Lenient decoding of tester stdout.
//!
//! Testers print a stream of JSON objects, possibly interleaved with stray
//! output from the code under test. Every complete value of the expected
//! type is kept; anything else marks the output as malformed.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

impl JsonKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonKind::Object => value.is_object(),
            JsonKind::Array => value.is_array(),
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Bool => value.is_boolean(),
            JsonKind::Null => value.is_null(),
        }
    }
}

/// Decode every JSON value found in `input`.
///
/// Decoding is retried one character further on whenever the text at the
/// current position is not valid JSON. Skipped non-whitespace, and decoded
/// values not matching `expected`, set the malformed flag.
pub fn loads_partial_json(input: &str, expected: Option<JsonKind>) -> (Vec<Value>, bool) {
    let text = input.trim();
    let mut results = Vec::new();
    let mut malformed = false;
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = pos + stream.byte_offset();
                if expected.map_or(true, |kind| kind.matches(&value)) {
                    results.push(value);
                } else if !text[pos..end].trim().is_empty() {
                    malformed = true;
                }
                pos = end;
            }
            _ => {
                let Some(ch) = rest.chars().next() else {
                    break;
                };
                if !ch.is_whitespace() {
                    malformed = true;
                }
                pos += ch.len_utf8();
            }
        }
    }

    (results, malformed)
}
