//! Deterministic cache keys.
//!
//! The key is the hex SHA-256 of a canonical JSON document
//! `{"model":..,"params":..,"prompt":..}` where object keys are sorted at
//! every depth and floats with no fractional part are written as integers.
//! Serialization is done by hand so the result does not depend on how
//! `serde_json` happens to order maps in a given build.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::GenerationParams;

/// Largest float that is still exactly representable as an integer.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Fingerprint a request for cache lookup.
pub fn fingerprint(model: &str, prompt: &str, params: &GenerationParams) -> String {
    let mut canonical = String::with_capacity(prompt.len() + 64);
    canonical.push_str("{\"model\":");
    write_string(&mut canonical, model.trim());
    canonical.push_str(",\"params\":");
    write_object(&mut canonical, params.iter());
    canonical.push_str(",\"prompt\":");
    write_string(&mut canonical, &normalize_prompt(prompt));
    canonical.push('}');

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// CRLF to LF, trailing whitespace stripped per line, outer whitespace trimmed.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT_INT => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map.iter()),
    }
}

fn write_object<'a>(out: &mut String, entries: impl Iterator<Item = (&'a String, &'a Value)>) {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_string(out: &mut String, s: &str) {
    // serde_json's string escaping is canonical for a given input
    out.push_str(&Value::String(s.to_string()).to_string());
}
