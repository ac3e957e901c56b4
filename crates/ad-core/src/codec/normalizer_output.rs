//! Tolerant parser for the normalizer helper's JSON output.
//!
//! The helper writes one JSON object per line. Parsing never aborts a
//! batch because of one bad row: blank lines are skipped, malformed rows
//! are logged and skipped, and unknown fields are ignored. Blank decimal
//! strings are `0.0`; unparsable ones fall back to `0.0` with a warning.

use serde::Serialize;
use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// One normalized row returned by the helper.
///
/// Rows come back in the same order they were sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    /// `rawAnomalyScore`
    pub raw_anomaly_score: f64,
    /// `normalizedProbability`
    pub normalized_probability: f64,
    /// `anomalyScore`
    pub normalized_sys_change_score: f64,
    /// `normalizedScore`, produced when normalizing a result tree.
    pub normalized_score: f64,
    /// `id`
    pub id: String,
}

impl NormalizedResult {
    /// Build a result from an already-decoded JSON object.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let mut result = NormalizedResult::default();
        for (key, value) in object {
            match key.as_str() {
                "rawAnomalyScore" => result.raw_anomaly_score = parse_decimal(key, value),
                "normalizedProbability" => {
                    result.normalized_probability = parse_decimal(key, value)
                }
                "anomalyScore" => result.normalized_sys_change_score = parse_decimal(key, value),
                "normalizedScore" => result.normalized_score = parse_decimal(key, value),
                "id" => result.id = value_as_text(value),
                other => trace!(field = other, "ignoring unknown normalizer output field"),
            }
        }
        result
    }
}

/// Parse every row from a buffered stream of JSON lines.
///
/// Only I/O failures on the underlying stream are returned as errors.
pub fn parse_results<R: BufRead>(input: R) -> io::Result<Vec<NormalizedResult>> {
    let mut results = Vec::new();
    let mut skipped = 0usize;

    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Objects may be concatenated on one line; a malformed one drops the
        // rest of its line only.
        for value in serde_json::Deserializer::from_str(trimmed).into_iter::<Value>() {
            match value {
                Ok(Value::Object(object)) => results.push(NormalizedResult::from_object(&object)),
                Ok(other) => {
                    skipped += 1;
                    warn!(
                        line = line_no + 1,
                        kind = json_kind(&other),
                        "normalizer output row is not a JSON object; skipping"
                    );
                }
                Err(e) => {
                    skipped += 1;
                    warn!(line = line_no + 1, error = %e, "malformed normalizer output row; skipping");
                    break;
                }
            }
        }
    }

    debug!(rows = results.len(), skipped, "parsed normalizer output");
    Ok(results)
}

/// Drain `output` on a dedicated thread so the writer side cannot deadlock
/// against a full output pipe.
pub fn spawn_result_reader<R>(output: R) -> io::Result<JoinHandle<io::Result<Vec<NormalizedResult>>>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("normalizer-output".to_string())
        .spawn(move || parse_results(BufReader::new(output)))
}

fn parse_decimal(field: &str, value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => decode_decimal(s).unwrap_or_else(|| {
            warn!(field, value = %s, "cannot parse decimal; using 0.0");
            0.0
        }),
        Value::Null => 0.0,
        other => {
            warn!(field, kind = json_kind(other), "unexpected decimal type; using 0.0");
            0.0
        }
    }
}

/// Decimal text as sent by the helper; blank means zero.
fn decode_decimal(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0.0);
    }
    text.parse().ok()
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
