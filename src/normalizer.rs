//! Response normalization for model output
//!
//! Turns free-form model text into a [`ScoreRecord`]:
//! - Cuts the outermost `{ ... }` span out of surrounding prose or fencing
//! - Repairs punctuation that breaks JSON (full-width and curly variants)
//! - Parses leniently (raw control characters, trailing garbage)
//! - Maps vendor field names onto the Score Schema, coerces and clamps values
//!
//! Normalization never panics and never returns a partial record: the result
//! is either a record covering the full schema or `CollabError::ParseFailure`.

use crate::error::{CollabError, Result};
use crate::types::{Criterion, ScoreRecord, Scores};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Length of the raw-text excerpt carried by a parse failure
pub const EXCERPT_CHARS: usize = 500;

/// Character repairs applied to the extracted span
const SUBSTITUTIONS: &[(char, char)] = &[
    ('：', ':'),
    ('，', ','),
    ('\'', '"'),
    ('‘', '"'),
    ('’', '"'),
    ('“', '"'),
    ('”', '"'),
];

/// Keys the scores container may appear under, in priority order
const SCORE_CONTAINERS: &[&str] = &["scores", "score", "ratings", "evaluation"];

/// Keys the feedback text may appear under, in priority order
const FEEDBACK_KEYS: &[&str] = &["feedback", "comments", "comment"];

/// Normalizes raw model responses against one schema version
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    expected_version: String,
    feedback_placeholder: String,
}

impl ResponseNormalizer {
    pub fn new(expected_version: impl Into<String>, feedback_placeholder: impl Into<String>) -> Self {
        Self {
            expected_version: expected_version.into(),
            feedback_placeholder: feedback_placeholder.into(),
        }
    }

    /// Normalize one raw response
    pub fn normalize(&self, raw_text: &str) -> Result<ScoreRecord> {
        let payload = parse_payload(raw_text).ok_or_else(|| CollabError::ParseFailure {
            excerpt: excerpt(raw_text),
        })?;

        let container = scores_container(&payload);
        let scores = merge_scores(container);

        // Root-level feedback first, then feedback nested in the scores container
        let feedback = FEEDBACK_KEYS
            .iter()
            .find_map(|key| payload.get(*key))
            .or_else(|| container.and_then(|c| FEEDBACK_KEYS.iter().find_map(|key| c.get(*key))))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => {
                    warn!("Non-string feedback of type {}, using placeholder", json_type(other));
                    None
                }
            })
            .unwrap_or_else(|| self.feedback_placeholder.clone());

        let mentions = match payload.get("mentions") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        let version = match payload.get("version") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => self.expected_version.clone(),
        };

        Ok(ScoreRecord {
            scores,
            feedback,
            mentions,
            version,
        })
    }
}

/// Coerce a loosely typed score to a float
///
/// Numbers pass through, numeric strings are parsed; anything else yields
/// `None` so the caller can log it and fall back to zero.
pub fn coerce_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Zero-filled schema scores overlaid with whatever the container carries
///
/// Shared with the historical reconciler so both paths apply the same
/// coercion policy. Vendor aliases are applied before canonical keys, so a
/// canonical key always wins when both name the same criterion.
pub fn merge_scores(container: Option<&Map<String, Value>>) -> Scores {
    let mut scores = Scores::zeroed();

    let Some(container) = container else {
        return scores;
    };

    let mut resolved: Vec<(Criterion, bool, &String, &Value)> = Vec::with_capacity(container.len());
    for (key, value) in container {
        match Criterion::from_field(key) {
            Some(criterion) => {
                let canonical = Criterion::from_canonical(key) == Some(criterion);
                resolved.push((criterion, canonical, key, value));
            }
            None => debug!("Ignoring non-criterion field '{}'", key),
        }
    }
    // Stable sort keeps container order within each group
    resolved.sort_by_key(|(_, canonical, _, _)| *canonical);

    for (criterion, canonical, key, value) in resolved {
        if !canonical {
            debug!("Alias '{}' read as {}", key, criterion.as_str());
        }

        match coerce_score(value) {
            Some(v) => scores.set(criterion, v),
            None => {
                warn!(
                    criterion = criterion.as_str(),
                    value = %value,
                    "Non-numeric score coerced to 0.0"
                );
                scores.set(criterion, 0.0);
            }
        }
    }

    scores
}

fn scores_container(payload: &Map<String, Value>) -> Option<&Map<String, Value>> {
    SCORE_CONTAINERS
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(Value::as_object)
}

/// Locate, repair and parse the JSON object inside raw text
fn parse_payload(raw_text: &str) -> Option<Map<String, Value>> {
    let start = raw_text.find('{')?;
    let end = raw_text.rfind('}')?;
    if end < start {
        return None;
    }

    let span = &raw_text[start..=end];
    let repaired: String = span
        .chars()
        .map(|c| {
            SUBSTITUTIONS
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect();
    let repaired = escape_control_chars(&repaired);

    // First complete value wins; anything after it is ignored
    let mut stream = serde_json::Deserializer::from_str(&repaired).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(map))) => Some(map),
        Some(Ok(_)) => None,
        Some(Err(e)) => {
            debug!("Structural parse failed: {}", e);
            None
        }
        None => None,
    }
}

/// Escape raw control characters that appear inside string literals
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }

    out
}

/// First `EXCERPT_CHARS` characters of the raw text
pub fn excerpt(raw_text: &str) -> String {
    raw_text.chars().take(EXCERPT_CHARS).collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
