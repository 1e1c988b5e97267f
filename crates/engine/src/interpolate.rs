//! Interpolation — substitute `${step.path}` references with step outputs.
//!
//! A path is a chain of `.field` and `[index]` segments; the common
//! malformed `x.[0]` is read as `x[0]`.  A string that consists of exactly
//! one reference is replaced by the referenced value itself (so
//! `"${a.numbers[0]}"` becomes the number `7`); references embedded in a
//! longer string are rendered as text.  Anything that cannot be resolved
//! is left verbatim and reported in [`Interpolated::unresolved`].
//!
//! Pure data transformation over the in-memory result map: no I/O.

use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ResultMap, StepResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One segment of a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, ".{key}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed `step.path[index]` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step_id: String,
    pub path: Vec<PathSegment>,
}

impl Reference {
    /// Parse the text between the delimiters.  Returns `None` for an empty head
    /// or an unterminated bracket.
    pub fn parse(expression: &str) -> Option<Self> {
        let normalized = expression.trim().replace(".[", "[");
        let head_end = normalized
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(normalized.len());
        let step_id = normalized[..head_end].trim();
        if step_id.is_empty() {
            return None;
        }

        let mut path = Vec::new();
        let mut rest = &normalized[head_end..];
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']')?;
                let inner = after[..close].trim();
                let segment = match inner.parse::<usize>() {
                    Ok(i) => PathSegment::Index(i),
                    Err(_) => {
                        let key = inner.trim_matches(|c: char| c == '"' || c == '\'');
                        PathSegment::Key(key.to_owned())
                    }
                };
                path.push(segment);
                rest = &after[close + 1..];
            } else if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| c == '.' || c == '[').unwrap_or(after.len());
                let key = after[..end].trim();
                if !key.is_empty() {
                    path.push(PathSegment::Key(key.to_owned()));
                }
                rest = &after[end..];
            } else {
                return None;
            }
        }

        Some(Self {
            step_id: step_id.to_owned(),
            path,
        })
    }

    /// Walk the path through `output`.  On failure returns the first segment
    /// that doesn't exist.
    pub fn extract<'a>(&self, output: &'a Value) -> Result<&'a Value, PathSegment> {
        let mut current = output;
        for segment in &self.path {
            let next = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key),
                (PathSegment::Key(key), Value::Array(items)) => {
                    key.parse::<usize>().ok().and_then(|i| items.get(i))
                }
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
                _ => None,
            };
            current = next.ok_or_else(|| segment.clone())?;
        }
        Ok(current)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.step_id)?;
        for segment in &self.path {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Why a reference was left in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// The step has no successful result (absent, failed or timed out).
    StepUnavailable,
    /// The step's output has no such path; `segment` is the first missing one.
    MissingPath { segment: String },
    /// The expression could not be parsed.
    Malformed,
}

/// A reference the engine could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRef {
    /// The reference exactly as written, delimiters included.
    pub expression: String,
    /// Referenced step id (empty when malformed).
    pub step_id: String,
    /// JSON pointer of the input field holding the reference.
    pub field: String,
    #[serde(flatten)]
    pub reason: UnresolvedReason,
}

impl UnresolvedRef {
    /// Top-level input key holding the reference, if any.
    pub fn top_level_field(&self) -> Option<&str> {
        self.field.split('/').nth(1).filter(|key| !key.is_empty())
    }
}

/// Result of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolated {
    pub value: Value,
    pub unresolved: Vec<UnresolvedRef>,
}

impl Interpolated {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn reference_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([^}]*)\}|\{\{([^}]*)\}\}").expect("reference pattern is valid")
    })
}

/// Resolve every reference in `payload` against `results`.
pub fn resolve(payload: &Value, results: &ResultMap) -> Interpolated {
    let mut unresolved = Vec::new();
    let mut pointer = String::new();
    let value = resolve_value(payload, results, &mut pointer, &mut unresolved);
    Interpolated { value, unresolved }
}

fn resolve_value(
    value: &Value,
    results: &ResultMap,
    pointer: &mut String,
    unresolved: &mut Vec<UnresolvedRef>,
) -> Value {
    match value {
        Value::String(text) => resolve_string(text, results, pointer, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    with_segment(pointer, &i.to_string(), |p| {
                        resolve_value(item, results, p, unresolved)
                    })
                })
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let resolved = with_segment(pointer, &escape_pointer(key), |p| {
                        resolve_value(item, results, p, unresolved)
                    });
                    (key.clone(), resolved)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(
    text: &str,
    results: &ResultMap,
    pointer: &str,
    unresolved: &mut Vec<UnresolvedRef>,
) -> Value {
    let pattern = reference_pattern();

    // Whole-string reference: substitute the value itself, keeping its type.
    if let Some(caps) = pattern.captures(text.trim()) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.trim().len()) {
            return match lookup(&caps, results, pointer) {
                Ok(found) => found.clone(),
                Err(missing) => {
                    unresolved.push(missing);
                    Value::String(text.to_owned())
                }
            };
        }
    }

    let rendered = pattern.replace_all(text, |caps: &Captures<'_>| {
        match lookup(caps, results, pointer) {
            Ok(found) => render(found),
            Err(missing) => {
                unresolved.push(missing);
                caps[0].to_owned()
            }
        }
    });
    Value::String(rendered.into_owned())
}

fn lookup<'a>(
    caps: &Captures<'_>,
    results: &'a ResultMap,
    pointer: &str,
) -> Result<&'a Value, UnresolvedRef> {
    let expression = caps[0].to_owned();
    let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());

    let Some(reference) = Reference::parse(inner) else {
        return Err(UnresolvedRef {
            expression,
            step_id: String::new(),
            field: pointer.to_owned(),
            reason: UnresolvedReason::Malformed,
        });
    };

    let unresolved = |reason| UnresolvedRef {
        expression: expression.clone(),
        step_id: reference.step_id.clone(),
        field: pointer.to_owned(),
        reason,
    };

    let output = match results.get(&reference.step_id) {
        Some(StepResult::Success { output }) => output,
        _ => return Err(unresolved(UnresolvedReason::StepUnavailable)),
    };

    reference.extract(output).map_err(|segment| {
        unresolved(UnresolvedReason::MissingPath {
            segment: segment.to_string(),
        })
    })
}

/// Text rendering of a value embedded in a larger string.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn with_segment<T>(pointer: &mut String, segment: &str, f: impl FnOnce(&mut String) -> T) -> T {
    let len = pointer.len();
    pointer.push('/');
    pointer.push_str(segment);
    let out = f(pointer);
    pointer.truncate(len);
    out
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results(entries: &[(&str, Value)]) -> ResultMap {
        entries
            .iter()
            .map(|(id, output)| {
                (id.to_string(), StepResult::Success { output: output.clone() })
            })
            .collect()
    }

    #[test]
    fn whole_string_reference_keeps_type() {
        let results = results(&[("a", json!({ "numbers": [7] }))]);
        let out = resolve(&json!("${a.numbers[0]}"), &results);
        assert!(out.is_complete());
        assert_eq!(out.value, json!(7));
    }

    #[test]
    fn dot_bracket_is_normalized() {
        let results = results(&[("a", json!({ "numbers": [7] }))]);
        assert_eq!(resolve(&json!("${a.numbers.[0]}"), &results).value, json!(7));
        assert_eq!(resolve(&json!("{{a.numbers.[0]}}"), &results).value, json!(7));
    }

    #[test]
    fn embedded_references_are_rendered_as_text() {
        let results = results(&[
            ("num1", json!({ "numbers": [7] })),
            ("num2", json!({ "numbers": [3] })),
        ]);
        let out = resolve(&json!("${num1.numbers[0]} + ${num2.numbers[0]}"), &results);
        assert_eq!(out.value, json!("7 + 3"));
    }

    #[test]
    fn nested_payloads_are_walked() {
        let results = results(&[("user", json!({ "name": "Ada", "tags": ["x", "y"] }))]);
        let out = resolve(
            &json!({ "greeting": "hi {{user.name}}", "list": ["${user.tags}", 1, null] }),
            &results,
        );
        assert_eq!(out.value, json!({ "greeting": "hi Ada", "list": [["x", "y"], 1, null] }));
    }

    #[test]
    fn whole_output_reference_without_path() {
        let results = results(&[("a", json!({ "k": true }))]);
        assert_eq!(resolve(&json!("${a}"), &results).value, json!({ "k": true }));
    }

    #[test]
    fn missing_path_is_reported_with_field_pointer() {
        let results = results(&[("a", json!({ "numbers": [7] }))]);
        let out = resolve(&json!({ "q": { "n": "${a.values[0]}" } }), &results);

        assert_eq!(out.value, json!({ "q": { "n": "${a.values[0]}" } }));
        assert_eq!(out.unresolved.len(), 1);
        let missing = &out.unresolved[0];
        assert_eq!(missing.step_id, "a");
        assert_eq!(missing.field, "/q/n");
        assert_eq!(missing.top_level_field(), Some("q"));
        assert_eq!(
            missing.reason,
            UnresolvedReason::MissingPath { segment: ".values".into() }
        );
    }

    #[test]
    fn failed_step_is_unavailable() {
        let mut results = ResultMap::new();
        results.insert("a".into(), StepResult::TimedOut);
        let out = resolve(&json!("value: ${a.x}"), &results);
        assert_eq!(out.value, json!("value: ${a.x}"));
        assert_eq!(out.unresolved[0].reason, UnresolvedReason::StepUnavailable);
    }

    #[test]
    fn out_of_range_index_is_missing() {
        let results = results(&[("a", json!({ "numbers": [7] }))]);
        let out = resolve(&json!("${a.numbers[3]}"), &results);
        assert_eq!(
            out.unresolved[0].reason,
            UnresolvedReason::MissingPath { segment: "[3]".into() }
        );
    }

    #[test]
    fn parse_handles_quoted_keys_and_numeric_dots() {
        let r = Reference::parse(r#"a["odd key"].items.0"#).unwrap();
        assert_eq!(
            r.path,
            vec![
                PathSegment::Key("odd key".into()),
                PathSegment::Key("items".into()),
                PathSegment::Key("0".into()),
            ]
        );
        let doc = json!({ "odd key": { "items": ["first"] } });
        let out = r.extract(&doc).unwrap();
        assert_eq!(out, &json!("first"));
        assert!(Reference::parse("a[0").is_none());
        assert!(Reference::parse(" ").is_none());
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let out = resolve(&json!({ "n": 1, "b": false }), &ResultMap::new());
        assert_eq!(out.value, json!({ "n": 1, "b": false }));
        assert!(out.is_complete());
    }
}
