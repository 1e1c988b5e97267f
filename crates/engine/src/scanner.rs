//! Reference scanning — which steps does a payload refer to?
//!
//! Two equivalent syntaxes are recognised anywhere in the serialized
//! payload: `${step.path}` and the legacy `{{step.path}}`.  The captured
//! token runs up to the first `.` or `[`.  Tokens that don't name a known
//! step are dropped: a literal `${...}` the author didn't mean as a
//! reference never creates a dependency, and a misspelled step id never
//! does either.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Outcome of a scan.  Finding nothing is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    Detected(BTreeSet<String>),
    None,
}

impl ScanResult {
    pub fn ids(&self) -> BTreeSet<String> {
        match self {
            Self::Detected(ids) => ids.clone(),
            Self::None => BTreeSet::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

fn reference_head() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{\s*([^.\[\}\s]+)|\{\{\s*([^.\[\}\s]+)")
            .expect("reference pattern is valid")
    })
}

/// Every reference head in `text`, known or not, in order of appearance.
pub fn reference_tokens(text: &str) -> Vec<String> {
    reference_head()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Distinct known step ids referenced by `payload`.
pub fn scan(payload: &Value, known_step_ids: &HashSet<&str>) -> ScanResult {
    let text = match payload {
        Value::Null => return ScanResult::None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let ids: BTreeSet<String> = reference_tokens(&text)
        .into_iter()
        .filter(|token| known_step_ids.contains(token.as_str()))
        .collect();

    if ids.is_empty() {
        ScanResult::None
    } else {
        ScanResult::Detected(ids)
    }
}
