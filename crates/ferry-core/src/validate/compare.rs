//! Pluggable equality for copied (non-mapped) content fields.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::ContentEquivalenceMode;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub trait ContentEquivalence: Send + Sync {
    fn name(&self) -> &'static str;

    fn equivalent(&self, expected: &Value, observed: &Value) -> bool;
}

/// Byte-for-byte JSON equality.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactEquivalence;

impl ContentEquivalence for ExactEquivalence {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn equivalent(&self, expected: &Value, observed: &Value) -> bool {
        expected == observed
    }
}

/// Strings compare equal after collapsing whitespace runs and trimming;
/// arrays and objects are compared element-wise with the same rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizedWhitespace;

impl NormalizedWhitespace {
    pub fn normalize(text: &str) -> String {
        WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
    }

    fn normalize_value(value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(Self::normalize(s)),
            Value::Array(items) => Value::Array(items.iter().map(Self::normalize_value).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::normalize_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl ContentEquivalence for NormalizedWhitespace {
    fn name(&self) -> &'static str {
        "normalized_whitespace"
    }

    fn equivalent(&self, expected: &Value, observed: &Value) -> bool {
        expected == observed || Self::normalize_value(expected) == Self::normalize_value(observed)
    }
}

pub fn equivalence_for(mode: ContentEquivalenceMode) -> Box<dyn ContentEquivalence> {
    match mode {
        ContentEquivalenceMode::Exact => Box::new(ExactEquivalence),
        ContentEquivalenceMode::NormalizedWhitespace => Box::new(NormalizedWhitespace),
    }
}
