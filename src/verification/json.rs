//! Traversal helpers over JSON payloads and metadata.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

/// Matches `http`/`https` URLs up to the end of the host.
pub const URL_PATTERN: &str = r"https?://(?:[-\w.]|(?:%[\da-fA-F]{2}))+";

/// Compiles [`URL_PATTERN`].
pub fn url_regex() -> Result<Regex, regex::Error> {
    Regex::new(URL_PATTERN)
}

/// Returns the host part of a matched URL.
pub fn domain_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

/// Returns `true` if `domain` is one of `allowed` or a subdomain of one.
///
/// Matching ignores ASCII case and only crosses whole labels, so
/// `evilexample.com` does not match `example.com`.
pub fn domain_allowed(domain: &str, allowed: &[String]) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|candidate| {
        let candidate = candidate.trim_matches('.').to_ascii_lowercase();
        !candidate.is_empty()
            && (domain == candidate
                || domain
                    .strip_suffix(candidate.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

/// Resolves a dot path (`a.b.0.c`) inside a value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        })
}

/// Mutable counterpart of [`lookup`].
pub fn lookup_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get_mut(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index)),
            _ => None,
        })
}

/// Applies `rewrite` to every string inside `value`. Returns `true` if any
/// string changed.
pub fn rewrite_strings(value: &mut Value, rewrite: &impl Fn(&str) -> Option<String>) -> bool {
    match value {
        Value::String(text) => match rewrite(text) {
            Some(replacement) if replacement != *text => {
                *text = replacement;
                true
            }
            _ => false,
        },
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rewrite_strings(item, rewrite) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| rewrite_strings(item, rewrite) || changed),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Wraps a metadata map as a JSON object.
pub fn metadata_value(metadata: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Map<String, Value>>(),
    )
}

/// Unwraps a JSON object produced by [`metadata_value`].
pub fn metadata_map(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

/// Truncates `text` to `max` characters, appending `...`.
pub fn truncate_chars(text: &str, max: usize) -> Option<String> {
    if text.chars().count() <= max {
        return None;
    }
    let mut truncated: String = text.chars().take(max).collect();
    truncated.push_str("...");
    Some(truncated)
}
