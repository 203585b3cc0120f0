//! # Reference Resolution
//!
//! Step inputs may refer to values produced earlier in the run with the
//! `${{ path.to.value[idx] }}` syntax. This module resolves those references
//! against the run context, a plain [`serde_json::Value`] tree.
//!
//! ## Rules
//!
//! - A string that is *exactly* one reference (surrounding whitespace
//!   ignored) resolves to the referenced value with its native type, so
//!   `"${{ login.outputs.retries }}"` can yield a number or a map. Failing to
//!   resolve such a value is a hard error.
//! - References embedded in a larger string are interpolated. An embedded
//!   reference that cannot be resolved is replaced by the marker
//!   `<unresolved: PATH: REASON>` instead of failing the whole value.
//! - A path is a list of dot-separated keys, each optionally followed by one
//!   or more `[n]` index suffixes: `user.addresses[0].city`.
//!
//! The context only ever grows forward in step order, so a reference can
//! never point at a value that is still being resolved. There is no cycle
//! detection because none is possible.
//!
//! ```rust
//! use runlane_engine::resolve::resolve_string;
//! use serde_json::json;
//!
//! let context = json!({"user": {"name": "Alice", "emails": ["a@x.com", "b@x.com"]}});
//! let greeting = resolve_string("Hello ${{ user.name }}, first email ${{ user.emails[0] }}", &context).unwrap();
//! assert_eq!(greeting, json!("Hello Alice, first email a@x.com"));
//!
//! let emails = resolve_string("${{ user.emails }}", &context).unwrap();
//! assert!(emails.is_array());
//! ```

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;

static REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").expect("reference pattern"));

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("invalid reference '{reference}': {reason}")]
    Syntax { reference: String, reason: String },
    #[error("'{path}' not found")]
    MissingKey { path: String },
    #[error("'{path}' is not a map")]
    NotAMap { path: String },
    #[error("'{path}' is not a list")]
    NotAList { path: String },
    #[error("index {index} is out of bounds for '{path}' (length {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
}

impl ExpressionError {
    fn syntax(reference: &str, reason: impl Into<String>) -> Self {
        Self::Syntax {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Short cause used inside interpolation markers.
    pub fn reason(&self) -> String {
        match self {
            ExpressionError::Syntax { reason, .. } => reason.clone(),
            ExpressionError::MissingKey { .. } => "not found".into(),
            ExpressionError::NotAMap { path } => format!("'{path}' is not a map"),
            ExpressionError::NotAList { path } => format!("'{path}' is not a list"),
            ExpressionError::IndexOutOfBounds { index, len, .. } => format!("index {index} out of bounds (length {len})"),
        }
    }
}

/// Parse a bare reference path such as `user.emails[0]`.
pub fn parse_reference(reference: &str) -> Result<Vec<PathSegment>, ExpressionError> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::syntax(reference, "empty reference"));
    }

    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(bracket) => part.split_at(bracket),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(ExpressionError::syntax(reference, "empty path segment"));
        }
        if name.chars().any(|character| character.is_whitespace() || character == ']') {
            return Err(ExpressionError::syntax(reference, format!("invalid key '{name}'")));
        }
        segments.push(PathSegment::Key(name.to_string()));

        while !rest.is_empty() {
            let Some(inner) = rest.strip_prefix('[') else {
                return Err(ExpressionError::syntax(reference, format!("unexpected '{rest}' after index")));
            };
            let Some(close) = inner.find(']') else {
                return Err(ExpressionError::syntax(reference, "unclosed '['"));
            };
            let index = inner[..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| ExpressionError::syntax(reference, format!("index '{}' is not a non-negative integer", &inner[..close])))?;
            segments.push(PathSegment::Index(index));
            rest = &inner[close + 1..];
        }
    }
    Ok(segments)
}

/// Walk `segments` from `root`.
pub fn lookup<'a>(root: &'a Value, segments: &[PathSegment]) -> Result<&'a Value, ExpressionError> {
    let mut current = root;
    let mut path = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                let Value::Object(map) = current else {
                    return Err(ExpressionError::NotAMap { path: display_path(&path) });
                };
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
                current = map.get(key).ok_or_else(|| ExpressionError::MissingKey { path: path.clone() })?;
            }
            PathSegment::Index(index) => {
                let Value::Array(items) = current else {
                    return Err(ExpressionError::NotAList { path: display_path(&path) });
                };
                current = items.get(*index).ok_or_else(|| ExpressionError::IndexOutOfBounds {
                    path: display_path(&path),
                    index: *index,
                    len: items.len(),
                })?;
                path.push_str(&format!("[{index}]"));
            }
        }
    }
    Ok(current)
}

fn display_path(path: &str) -> String {
    if path.is_empty() { "<root>".into() } else { path.to_string() }
}

/// Parse and look up a bare reference, cloning the result.
pub fn resolve_reference(reference: &str, context: &Value) -> Result<Value, ExpressionError> {
    let segments = parse_reference(reference)?;
    lookup(context, &segments).cloned()
}

/// The reference path when `input` is exactly one `${{ }}` reference.
pub fn exact_reference(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let captures = REFERENCE.captures(trimmed)?;
    let whole = captures.get(0)?;
    (whole.start() == 0 && whole.end() == trimmed.len()).then(|| captures.get(1).map_or("", |path| path.as_str()))
}

/// Resolve every reference in `input`.
///
/// Returns the native value for an exact reference and a string otherwise.
pub fn resolve_string(input: &str, context: &Value) -> Result<Value, ExpressionError> {
    if let Some(reference) = exact_reference(input) {
        return resolve_reference(reference, context);
    }
    if !REFERENCE.is_match(input) {
        return Ok(Value::String(input.to_string()));
    }
    let interpolated = REFERENCE.replace_all(input, |captures: &Captures| {
        let reference = captures.get(1).map_or("", |path| path.as_str());
        match resolve_reference(reference, context) {
            Ok(value) => stringify(&value),
            Err(error) => format!("<unresolved: {reference}: {}>", error.reason()),
        }
    });
    Ok(Value::String(interpolated.into_owned()))
}

/// Resolve references in every string inside `value`.
pub fn resolve_value(value: &Value, context: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) => resolve_string(text, context),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, context)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// References appearing in `input`, in order of appearance.
pub fn find_references(input: &str) -> Vec<String> {
    REFERENCE
        .captures_iter(input)
        .filter_map(|captures| captures.get(1).map(|path| path.as_str().to_string()))
        .collect()
}

/// Render a value for string interpolation.
///
/// Strings are inserted as-is, scalars through `Display`, and maps or lists
/// as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".into(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "user": {"name": "Alice", "emails": ["a@x.com", "b@x.com"], "age": 41},
            "grid": [[1, 2], [3, 4]],
            "login": {"outputs": {"token": "t-1", "ok": true}}
        })
    }

    #[test]
    fn parses_keys_and_indexes() {
        assert_eq!(
            parse_reference("grid[1][0]").unwrap(),
            vec![PathSegment::Key("grid".into()), PathSegment::Index(1), PathSegment::Index(0)]
        );
        assert_eq!(
            parse_reference(" user.emails[0] ").unwrap(),
            vec![
                PathSegment::Key("user".into()),
                PathSegment::Key("emails".into()),
                PathSegment::Index(0)
            ]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", "user..name", "user.emails[x]", "user.emails[0", "user.emails[0]x", "[0]"] {
            assert!(
                matches!(parse_reference(bad), Err(ExpressionError::Syntax { .. })),
                "accepted '{bad}'"
            );
        }
    }

    #[test]
    fn interpolates_embedded_references() {
        let resolved = resolve_string("Hello ${{ user.name }}, first email ${{ user.emails[0] }}", &context()).unwrap();
        assert_eq!(resolved, json!("Hello Alice, first email a@x.com"));
    }

    #[test]
    fn exact_reference_keeps_native_type() {
        assert_eq!(resolve_string("  ${{ user.age }} ", &context()).unwrap(), json!(41));
        assert_eq!(resolve_string("${{ grid[1] }}", &context()).unwrap(), json!([3, 4]));
        assert_eq!(resolve_string("${{login.outputs}}", &context()).unwrap(), json!({"token": "t-1", "ok": true}));
    }

    #[test]
    fn exact_reference_out_of_bounds_is_an_error() {
        let error = resolve_string("${{ user.emails[5] }}", &context()).unwrap_err();
        assert_eq!(
            error,
            ExpressionError::IndexOutOfBounds {
                path: "user.emails".into(),
                index: 5,
                len: 2
            }
        );
    }

    #[test]
    fn embedded_failure_becomes_marker() {
        let resolved = resolve_string("token=${{ login.outputs.secret }}!", &context()).unwrap();
        assert_eq!(resolved, json!("token=<unresolved: login.outputs.secret: not found>!"));
    }

    #[test]
    fn lookup_reports_wrong_container() {
        assert_eq!(
            resolve_reference("user.name.first", &context()).unwrap_err(),
            ExpressionError::NotAMap { path: "user.name".into() }
        );
        assert_eq!(
            resolve_reference("user[0]", &context()).unwrap_err(),
            ExpressionError::NotAList { path: "user".into() }
        );
    }

    #[test]
    fn stringifies_scalars_and_containers() {
        let resolved = resolve_string("${{ login.outputs.ok }}/${{ grid[0] }}/${{ user.age }}", &context()).unwrap();
        assert_eq!(resolved, json!("true/[1,2]/41"));
        assert_eq!(stringify(&Value::Null), "null");
    }

    #[test]
    fn resolves_nested_values() {
        let template = json!({"to": ["${{ user.emails[1] }}"], "meta": {"n": "${{ user.age }}"}, "flag": false});
        let resolved = resolve_value(&template, &context()).unwrap();
        assert_eq!(resolved, json!({"to": ["b@x.com"], "meta": {"n": 41}, "flag": false}));
    }

    #[test]
    fn finds_references_in_order() {
        assert_eq!(
            find_references("${{ a.b }} and ${{c[0]}}"),
            vec!["a.b".to_string(), "c[0]".to_string()]
        );
        assert!(exact_reference("x ${{ a }}").is_none());
        assert_eq!(exact_reference("${{ a }}"), Some("a"));
    }
}
