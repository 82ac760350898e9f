//! Environment-variable substitution for auth configuration.
//!
//! Supported forms: `${VAR}`, `${VAR:-default}` and `$VAR`. A missing
//! variable becomes the empty string unless a default is given; the
//! default also applies when the variable is set but empty.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("env substitution pattern is valid")
    })
}

/// Substitute variables in a string using `lookup` to read the environment.
pub fn substitute_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            if let Some(name) = caps.get(1) {
                let value = lookup(name.as_str()).filter(|v| !v.is_empty());
                match (value, caps.get(2)) {
                    (Some(v), _) => v,
                    (None, Some(default)) => default.as_str().to_string(),
                    (None, None) => String::new(),
                }
            } else if let Some(name) = caps.get(3) {
                lookup(name.as_str()).unwrap_or_default()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Substitute variables from the process environment.
pub fn substitute(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Substitute every string inside a JSON value, recursively.
pub fn substitute_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(substitute_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_braced_and_bare_forms() {
        let lookup = lookup_from(&[("TOKEN", "abc"), ("HOST", "example.com")]);
        assert_eq!(substitute_with("Bearer ${TOKEN}", &lookup), "Bearer abc");
        assert_eq!(substitute_with("https://$HOST/api", &lookup), "https://example.com/api");
    }

    #[test]
    fn test_missing_variable_becomes_empty() {
        let lookup = lookup_from(&[]);
        assert_eq!(substitute_with("key=${MISSING}", &lookup), "key=");
        assert_eq!(substitute_with("key=$MISSING", &lookup), "key=");
    }

    #[test]
    fn test_default_used_when_missing_or_empty() {
        let lookup = lookup_from(&[("EMPTY", "")]);
        assert_eq!(substitute_with("${REGION:-us-east-1}", &lookup), "us-east-1");
        assert_eq!(substitute_with("${EMPTY:-fallback}", &lookup), "fallback");
        let lookup = lookup_from(&[("REGION", "eu-west-2")]);
        assert_eq!(substitute_with("${REGION:-us-east-1}", &lookup), "eu-west-2");
    }

    #[test]
    fn test_plain_text_untouched() {
        let lookup = lookup_from(&[]);
        assert_eq!(substitute_with("no variables here", &lookup), "no variables here");
        assert_eq!(substitute_with("price: 5$", &lookup), "price: 5$");
    }

    #[test]
    fn test_substitute_value_recurses() {
        std::env::set_var("TOOLBRIDGE_TEST_SECRET", "s3cret");
        let value = serde_json::json!({
            "type": "bearer",
            "token": "${TOOLBRIDGE_TEST_SECRET}",
            "nested": ["$TOOLBRIDGE_TEST_SECRET", 5]
        });
        let out = substitute_value(value);
        assert_eq!(out["token"], "s3cret");
        assert_eq!(out["nested"][0], "s3cret");
        assert_eq!(out["nested"][1], 5);
    }
}
