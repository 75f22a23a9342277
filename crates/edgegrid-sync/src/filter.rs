//! Partial-object filters for `show`.
//!
//! A filter is an object of the cached type. Fields left at their default
//! value are wildcards; every other field must equal the candidate's.
//! Comparison happens on the JSON form so nested keys filter field by field.

use serde_json::Value;

/// Whether `obj` matches `filter`, where `default` is the JSON form of the
/// type's default value.
pub fn matches(filter: &Value, default: &Value, obj: &Value) -> bool {
    if filter == default || is_zero(filter) {
        return true;
    }
    match (filter, obj) {
        (Value::Object(fields), Value::Object(candidate)) => fields.iter().all(|(name, want)| {
            let default = default.get(name).unwrap_or(&Value::Null);
            match candidate.get(name) {
                Some(have) => matches(want, default, have),
                None => want == default || is_zero(want),
            }
        }),
        _ => filter == obj,
    }
}

fn is_zero(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_wildcards() {
        let default = json!({"key": {"name": ""}, "state": "unknown", "count": 0});
        let filter = json!({"key": {"name": ""}, "state": "unknown", "count": 0});
        let obj = json!({"key": {"name": "a"}, "state": "ready", "count": 3});
        assert!(matches(&filter, &default, &obj));
    }

    #[test]
    fn set_fields_must_match() {
        let default = json!({"key": {"org": "", "name": ""}, "state": "unknown"});
        let filter = json!({"key": {"org": "dev", "name": ""}, "state": "ready"});
        assert!(matches(
            &filter,
            &default,
            &json!({"key": {"org": "dev", "name": "x"}, "state": "ready"})
        ));
        assert!(!matches(
            &filter,
            &default,
            &json!({"key": {"org": "ops", "name": "x"}, "state": "ready"})
        ));
        assert!(!matches(
            &filter,
            &default,
            &json!({"key": {"org": "dev", "name": "x"}, "state": "creating"})
        ));
    }
}
