//! Dotted-path lookup into JSON payloads.

use serde_json::{Map, Value};

/// Resolves a dotted path such as `args.from` against an object.
///
/// Array elements can be addressed with numeric segments (`topics.0`).
/// Returns `None` when any segment is missing or the value is `null`.
#[must_use]
pub fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = step(current, segment)?;
    }
    (!current.is_null()).then_some(current)
}

/// Same as [`lookup_path`] for an arbitrary JSON value.
#[must_use]
pub fn lookup_path_in<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    match root {
        Value::Object(map) => lookup_path(map, path),
        _ => None,
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        json!({
            "event_name": "Transfer",
            "args": { "from": "0xA", "nested": { "deep": 1 } },
            "topics": ["0x01", "0x02"],
            "empty": null
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_lookup_top_level_and_nested() {
        let p = payload();
        assert_eq!(lookup_path(&p, "event_name"), Some(&json!("Transfer")));
        assert_eq!(lookup_path(&p, "args.from"), Some(&json!("0xA")));
        assert_eq!(lookup_path(&p, "args.nested.deep"), Some(&json!(1)));
        assert_eq!(lookup_path(&p, "topics.1"), Some(&json!("0x02")));
    }

    #[test]
    fn test_lookup_missing_or_null() {
        let p = payload();
        assert_eq!(lookup_path(&p, "args.to"), None);
        assert_eq!(lookup_path(&p, "event_name.inner"), None);
        assert_eq!(lookup_path(&p, "empty"), None);
        assert_eq!(lookup_path(&p, "topics.9"), None);
        assert_eq!(lookup_path_in(&json!("scalar"), "a"), None);
    }
}
