//! Dotted-path resolution against an event's flat view and payload tree.
//!
//! The flat view exposes `event_type`, `action`, `ref`, `actor`, `summary`,
//! and `repo`; paths under `payload.` traverse the JSON tree structurally.
//! A missing path always resolves to the empty string — both the filter
//! evaluator and the template expander share that rule.

use serde_json::Value;

use crate::models::Event;

/// Resolves `path` against `event`, returning the stringified value or the
/// empty string when the path is absent.
pub fn resolve_event_path(event: &Event, path: &str) -> String {
    let mut parts = path.split('.');
    let Some(head) = parts.next() else {
        return String::new();
    };

    if head == "payload" {
        let mut value = &event.payload;
        for part in parts {
            match value {
                Value::Object(map) => match map.get(part) {
                    Some(inner) => value = inner,
                    None => return String::new(),
                },
                _ => return String::new(),
            }
        }
        return stringify(value);
    }

    // Flat fields have no sub-paths.
    if parts.next().is_some() {
        return String::new();
    }
    match head {
        "event_type" => event.event_type.clone(),
        "action" => event.action.clone(),
        "repo" => event.repo.clone(),
        "ref" => event.ref_name.clone().unwrap_or_default(),
        "actor" => event.actor.clone().unwrap_or_default(),
        "summary" => event.summary.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
