use serde_json::Value;

/// Outcome of event-kind classification for one decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Kind(String),
    /// Neither an `event_type` field nor a nested `event.name` is present.
    MissingEventType,
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Determine the semantic event kind: the explicit `event_type` field
/// wins; otherwise a nested `event.name`; otherwise the record cannot be
/// dispatched.
pub fn classify(record: &Value) -> Classification {
    if let Some(event_type) = record.get("event_type") {
        if !event_type.is_null() {
            return Classification::Kind(value_as_string(event_type));
        }
    }

    if let Some(name) = record.get("event").and_then(|e| e.get("name")) {
        if !name.is_null() {
            return Classification::Kind(value_as_string(name));
        }
    }

    Classification::MissingEventType
}

/// Server heartbeats are suppressed unless the downtime tracker has
/// something to say about them.
pub fn is_heartbeat(kind: &str) -> bool {
    kind == "/heartbeat"
}

/// A bare `/` is a ping with no information at all.
pub fn is_ping(kind: &str) -> bool {
    kind == "/"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_event_type_wins() {
        let record = json!({"event_type": "play_video", "event": {"name": "ignored"}});
        assert_eq!(
            classify(&record),
            Classification::Kind("play_video".to_string())
        );
    }

    #[test]
    fn nested_event_name_is_fallback() {
        let record = json!({"event": {"name": "problem_check"}});
        assert_eq!(
            classify(&record),
            Classification::Kind("problem_check".to_string())
        );
    }

    #[test]
    fn missing_both_is_flagged() {
        assert_eq!(
            classify(&json!({"username": "alice"})),
            Classification::MissingEventType
        );
        assert_eq!(
            classify(&json!({"event_type": null})),
            Classification::MissingEventType
        );
    }

    #[test]
    fn suppression_predicates() {
        assert!(is_heartbeat("/heartbeat"));
        assert!(!is_heartbeat("/heartbeat/extra"));
        assert!(is_ping("/"));
        assert!(!is_ping("/dashboard"));
    }
}
