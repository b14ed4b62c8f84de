use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::warn;

use crate::model::{unique_key, EventContext};

/// Track-log timestamp format. A trailing `+HH:MM`/`-HH:MM` offset is
/// stripped before parsing, not applied: upstream exports are already
/// normalized.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

fn module_hash_re() -> &'static Regex {
    static MODULE_HASH_RE: OnceLock<Regex> = OnceLock::new();
    MODULE_HASH_RE.get_or_init(|| Regex::new(r"([a-f0-9]{32})").expect("valid module hash regex"))
}

fn problem_course_re() -> &'static Regex {
    static PROBLEM_COURSE_RE: OnceLock<Regex> = OnceLock::new();
    PROBLEM_COURSE_RE.get_or_init(|| {
        Regex::new(r"-([A-Za-z0-9]+)-([A-Za-z0-9_.]+)-problem-").expect("valid problem course regex")
    })
}

pub(crate) fn to_str(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Unwrap POST-form style singleton arrays (`["alice"]` -> `"alice"`).
pub(crate) fn first_str(value: Option<&Value>) -> String {
    match value {
        Some(Value::Array(items)) => to_str(items.first()),
        other => to_str(other),
    }
}

/// Make free text safe for downstream SQL loads: CR/LF become `"; "`,
/// backslashes are dropped, single quotes escaped.
pub fn make_insert_safe(unsafe_str: &str) -> String {
    unsafe_str
        .replace('\n', "; ")
        .replace('\r', "; ")
        .replace('\\', "")
        .replace('\'', "\\'")
}

/// Fish a 32-hex module hash out of a larger identifier string, e.g.
/// `input_i4x-Medicine-HRP258-problem-7451f8fe15a642e1820767db411a4a3e_2_1`.
pub fn extract_module_hash(id_str: &str) -> Option<String> {
    module_hash_re()
        .captures(id_str)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

/// Resolve an embedded module hash to its human-readable display name via
/// the injected map. Missing map entries leave the column untouched.
pub fn set_resource_display_name(ctx: &mut EventContext, candidate: &str) {
    if candidate.is_empty() {
        return;
    }
    let Some(hash) = extract_module_hash(candidate) else {
        return;
    };
    if let Some(name) = ctx.state.module_names.get(&hash) {
        let safe = make_insert_safe(name);
        ctx.set_str("resource_display_name", safe);
    }
}

/// Normalize the raw `time` field. Mongo-style `{"$date": <epoch ms>}`
/// objects are converted to the plain timestamp string format.
pub fn normalize_time_value(value: Option<&Value>) -> String {
    if let Some(obj) = value.and_then(Value::as_object) {
        if let Some(ms) = obj.get("$date").and_then(Value::as_i64) {
            if let Some(dt) = DateTime::from_timestamp_millis(ms) {
                return dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
            }
        }
    }
    to_str(value)
}

/// Parse a track-log timestamp. A trailing timezone offset is stripped
/// (treated as already normalized), never applied.
pub fn parse_event_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let stripped = if trimmed.len() > 6 && trimmed.is_char_boundary(trimmed.len() - 6) {
        let tail = &trimmed[trimmed.len() - 6..];
        let bytes = tail.as_bytes();
        if (bytes[0] == b'+' || bytes[0] == b'-') && bytes[3] == b':' {
            &trimmed[..trimmed.len() - 6]
        } else {
            trimmed
        }
    } else {
        trimmed
    };
    NaiveDateTime::parse_from_str(stripped, TIMESTAMP_FORMAT).ok()
}

/// Slice an org/course/run short ID out of a `/courses/...` path.
pub fn extract_short_course_id(full_course_str: &str) -> String {
    let frags: Vec<&str> = full_course_str.split('/').collect();
    if let Some(idx) = frags.iter().position(|f| *f == "courses") {
        let take = frags.iter().skip(idx + 1).take(3).copied().collect::<Vec<_>>();
        if !take.is_empty() {
            return take.join("/");
        }
    }
    String::new()
}

fn extract_course_from_problem_payload(payload: &str) -> String {
    // Isolate `-Medicine-HRP258-problem-<hash>` style fragments and join
    // org/course with a dash, as the legacy pipeline did.
    problem_course_re()
        .captures(payload)
        .map(|cap| format!("{}-{}", &cap[1], &cap[2]))
        .unwrap_or_default()
}

/// Legacy-compatibility course-ID derivation. The heuristics are keyed to
/// the institution path conventions of the original corpus and are pinned
/// by tests; do not expect them to generalize.
///
/// Returns `(full_course_name, course_id, course_display_name)`, any of
/// which may be empty.
pub fn derive_course_id(record: &Value) -> (String, String, String) {
    let empty = (String::new(), String::new(), String::new());
    let event_source = to_str(record.get("event_source"));
    if event_source.is_empty() {
        return empty;
    }

    let mut full_course_name;
    if event_source == "server" {
        let event_type = to_str(record.get("event_type"));
        if event_type.is_empty() {
            return empty;
        }
        if event_type == "/accounts/login" {
            let parsed = match record.get("event") {
                Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
                Some(Value::Object(obj)) => Some(Value::Object(obj.clone())),
                _ => None,
            };
            full_course_name = parsed
                .as_ref()
                .and_then(|p| p.get("GET"))
                .and_then(|g| g.get("next"))
                .and_then(|n| n.get(0))
                .map(|v| to_str(Some(v)))
                .unwrap_or_default();
            if full_course_name.is_empty() {
                return empty;
            }
        } else if event_type.starts_with("/courses") {
            let course_id = extract_short_course_id(&event_type);
            return (course_id.clone(), course_id.clone(), course_id);
        } else if event_type.contains("problem_") {
            let course_id = record
                .get("event")
                .map(|e| extract_course_from_problem_payload(&e.to_string()))
                .unwrap_or_default();
            return (course_id.clone(), course_id, String::new());
        } else {
            full_course_name = event_type;
        }
    } else {
        full_course_name = to_str(record.get("page"));
    }

    // The fallthrough wrongly captures dashboard and heartbeat paths.
    if full_course_name == "/dashboard" || full_course_name == "/heartbeat" {
        full_course_name.clear();
    }

    let display = if full_course_name.is_empty() {
        String::new()
    } else {
        extract_short_course_id(&full_course_name)
    };
    (full_course_name.clone(), full_course_name, display)
}

/// Outcome of common-field extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonOutcome {
    /// Proceed to kind-specific dispatch.
    Continue,
    /// The event is fully described by its common fields; push and stop.
    Finished,
}

/// Populate identity, time, geography, and course context on the row
/// under construction. Runs before kind dispatch for every decoded event;
/// the downtime check is an unconditional side effect here.
pub fn handle_common_fields(
    ctx: &mut EventContext,
    record: &Value,
    event_kind: &str,
) -> CommonOutcome {
    ctx.set_str("_id", unique_key());
    ctx.set_str("event_id", ctx.event_id.clone());
    for column in ["agent", "event_source", "page", "session"] {
        let value = make_insert_safe(&to_str(record.get(column)));
        ctx.set_str(column, value);
    }
    ctx.set_str("event_type", event_kind);

    let raw_time = normalize_time_value(record.get("time"));
    let parsed_time = parse_event_time(&raw_time);
    match parsed_time {
        Some(dt) => {
            let formatted = dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
            ctx.set_str("time", formatted);
        }
        None => {
            if !raw_time.is_empty() {
                warn!(
                    "Track log {}: unparsable timestamp '{}'; downtime check skipped",
                    ctx.citation(),
                    raw_time
                );
                ctx.state.counters.bad_timestamps += 1;
            }
            ctx.set_str("time", raw_time.clone());
        }
    }

    let username = to_str(record.get("username"));
    if !username.is_empty() {
        let hashed = ctx.state.actor_hash(&username);
        ctx.set_str("anon_screen_name", hashed);
    }

    let mut ip = to_str(record.get("ip"));
    if ip.is_empty() {
        ip = "127.0.0.1".to_string();
    }
    let country = ctx.state.ip_countries.get(&ip).cloned().unwrap_or_default();
    ctx.set_str("ip_country", country.clone());
    let row_id = ctx.get_str("_id");
    ctx.rows.event_ip_rows.push(json!({
        "event_table_id": row_id,
        "event_ip": country,
    }));

    // Downtime is tracked for every event with a usable timestamp, before
    // any dispatch or suppression decision.
    if let Some(dt) = parsed_time {
        if let Some(tag) = ctx.state.downtime.observe(&ip, dt) {
            ctx.set("downtime_for", json!(tag.seconds()));
            ctx.downtime_tagged = true;
        }
    }

    let (_full, course_id, display) = derive_course_id(record);
    ctx.course_id = course_id.clone();
    ctx.set_str("course_id", course_id);
    ctx.set_str("course_display_name", display);

    if let Some(context) = record.get("context").and_then(Value::as_object) {
        let ctx_course = to_str(context.get("course_id"));
        if !ctx_course.is_empty() {
            ctx.course_id = ctx_course.clone();
            ctx.set_str("course_id", ctx_course.clone());
            ctx.set_str("course_display_name", ctx_course);
        }
        let org = to_str(context.get("org_id"));
        if !org.is_empty() {
            ctx.set_str("organization", org);
        }
        if let Some(tags) = context.get("course_user_tags").and_then(Value::as_object) {
            let row_id = ctx.get_str("_id");
            for (tag, value) in tags {
                ctx.rows.ab_experiment_rows.push(json!({
                    "event_table_id": row_id,
                    "event_type": event_kind,
                    "group_id": -1,
                    "group_name": to_str(Some(value)),
                    "partition_id": -1,
                    "partition_name": tag,
                    "child_module_id": "",
                }));
            }
        }
    }

    // Some server paths are fully described by their common fields.
    if event_kind.ends_with("/about") {
        ctx.set_str("event_type", "about");
        // Course ID keeps the full path, minus the /about suffix.
        let course = &event_kind[..event_kind.len() - "/about".len()];
        if !course.is_empty() {
            ctx.course_id = course.to_string();
            ctx.set_str("course_id", course);
        }
        return CommonOutcome::Finished;
    }
    if event_kind.starts_with("/password_reset_confirm") {
        ctx.set_str("event_type", "password_reset_confirm");
        return CommonOutcome::Finished;
    }
    if event_kind == "/networking/" {
        ctx.set_str("event_type", "networking");
        return CommonOutcome::Finished;
    }

    CommonOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TranslateState;
    use serde_json::json;

    #[test]
    fn timestamp_offset_is_stripped_not_applied() {
        let dt = parse_event_time("2013-07-31T06:27:06.222843+00:00").expect("parse");
        assert_eq!(dt.format("%H:%M:%S").to_string(), "06:27:06");
        let dt = parse_event_time("2013-07-31T06:27:06.222843-05:00").expect("parse");
        assert_eq!(dt.format("%H:%M:%S").to_string(), "06:27:06");
    }

    #[test]
    fn timestamp_without_offset_parses() {
        assert!(parse_event_time("2013-07-31T06:27:06.222843").is_some());
        assert!(parse_event_time("31 July 2013").is_none());
    }

    #[test]
    fn mongo_date_objects_are_normalized() {
        let time = json!({"$date": 1375252026222i64});
        let normalized = normalize_time_value(Some(&time));
        assert!(normalized.starts_with("2013-07-31T"));
        assert!(parse_event_time(&normalized).is_some());
    }

    #[test]
    fn short_course_id_slices_after_courses_segment() {
        assert_eq!(
            extract_short_course_id(
                "/courses/Medicine/HRP258/Statistics_in_Medicine/courseware/x"
            ),
            "Medicine/HRP258/Statistics_in_Medicine"
        );
        assert_eq!(extract_short_course_id("/dashboard"), "");
    }

    #[test]
    fn course_id_from_login_redirect_target() {
        let record = json!({
            "event_source": "server",
            "event_type": "/accounts/login",
            "event": "{\"POST\": {}, \"GET\": {\"next\": [\"/courses/Medicine/HRP258/Statistics_in_Medicine/courseware/80160e/\"]}}",
        });
        let (full, course_id, display) = derive_course_id(&record);
        assert_eq!(
            full,
            "/courses/Medicine/HRP258/Statistics_in_Medicine/courseware/80160e/"
        );
        assert_eq!(course_id, full);
        assert_eq!(display, "Medicine/HRP258/Statistics_in_Medicine");
    }

    #[test]
    fn course_id_from_problem_payload_hash() {
        let record = json!({
            "event_source": "server",
            "event_type": "save_problem_check",
            "event": {"correct_map": {"i4x-Medicine-HRP258-problem-8dd11b4339884ab78bc844ce45847141_2_1": {}}},
        });
        let (_, course_id, _) = derive_course_id(&record);
        assert_eq!(course_id, "Medicine-HRP258");
    }

    #[test]
    fn dashboard_path_never_becomes_a_course() {
        let record = json!({
            "event_source": "server",
            "event_type": "/dashboard",
        });
        let (full, course_id, display) = derive_course_id(&record);
        assert_eq!(full, "");
        assert_eq!(course_id, "");
        assert_eq!(display, "");
    }

    #[test]
    fn insert_safe_flattens_newlines_and_quotes() {
        assert_eq!(
            make_insert_safe("line1\nline2's \\escape"),
            "line1; line2\\'s escape"
        );
    }

    #[test]
    fn common_fields_hash_actor_and_default_empty_ip_to_loopback() {
        let mut state = TranslateState::new(360);
        state
            .ip_countries
            .insert("127.0.0.1".to_string(), "USA".to_string());
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        let record = json!({
            "username": "alice",
            "agent": "Mozilla/5.0",
            "event_source": "browser",
            "time": "2013-07-31T06:27:06.222843",
            "ip": "",
            "page": "x",
        });
        let outcome = handle_common_fields(&mut ctx, &record, "play_video");
        assert_eq!(outcome, CommonOutcome::Continue);
        assert_eq!(ctx.get_str("anon_screen_name").len(), 40);
        assert_eq!(ctx.get_str("ip_country"), "USA");
        assert_eq!(ctx.get_str("time"), "2013-07-31 06:27:06.222843");
        // First sight of this IP tags a zero-duration downtime marker.
        assert_eq!(ctx.current.get("downtime_for"), Some(&json!(0)));
        assert_eq!(ctx.rows.event_ip_rows.len(), 1);
    }

    #[test]
    fn about_suffix_rewrites_and_finishes() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        let record = json!({"event_source": "server"});
        let outcome = handle_common_fields(
            &mut ctx,
            &record,
            "/courses/Medicine/HRP258/Statistics_in_Medicine/about",
        );
        assert_eq!(outcome, CommonOutcome::Finished);
        assert_eq!(ctx.get_str("event_type"), "about");
        assert_eq!(
            ctx.get_str("course_id"),
            "/courses/Medicine/HRP258/Statistics_in_Medicine"
        );
    }

    #[test]
    fn networking_rewrite_requires_exact_path() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        let record = json!({"event_source": "server"});
        let outcome = handle_common_fields(&mut ctx, &record, "/networking/");
        assert_eq!(outcome, CommonOutcome::Finished);
        assert_eq!(ctx.get_str("event_type"), "networking");

        let mut ctx = EventContext::new(&mut state, "test.log", 2);
        let outcome = handle_common_fields(&mut ctx, &record, "/networking/sub/page");
        assert_eq!(outcome, CommonOutcome::Continue);
    }

    #[test]
    fn common_string_fields_are_insert_safe() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        let record = json!({
            "agent": "Mozilla/5.0 ('quoted')\nsecond line",
            "event_source": "browser",
            "page": "x",
        });
        handle_common_fields(&mut ctx, &record, "page_close");
        assert_eq!(
            ctx.get_str("agent"),
            "Mozilla/5.0 (\\'quoted\\'); second line"
        );
    }

    #[test]
    fn context_block_overrides_course_and_emits_ab_rows() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        let record = json!({
            "event_source": "server",
            "context": {
                "course_id": "Medicine/HRP258/Statistics_in_Medicine",
                "org_id": "Medicine",
                "course_user_tags": {"xblock.partition_service.partition_5": "2"},
            },
        });
        handle_common_fields(&mut ctx, &record, "page_close");
        assert_eq!(
            ctx.get_str("course_id"),
            "Medicine/HRP258/Statistics_in_Medicine"
        );
        assert_eq!(ctx.get_str("organization"), "Medicine");
        assert_eq!(ctx.rows.ab_experiment_rows.len(), 1);
        assert_eq!(
            ctx.rows.ab_experiment_rows[0]["partition_name"],
            "xblock.partition_service.partition_5"
        );
    }

    #[test]
    fn resource_display_name_resolves_through_module_map() {
        let mut state = TranslateState::new(360);
        state.module_names.insert(
            "7451f8fe15a642e1820767db411a4a3e".to_string(),
            "Confidence intervals".to_string(),
        );
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        set_resource_display_name(
            &mut ctx,
            "input_i4x-Medicine-HRP258-problem-7451f8fe15a642e1820767db411a4a3e_2_1",
        );
        assert_eq!(ctx.get_str("resource_display_name"), "Confidence intervals");

        set_resource_display_name(&mut ctx, "no-hash-here");
        assert_eq!(ctx.get_str("resource_display_name"), "Confidence intervals");
    }
}
