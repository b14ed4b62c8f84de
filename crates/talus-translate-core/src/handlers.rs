use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

use crate::common::{first_str, make_insert_safe, set_resource_display_name, to_str};
use crate::decode::repair_backslashes;
use crate::fanout::{fanout_rows, push_answers, push_correct_maps, push_state};
use crate::model::{unique_key, EventContext};

/// Matches `input_<problem>_choice_N" class="choicegroup_correct` pairs
/// inside the HTML blob carried by `problem_graded` events.
fn problem_graded_re() -> &'static Regex {
    static PROBLEM_GRADED_RE: OnceLock<Regex> = OnceLock::new();
    PROBLEM_GRADED_RE.get_or_init(|| {
        Regex::new(
            r#"input_(i4x[-\w]+_\d+_\d+)_choice_\d+[\\"']*\s+class=[\\"']*choicegroup_(correct|incorrect)"#,
        )
        .expect("valid problem_graded regex")
    })
}

/// Resolve the nested `event` field. It arrives either as a JSON object or
/// as a string containing JSON that may itself be badly escaped; the last
/// resort strips backslashes entirely. Unparseable strings are returned
/// verbatim (never evaluated).
fn event_payload(record: &Value) -> Value {
    match record.get("event") {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(s)) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                return parsed;
            }
            let repaired = repair_backslashes(s);
            if let Ok(parsed) = serde_json::from_str::<Value>(&repaired) {
                return parsed;
            }
            let stripped = s.replace('\\', "");
            if let Ok(parsed) = serde_json::from_str::<Value>(&stripped) {
                return parsed;
            }
            Value::String(s.clone())
        }
        Some(other) => other.clone(),
    }
}

fn payload_object<'a>(
    ctx: &EventContext,
    payload: &'a Value,
    kind: &str,
) -> Option<&'a Map<String, Value>> {
    match payload {
        Value::Object(obj) => Some(obj),
        Value::Null => {
            warn!(
                "Track log {}: missing event info in {} event",
                ctx.citation(),
                kind
            );
            None
        }
        other => {
            warn!(
                "Track log {}: event is not a dict in {} event: '{}'",
                ctx.citation(),
                kind,
                other
            );
            None
        }
    }
}

fn join_str_array(value: Option<&Value>, sep: &str) -> String {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| to_str(Some(item)))
            .collect::<Vec<_>>()
            .join(sep),
        other => to_str(other),
    }
}

/// Parse a browser-style `probID=choice_0&probID2=choice_1` answer string.
/// Any pair that does not split into exactly a key and a value makes the
/// whole string unusable; answer text is made insert-safe.
fn answers_from_query_string(raw: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    for pair in raw.split('&') {
        let parts: Vec<&str> = pair.split('=').collect();
        if parts.len() != 2 {
            return None;
        }
        let key = parts[0].trim();
        let value = parts[1].trim();
        if key.is_empty() {
            return None;
        }
        map.insert(key.to_string(), Value::String(make_insert_safe(value)));
    }
    Some(map)
}

/// Kind-specific dispatch. Each arm fills the row under construction (or
/// fans out into several rows) and must never fail: malformed payloads are
/// logged and leave whatever partial row was built so far.
pub fn dispatch_event(ctx: &mut EventContext, record: &Value, event_kind: &str) {
    let payload = event_payload(record);
    match event_kind {
        "seq_goto" | "seq_next" | "seq_prev" => handle_seq_nav(ctx, &payload, event_kind),

        // Fully described by their common fields.
        "/accounts/login" | "/dashboard" | "page_close" => {}

        // Slash-prefixed in the logs; must precede the path-styled fallback.
        "/login_ajax" => handle_ajax_login(ctx, &payload),

        "problem_check" | "save_problem_check" => handle_problem_check(ctx, &payload, event_kind),
        "problem_reset" => handle_problem_reset(ctx, &payload),
        "problem_show" => handle_problem_show(ctx, &payload),
        "problem_save" => handle_problem_save(ctx, &payload),
        "problem_check_fail" | "save_problem_check_fail" => {
            handle_problem_check_fail(ctx, &payload, event_kind)
        }
        "problem_rescore_fail" => handle_problem_rescore_fail(ctx, &payload),
        "problem_rescore" => handle_problem_rescore(ctx, &payload),
        "save_problem_fail" | "save_problem_success" | "reset_problem_fail" => {
            handle_save_problem_outcome(ctx, &payload, event_kind)
        }
        "reset_problem" => handle_reset_problem(ctx, &payload),
        "problem_graded" => handle_problem_graded(ctx, &payload),
        "showanswer" | "show_answer" => handle_show_answer(ctx, &payload),

        "oe_hide_question"
        | "oe_show_question"
        | "oe_hide_problem"
        | "oe_show_problem"
        | "peer_grading_hide_question"
        | "peer_grading_show_question"
        | "peer_grading_hide_problem"
        | "peer_grading_show_problem"
        | "staff_grading_hide_question"
        | "staff_grading_show_question"
        | "staff_grading_hide_problem"
        | "staff_grading_show_problem" => handle_question_hide_show(ctx, &payload, event_kind),
        "rubric_select" => handle_rubric_select(ctx, &payload),
        "oe_show_full_feedback" | "oe_show_respond_to_feedback" => {
            handle_oe_feedback(ctx, &payload)
        }
        "oe_feedback_response_selected" => handle_oe_feedback_response(ctx, &payload),

        "show_transcript" | "hide_transcript" => handle_transcript(ctx, &payload),
        "load_video" | "play_video" | "pause_video" | "stop_video" | "video_player_ready" => {
            handle_video_play_pause(ctx, &payload, event_kind)
        }
        "seek_video" => handle_video_seek(ctx, &payload),
        "speed_change_video" => handle_video_speed_change(ctx, &payload),
        "fullscreen" | "not_fullscreen" => handle_fullscreen(ctx, &payload, event_kind),

        "book" => handle_book(ctx, &payload),

        // Instructor listings carry no payload beyond the common fields.
        "list-students"
        | "list-staff"
        | "list-instructors"
        | "list-beta-testers"
        | "dump-grades"
        | "dump-grades-raw"
        | "dump-grades-csv"
        | "dump-grades-csv-raw"
        | "dump-answer-dist-csv"
        | "dump-graded-assignments-config" => {}
        "rescore-all-submissions" | "reset-all-attempts" => {
            handle_all_submissions(ctx, &payload, event_kind)
        }
        "delete-student-module-state" | "rescore-student-submission" => {
            handle_student_module(ctx, &payload, event_kind)
        }
        "reset-student-attempts" => handle_reset_student_attempts(ctx, &payload),
        "get-student-progress-page" => handle_progress_page(ctx, &payload),
        "add-instructor" | "remove-instructor" => handle_add_remove_instructor(ctx, &payload),
        "list-forum-admins" | "list-forum-mods" | "list-forum-community-TAs" => {
            handle_list_forum(ctx, &payload, event_kind)
        }
        "remove-forum-admin"
        | "add-forum-admin"
        | "remove-forum-mod"
        | "add-forum-mod"
        | "remove-forum-community-TA"
        | "add-forum-community-TA" => handle_forum_manipulation(ctx, &payload, event_kind),
        "psychometrics-histogram-generation" => handle_psychometrics(ctx, &payload),
        "add-or-remove-user-group" => handle_user_group(ctx, &payload),

        "/create_account" => handle_create_account(ctx, &payload),
        "change-email-settings" => handle_receive_email(ctx, record, &payload),
        "assigned_user_to_partition" | "child_render" => {
            handle_ab_experiment(ctx, record, &payload)
        }

        "edx.course.enrollment.activated" | "edx.course.enrollment.deactivated" => {
            handle_enrollment(ctx, record, &payload)
        }
        "edx.course.enrollment.upgrade.clicked" | "edx.course.enrollment.upgrade.succeeded" => {
            handle_enrollment_upgrade(ctx, record)
        }

        "edx.forum.searched" => handle_forum_search(ctx, &payload),
        "edx.forum.thread.created"
        | "edx.forum.response.created"
        | "edx.forum.comment.created"
        | "edx.forum.response.voted"
        | "edx.forum.thread.voted" => handle_forum_collaboration(ctx, &payload, event_kind),

        kind if kind.starts_with('/') => handle_path_styled(ctx, &payload, kind),

        other => {
            warn!(
                "Track log {}: unknown event type '{}'; row dropped",
                ctx.citation(),
                other
            );
            ctx.error_row("unknown_event_kind", "no handler for event type", other);
            ctx.state.counters.dropped_lines += 1;
            ctx.discard();
        }
    }
}

fn handle_seq_nav(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let sequence_id = to_str(event.get("id"));
    ctx.set_str("sequence_id", sequence_id.clone());
    ctx.set_str("goto_from", to_str(event.get("old")));
    ctx.set_str("goto_dest", to_str(event.get("new")));
    set_resource_display_name(ctx, &sequence_id);
}

fn handle_ajax_login(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "/login_ajax") else {
        return;
    };
    let Some(post) = event.get("POST").and_then(Value::as_object) else {
        warn!(
            "Track log {}: event in /login_ajax is not POST/GET styled",
            ctx.citation()
        );
        return;
    };
    let email = join_str_array(post.get("email"), "; ");
    if !email.is_empty() {
        let hashed = ctx.state.actor_hash(&email);
        ctx.set_str("anon_screen_name", hashed);
    }
}

fn handle_problem_check(ctx: &mut EventContext, payload: &Value, kind: &str) {
    match payload {
        Value::Object(event) => {
            ctx.set_str("success", to_str(event.get("success")));
            let problem_id = to_str(event.get("problem_id"));
            if !problem_id.is_empty() {
                ctx.set_str("problem_id", problem_id);
            }
            if let Some(attempts) = event.get("attempts").and_then(Value::as_i64) {
                ctx.set("attempts", json!(attempts));
            }
            let (cm_keys, cm_infos) = match event.get("correct_map").and_then(Value::as_object) {
                Some(map) => push_correct_maps(ctx, map),
                None => (Vec::new(), HashMap::new()),
            };
            let (a_keys, a_infos) = match event.get("answers").and_then(Value::as_object) {
                Some(map) => push_answers(ctx, map),
                None => (Vec::new(), HashMap::new()),
            };
            let s_keys = match event.get("state").and_then(Value::as_object) {
                Some(map) => push_state(ctx, map),
                None => Vec::new(),
            };
            fanout_rows(ctx, &a_keys, &a_infos, &cm_keys, &cm_infos, &s_keys);
        }
        Value::String(raw) => {
            // Browser-side checks carry a GET-style answer string instead
            // of a structured payload.
            let Some(answers) = answers_from_query_string(raw) else {
                warn!(
                    "Track log {}: malformed answer string in browser-side {} event: '{}'",
                    ctx.citation(),
                    kind,
                    raw
                );
                return;
            };
            let (a_keys, a_infos) = push_answers(ctx, &answers);
            fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &[]);
        }
        _ => {
            warn!(
                "Track log {}: missing event info in {} event",
                ctx.citation(),
                kind
            );
        }
    }
}

fn handle_problem_check_fail(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    ctx.set_str("success", to_str(event.get("failure")));
    ctx.set_str("problem_id", to_str(event.get("problem_id")));
    let (a_keys, a_infos) = match event.get("answers").and_then(Value::as_object) {
        Some(map) => push_answers(ctx, map),
        None => (Vec::new(), HashMap::new()),
    };
    let s_keys = match event.get("state").and_then(Value::as_object) {
        Some(map) => push_state(ctx, map),
        None => Vec::new(),
    };
    fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &s_keys);
}

fn handle_problem_rescore_fail(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "problem_rescore_fail") else {
        return;
    };
    ctx.set_str("success", to_str(event.get("failure")));
    ctx.set_str("problem_id", to_str(event.get("problem_id")));
    let s_keys = match event.get("state").and_then(Value::as_object) {
        Some(map) => push_state(ctx, map),
        None => Vec::new(),
    };
    fanout_rows(ctx, &[], &HashMap::new(), &[], &HashMap::new(), &s_keys);
}

fn handle_problem_rescore(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "problem_rescore") else {
        return;
    };
    ctx.set_str("success", to_str(event.get("success")));
    ctx.set_str("problem_id", to_str(event.get("problem_id")));
    ctx.set_str("orig_score", to_str(event.get("orig_score")));
    ctx.set_str("new_score", to_str(event.get("new_score")));
    ctx.set_str("orig_total", to_str(event.get("orig_total")));
    ctx.set_str("new_total", to_str(event.get("new_total")));
    let (cm_keys, cm_infos) = match event.get("correct_map").and_then(Value::as_object) {
        Some(map) => push_correct_maps(ctx, map),
        None => (Vec::new(), HashMap::new()),
    };
    fanout_rows(ctx, &[], &HashMap::new(), &cm_keys, &cm_infos, &[]);
}

fn handle_save_problem_outcome(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    if let Some(failure) = event.get("failure") {
        ctx.set_str("success", to_str(Some(failure)));
    }
    ctx.set_str("problem_id", to_str(event.get("problem_id")));
    let (a_keys, a_infos) = match event.get("answers").and_then(Value::as_object) {
        Some(map) => push_answers(ctx, map),
        None => (Vec::new(), HashMap::new()),
    };
    let s_keys = match event.get("state").and_then(Value::as_object) {
        Some(map) => push_state(ctx, map),
        None => Vec::new(),
    };
    fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &s_keys);
}

fn handle_reset_problem(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "reset_problem") else {
        return;
    };
    // Both the pre- and post-reset snapshots become state rows.
    let mut s_keys = Vec::new();
    for field in ["old_state", "new_state"] {
        if let Some(map) = event.get(field).and_then(Value::as_object) {
            s_keys.extend(push_state(ctx, map));
        }
    }
    fanout_rows(ctx, &[], &HashMap::new(), &[], &HashMap::new(), &s_keys);
}

fn handle_problem_reset(ctx: &mut EventContext, payload: &Value) {
    match payload {
        Value::Object(event) => {
            let problem_id = first_str(
                event
                    .get("POST")
                    .and_then(Value::as_object)
                    .and_then(|post| post.get("id")),
            );
            ctx.set_str("problem_id", problem_id.clone());
            set_resource_display_name(ctx, &problem_id);
        }
        Value::String(raw) => {
            ctx.set_str("problem_id", raw.clone());
            set_resource_display_name(ctx, raw);
        }
        _ => warn!(
            "Track log {}: missing event info in problem_reset event",
            ctx.citation()
        ),
    }
}

fn handle_problem_show(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "problem_show") else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    ctx.set_str("problem_id", problem_id.clone());
    set_resource_display_name(ctx, &problem_id);
}

fn handle_problem_save(ctx: &mut EventContext, payload: &Value) {
    let Value::String(raw) = payload else {
        warn!(
            "Track log {}: problem_save event without answer string",
            ctx.citation()
        );
        return;
    };
    let Some(answers) = answers_from_query_string(raw) else {
        warn!(
            "Track log {}: malformed answer string in problem_save event: '{}'",
            ctx.citation(),
            raw
        );
        return;
    };
    let (a_keys, a_infos) = push_answers(ctx, &answers);
    fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &[]);
}

fn handle_problem_graded(ctx: &mut EventContext, payload: &Value) {
    if payload.is_null() {
        warn!(
            "Track log {}: missing event text in problem_graded event",
            ctx.citation()
        );
        return;
    }
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut answers = Map::new();
    for cap in problem_graded_re().captures_iter(&text) {
        answers.insert(cap[1].to_string(), Value::String(cap[2].to_string()));
    }
    if answers.is_empty() {
        warn!(
            "Track log {}: could not parse problem/correctness pairs from problem_graded event",
            ctx.citation()
        );
        ctx.set_str("badly_formatted", make_insert_safe(&text));
        return;
    }
    let (a_keys, a_infos) = push_answers(ctx, &answers);
    fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &[]);
}

fn handle_show_answer(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "showanswer") else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    ctx.set_str("problem_id", problem_id.clone());
    set_resource_display_name(ctx, &problem_id);
}

fn handle_question_hide_show(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let location = to_str(event.get("location"));
    ctx.set_str("question_location", location.clone());
    set_resource_display_name(ctx, &location);
}

fn handle_rubric_select(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "rubric_select") else {
        return;
    };
    ctx.set_str("question_location", to_str(event.get("location")));
    ctx.set_str("rubric_selection", to_str(event.get("selection")));
    ctx.set_str("rubric_category", to_str(event.get("category")));
}

fn handle_oe_feedback(ctx: &mut EventContext, payload: &Value) {
    if payload.is_null() {
        warn!(
            "Track log {}: missing event text in feedback event",
            ctx.citation()
        );
        return;
    }
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ctx.set_str("feedback", make_insert_safe(&text));
}

fn handle_oe_feedback_response(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "oe_feedback_response_selected") else {
        return;
    };
    ctx.set_str("feedback_response_selected", to_str(event.get("value")));
}

fn handle_transcript(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "transcript") else {
        return;
    };
    let transcript_id = to_str(event.get("id"));
    ctx.set_str("transcript_id", transcript_id.clone());
    ctx.set_str("transcript_code", to_str(event.get("code")));
    set_resource_display_name(ctx, &transcript_id);
}

fn handle_video_play_pause(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let video_id = to_str(event.get("id"));
    ctx.set_str("video_id", video_id.clone());
    ctx.set_str("video_code", to_str(event.get("code")));
    ctx.set_str("video_current_time", to_str(event.get("currentTime")));
    ctx.set_str("video_speed", to_str(event.get("speed")));
    set_resource_display_name(ctx, &video_id);
}

fn handle_video_seek(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "seek_video") else {
        return;
    };
    let video_id = to_str(event.get("id"));
    ctx.set_str("video_id", video_id.clone());
    ctx.set_str("video_code", to_str(event.get("code")));
    ctx.set_str("video_old_time", to_str(event.get("old_time")));
    ctx.set_str("video_new_time", to_str(event.get("new_time")));
    ctx.set_str("video_seek_type", to_str(event.get("type")));
    set_resource_display_name(ctx, &video_id);
}

fn handle_video_speed_change(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "speed_change_video") else {
        return;
    };
    let video_id = to_str(event.get("id"));
    ctx.set_str("video_id", video_id.clone());
    ctx.set_str("video_old_speed", to_str(event.get("old_speed")));
    ctx.set_str("video_new_speed", to_str(event.get("new_speed")));
    set_resource_display_name(ctx, &video_id);
}

fn handle_fullscreen(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let video_id = to_str(event.get("id"));
    ctx.set_str("video_id", video_id.clone());
    ctx.set_str("video_code", to_str(event.get("code")));
    ctx.set_str("video_current_time", to_str(event.get("currentTime")));
    set_resource_display_name(ctx, &video_id);
}

fn handle_book(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "book") else {
        return;
    };
    ctx.set_str("book_interaction_type", to_str(event.get("type")));
    ctx.set_str("goto_from", to_str(event.get("old")));
    ctx.set_str("goto_dest", to_str(event.get("new")));
}

fn handle_all_submissions(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    ctx.set_str("problem_id", problem_id.clone());
    let course = to_str(event.get("course"));
    if !course.is_empty() {
        ctx.course_id = course.clone();
        ctx.set_str("course_id", course);
    }
    set_resource_display_name(ctx, &problem_id);
}

fn handle_student_module(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    ctx.set_str("problem_id", problem_id.clone());
    ctx.set_str("student_id", to_str(event.get("student")));
    set_resource_display_name(ctx, &problem_id);
}

fn handle_reset_student_attempts(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "reset-student-attempts") else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    ctx.set_str("problem_id", problem_id.clone());
    ctx.set_str("student_id", to_str(event.get("student")));
    ctx.set_str("instructor_id", to_str(event.get("instructor")));
    if let Some(old_attempts) = event.get("old_attempts").and_then(Value::as_i64) {
        ctx.set("attempts", json!(old_attempts));
    }
    set_resource_display_name(ctx, &problem_id);
}

fn handle_progress_page(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "get-student-progress-page") else {
        return;
    };
    ctx.set_str("student_id", to_str(event.get("student")));
    ctx.set_str("instructor_id", to_str(event.get("instructor")));
}

fn handle_add_remove_instructor(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "add/remove-instructor") else {
        return;
    };
    ctx.set_str("instructor_id", to_str(event.get("instructor")));
}

fn handle_list_forum(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let course = to_str(event.get("course"));
    if !course.is_empty() {
        ctx.course_id = course.clone();
        ctx.set_str("course_id", course);
    }
}

fn handle_forum_manipulation(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    // The named user is an actor too; route through the same hashing path.
    let username = to_str(event.get("username"));
    if !username.is_empty() {
        let hashed = ctx.state.actor_hash(&username);
        ctx.set_str("group_user", hashed);
    }
    let course = to_str(event.get("course"));
    if !course.is_empty() {
        ctx.set_str("course_id", course);
    }
}

fn handle_psychometrics(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "psychometrics-histogram-generation") else {
        return;
    };
    let problem_id = to_str(event.get("problem"));
    if problem_id.is_empty() {
        warn!(
            "Track log {}: missing problem in psychometrics-histogram-generation event",
            ctx.citation()
        );
    }
    ctx.set_str("problem_id", problem_id.clone());
    set_resource_display_name(ctx, &problem_id);
}

fn handle_user_group(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "add-or-remove-user-group") else {
        return;
    };
    ctx.set_str("event_name", to_str(event.get("event_name")));
    ctx.set_str("group_user", to_str(event.get("user")));
    ctx.set_str("group_action", to_str(event.get("event")));
}

fn year_of_birth(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Array(items)) => year_of_birth(items.first()),
        _ => 0,
    }
}

fn bool_flag(value: &str) -> i64 {
    if value == "true" {
        1
    } else {
        0
    }
}

fn zip_code_re() -> &'static Regex {
    static ZIP_CODE_RE: OnceLock<Regex> = OnceLock::new();
    ZIP_CODE_RE.get_or_init(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").expect("valid zip code regex"))
}

fn zip_and_country(mail_addr: &str) -> (String, String) {
    let zipcode = zip_code_re()
        .find_iter(mail_addr)
        .last()
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    // Without a geolocation dictionary a zip code is the only country
    // signal we keep; the zip stays only for USA addresses.
    if zipcode.is_empty() {
        (String::new(), String::new())
    } else {
        (zipcode, "USA".to_string())
    }
}

fn handle_create_account(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "create_account") else {
        return;
    };
    let Some(post) = event.get("POST").and_then(Value::as_object) else {
        warn!(
            "Track log {}: create_account event without POST block",
            ctx.citation()
        );
        return;
    };

    let screen_name = first_str(post.get("username"));
    let mail_addr = first_str(post.get("mailing_address"));
    let (zipcode, country) = zip_and_country(&mail_addr);
    let hashed = ctx.state.actor_hash(&screen_name);

    ctx.rows.account_rows.push(json!({
        "account_id": unique_key(),
        "screen_name": make_insert_safe(&screen_name),
        "name": make_insert_safe(&first_str(post.get("name"))),
        "anon_screen_name": hashed,
        "mailing_address": make_insert_safe(&mail_addr),
        "zipcode": zipcode,
        "country": country,
        "gender": first_str(post.get("gender")),
        "year_of_birth": year_of_birth(post.get("year_of_birth")),
        "level_of_education": first_str(post.get("level_of_education")),
        "goals": make_insert_safe(&first_str(post.get("goals"))),
        "honor_code": bool_flag(&first_str(post.get("honor_code"))),
        "terms_of_service": bool_flag(&first_str(post.get("terms_of_service"))),
        "course_id": first_str(post.get("course_id")),
        "enrollment_action": first_str(post.get("enrollment_action")),
        "email": first_str(post.get("email")),
        "receive_emails": first_str(post.get("receive_emails")),
    }));
}

fn handle_receive_email(ctx: &mut EventContext, record: &Value, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "change-email-settings") else {
        return;
    };
    let screen_name = to_str(record.get("username"));
    let hashed = ctx.state.actor_hash(&screen_name);
    ctx.rows.account_rows.push(json!({
        "account_id": unique_key(),
        "screen_name": "",
        "name": "",
        "anon_screen_name": hashed,
        "mailing_address": "",
        "zipcode": "",
        "country": "",
        "gender": "",
        "year_of_birth": 0,
        "level_of_education": "",
        "goals": "",
        "honor_code": 0,
        "terms_of_service": 0,
        "course_id": to_str(event.get("course")),
        "enrollment_action": "",
        "email": "",
        "receive_emails": to_str(event.get("receive_emails")),
    }));
}

fn handle_ab_experiment(ctx: &mut EventContext, record: &Value, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "assigned_user_to_partition") else {
        return;
    };
    if ctx.current.is_empty() {
        warn!(
            "Track log {}: empty partial row while processing A/B experiment event",
            ctx.citation()
        );
        return;
    }
    let row_id = ctx.get_str("_id");
    ctx.rows.ab_experiment_rows.push(json!({
        "event_table_id": row_id,
        "event_type": to_str(record.get("event_type")),
        "group_id": event.get("group_id").and_then(Value::as_i64).unwrap_or(-1),
        "group_name": to_str(event.get("group_name")),
        "partition_id": event.get("partition_id").and_then(Value::as_i64).unwrap_or(-1),
        "partition_name": to_str(event.get("partition_name")),
        "child_module_id": to_str(event.get("child_id")),
    }));
}

fn handle_enrollment(ctx: &mut EventContext, record: &Value, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "edx.course.enrollment") else {
        return;
    };
    ctx.set_str("hintmode", to_str(event.get("mode")));
    let session = to_str(event.get("session"));
    if !session.is_empty() {
        ctx.set_str("session", session);
    }
    if let Some(path) = record
        .get("context")
        .and_then(|c| c.get("path"))
        .map(|p| to_str(Some(p)))
    {
        if !path.is_empty() {
            ctx.set_str("page", path);
        }
    }
}

fn handle_enrollment_upgrade(ctx: &mut EventContext, record: &Value) {
    if let Some(mode) = record
        .get("context")
        .and_then(|c| c.get("mode"))
        .map(|m| to_str(Some(m)))
    {
        ctx.set_str("hintmode", mode);
    }
}

fn handle_forum_search(ctx: &mut EventContext, payload: &Value) {
    let Some(event) = payload_object(ctx, payload, "edx.forum.searched") else {
        return;
    };
    ctx.set_str("submission_id", to_str(event.get("query")));
    let page = to_str(event.get("page"));
    if !page.is_empty() {
        ctx.set_str("page", page);
    }
    ctx.set_str("success", to_str(event.get("total_results")));
}

fn collaboration_type_id(kind: &str) -> i64 {
    match kind {
        "edx.forum.thread.created" => 1,
        "edx.forum.response.created" => 2,
        "edx.forum.comment.created" => 3,
        "edx.forum.response.voted" | "edx.forum.thread.voted" => 4,
        _ => 0,
    }
}

fn handle_forum_collaboration(ctx: &mut EventContext, payload: &Value, kind: &str) {
    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    ctx.set("collaboration_type_id", json!(collaboration_type_id(kind)));
    ctx.set_str(
        "collaboration_content",
        make_insert_safe(&to_str(event.get("body"))),
    );
}

fn handle_path_styled(ctx: &mut EventContext, payload: &Value, kind: &str) {
    // The module hash buried in the path is often the only useful signal.
    set_resource_display_name(ctx, kind);

    let Some(event) = payload_object(ctx, payload, kind) else {
        return;
    };
    let Some(post) = event.get("POST").and_then(Value::as_object) else {
        warn!(
            "Track log {}: path-styled event is not POST/GET styled: '{}'",
            ctx.citation(),
            kind
        );
        return;
    };

    let verb = kind.rsplit('/').next().unwrap_or("");
    match verb {
        "is_student_calibrated" | "problem" => {
            let location = join_str_array(post.get("location"), "; ");
            if location.is_empty() {
                warn!(
                    "Track log {}: no location field in {} event",
                    ctx.citation(),
                    verb
                );
                return;
            }
            ctx.set_str("question_location", location);
        }
        "goto_position" => {
            ctx.set_str("position", join_str_array(post.get("position"), "; "));
        }
        "save_answer" => {
            ctx.set_str("student_file", join_str_array(post.get("student_file"), "; "));
            ctx.set_str(
                "long_answer",
                make_insert_safe(&join_str_array(post.get("student_answer"), "; ")),
            );
            ctx.set_str(
                "can_upload_file",
                join_str_array(post.get("can_upload_files"), "; "),
            );
        }
        "problem_check" => {
            if post.is_empty() {
                return;
            }
            let (a_keys, a_infos) = push_answers(ctx, post);
            fanout_rows(ctx, &a_keys, &a_infos, &[], &HashMap::new(), &[]);
        }
        "save_grade" => {
            ctx.set_str("submission_id", first_str(post.get("submission")));
            ctx.set_str(
                "long_answer",
                make_insert_safe(&join_str_array(post.get("feedback"), "; ")),
            );
        }
        // No extra information beyond the common fields.
        "get_last_response" | "check_for_score" | "problem_get" | "get_legend"
        | "problem_show" => {}
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TranslateState;

    fn ctx_fixture(state: &mut TranslateState) -> EventContext<'_> {
        EventContext::new(state, "test.log", 7)
    }

    #[test]
    fn problem_check_fans_out_one_row_per_answer() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event_type": "problem_check",
            "event": {
                "success": "correct",
                "problem_id": "p1",
                "answers": {"p1": "choice_0"},
            },
        });
        dispatch_event(&mut ctx, &record, "problem_check");

        assert_eq!(ctx.rows.event_rows.len(), 1);
        let row = &ctx.rows.event_rows[0];
        assert_eq!(row["problem_id"], "p1");
        assert_eq!(row["success"], "correct");
        assert_eq!(row["answer"], "choice_0");
        assert_eq!(
            row["answer_fk"],
            ctx.rows.answer_rows[0]["answer_id"],
        );
    }

    #[test]
    fn problem_check_mismatched_lists_leave_empty_fks() {
        // Two answers but only one correct-map entry: row 1 loses its
        // correctMap_fk, by position.
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {
                "answers": {"p1": "choice_0", "p2": "choice_1"},
                "correct_map": {"p1": {"correctness": "correct"}},
            },
        });
        dispatch_event(&mut ctx, &record, "problem_check");

        let rows = &ctx.rows.event_rows;
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0]["answer_fk"], "");
        assert_ne!(rows[0]["correctMap_fk"], "");
        assert_ne!(rows[1]["answer_fk"], "");
        assert_eq!(rows[1]["correctMap_fk"], "");
    }

    #[test]
    fn browser_problem_check_parses_query_string() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": "p1=choice_0&p2=choice_3",
        });
        dispatch_event(&mut ctx, &record, "problem_check");
        assert_eq!(ctx.rows.event_rows.len(), 2);
        assert_eq!(ctx.rows.answer_rows.len(), 2);
        assert_eq!(ctx.rows.answer_rows[0]["problem_id"], "p1");
    }

    #[test]
    fn nested_event_string_is_reparsed() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": "{\"id\": \"seq-1\", \"old\": 1, \"new\": 3}",
        });
        dispatch_event(&mut ctx, &record, "seq_goto");
        assert_eq!(ctx.get_str("sequence_id"), "seq-1");
        assert_eq!(ctx.get_str("goto_from"), "1");
        assert_eq!(ctx.get_str("goto_dest"), "3");
    }

    #[test]
    fn video_play_extracts_player_fields() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {"id": "vid-1", "code": "html5", "currentTime": 42.5, "speed": "1.5"},
        });
        dispatch_event(&mut ctx, &record, "play_video");
        assert_eq!(ctx.get_str("video_id"), "vid-1");
        assert_eq!(ctx.get_str("video_code"), "html5");
        assert_eq!(ctx.get_str("video_current_time"), "42.5");
        assert_eq!(ctx.get_str("video_speed"), "1.5");
    }

    #[test]
    fn video_player_ready_routes_to_video_handler() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {"id": "vid-9", "code": "html5"},
        });
        dispatch_event(&mut ctx, &record, "video_player_ready");
        assert_eq!(ctx.get_str("video_id"), "vid-9");
        assert_eq!(ctx.state.counters.dropped_lines, 0);
    }

    #[test]
    fn instructor_listings_are_common_fields_only() {
        let mut state = TranslateState::new(360);
        for kind in ["list-staff", "list-instructors", "list-beta-testers"] {
            let mut ctx = ctx_fixture(&mut state);
            ctx.set_str("event_type", kind);
            dispatch_event(&mut ctx, &json!({}), kind);
            assert!(!ctx.current.is_empty(), "{kind} row was dropped");
        }
        assert_eq!(state.counters.dropped_lines, 0);
    }

    #[test]
    fn malformed_query_string_abandons_all_answers() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        // Second pair has no value; the whole string is rejected.
        let record = json!({"event": "p1=choice_0&orphan"});
        dispatch_event(&mut ctx, &record, "problem_check");
        assert!(ctx.rows.answer_rows.is_empty());
        assert!(ctx.rows.event_rows.is_empty());
    }

    #[test]
    fn query_string_answers_are_insert_safe() {
        let answers = answers_from_query_string("p1=it's").expect("two-part pair");
        assert_eq!(answers["p1"], "it\\'s");
    }

    #[test]
    fn malformed_video_payload_keeps_partial_row() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        ctx.set_str("event_type", "play_video");
        let record = json!({"event": 17});
        dispatch_event(&mut ctx, &record, "play_video");
        // Handler warns and returns; the partial row survives for finalize.
        assert_eq!(ctx.get_str("event_type"), "play_video");
        assert!(!ctx.current.is_empty());
    }

    #[test]
    fn unknown_kind_drops_the_row() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        ctx.set_str("event_type", "never_heard_of_it");
        dispatch_event(&mut ctx, &json!({}), "never_heard_of_it");
        assert!(ctx.current.is_empty());
        assert_eq!(ctx.state.counters.dropped_lines, 1);
    }

    #[test]
    fn create_account_emits_anonymized_account_row() {
        let mut state = TranslateState::new(360);
        let expected_hash = state.actor_hash("luisXIV");
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {
                "POST": {
                    "username": ["luisXIV"],
                    "name": ["Roy Luigi Cannon"],
                    "mailing_address": ["3208 Dead St\r\nParis, GA 30243"],
                    "gender": ["f"],
                    "year_of_birth": ["1986"],
                    "level_of_education": ["p"],
                    "goals": ["flexibility, cost and 'prestige'"],
                    "honor_code": ["true"],
                    "terms_of_service": ["true"],
                    "course_id": ["Medicine/HRP258/Statistics_in_Medicine"],
                    "enrollment_action": ["enroll"],
                    "email": ["luig.cannon@example.com"],
                },
                "GET": {},
            },
        });
        dispatch_event(&mut ctx, &record, "/create_account");

        assert_eq!(ctx.rows.account_rows.len(), 1);
        let account = &ctx.rows.account_rows[0];
        assert_eq!(account["anon_screen_name"], expected_hash.as_str());
        assert_eq!(account["year_of_birth"], 1986);
        assert_eq!(account["honor_code"], 1);
        assert_eq!(account["zipcode"], "30243");
        assert_eq!(account["country"], "USA");
        assert_eq!(account["mailing_address"], "3208 Dead St; Paris, GA 30243");
    }

    #[test]
    fn ab_assignment_links_to_current_row() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        ctx.set_str("_id", "row_1");
        let record = json!({
            "event_type": "assigned_user_to_partition",
            "event": {
                "group_id": 2,
                "group_name": "Group 2",
                "partition_id": 5,
                "partition_name": "experiment_5",
                "child_id": "i4x://Medicine/HRP258/split_test/abc",
            },
        });
        dispatch_event(&mut ctx, &record, "assigned_user_to_partition");

        let row = &ctx.rows.ab_experiment_rows[0];
        assert_eq!(row["event_table_id"], "row_1");
        assert_eq!(row["group_id"], 2);
        assert_eq!(row["partition_name"], "experiment_5");
    }

    #[test]
    fn problem_graded_recovers_pairs_from_html_blob() {
        let text = "<label for=\"input_i4x-Medicine-HRP258-problem-fc217b7c689a40938dd55ebc44cb6f9a_4_1_choice_2\" class=\"choicegroup_correct\">";
        let mut answers = Map::new();
        for cap in problem_graded_re().captures_iter(text) {
            answers.insert(cap[1].to_string(), Value::String(cap[2].to_string()));
        }
        assert_eq!(
            answers.get("i4x-Medicine-HRP258-problem-fc217b7c689a40938dd55ebc44cb6f9a_4_1"),
            Some(&Value::String("correct".to_string()))
        );
    }

    #[test]
    fn path_styled_save_answer_flattens_post_arrays() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {
                "POST": {
                    "student_file": [""],
                    "student_answer": ["Students will have to think.\n"],
                    "can_upload_files": ["false"],
                },
                "GET": {},
            },
        });
        dispatch_event(
            &mut ctx,
            &record,
            "/courses/Education/EDUC115N/How_to_Learn_Math/modx/i4x://Education/EDUC115N/combinedopenended/ef6ba7f803bb46ebaaf008cde737e3e9/save_answer",
        );
        assert_eq!(ctx.get_str("long_answer"), "Students will have to think.; ");
        assert_eq!(ctx.get_str("can_upload_file"), "false");
    }

    #[test]
    fn forum_manipulation_hashes_target_user() {
        let mut state = TranslateState::new(360);
        let expected = state.actor_hash("smith");
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {"username": "smith", "course": "Medicine/HRP258/x"},
        });
        dispatch_event(&mut ctx, &record, "add-forum-admin");
        assert_eq!(ctx.get_str("group_user"), expected);
        assert_eq!(ctx.get_str("course_id"), "Medicine/HRP258/x");
    }

    #[test]
    fn forum_collaboration_types_are_stable() {
        assert_eq!(collaboration_type_id("edx.forum.thread.created"), 1);
        assert_eq!(collaboration_type_id("edx.forum.response.created"), 2);
        assert_eq!(collaboration_type_id("edx.forum.comment.created"), 3);
        assert_eq!(collaboration_type_id("edx.forum.thread.voted"), 4);
    }

    #[test]
    fn reset_problem_pushes_old_and_new_state() {
        let mut state = TranslateState::new(360);
        let mut ctx = ctx_fixture(&mut state);
        let record = json!({
            "event": {
                "old_state": {"student_answers": {"p1": "choice_0"}},
                "new_state": {"student_answers": {"p1": ""}},
            },
        });
        dispatch_event(&mut ctx, &record, "reset_problem");
        assert_eq!(ctx.rows.state_rows.len(), 2);
        assert_eq!(ctx.rows.event_rows.len(), 2);
    }
}
