use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::common::{make_insert_safe, set_resource_display_name, to_str};
use crate::model::{unique_key, EventContext};

/// Content of one generated answer row, kept so the fan-out can mirror the
/// answer text and problem ID into the main row it links from.
#[derive(Debug, Clone)]
pub struct AnswerInfo {
    pub problem_id: String,
    pub answer: String,
}

#[derive(Debug, Clone)]
pub struct CorrectMapInfo {
    pub answer_identifier: String,
    pub correctness: String,
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| to_str(Some(item)))
            .collect::<Vec<_>>()
            .join(","),
        other => to_str(Some(other)),
    }
}

/// Flatten an `answers`-style mapping (problem ID -> chosen answer) into
/// one auxiliary answer row per entry, each with a fresh unique key.
/// Returns the keys in source insertion order plus a key -> content map.
pub fn push_answers(
    ctx: &mut EventContext,
    answers: &Map<String, Value>,
) -> (Vec<String>, HashMap<String, AnswerInfo>) {
    let mut keys = Vec::with_capacity(answers.len());
    let mut infos = HashMap::with_capacity(answers.len());
    let course_id = ctx.course_id.clone();
    for (problem_id, value) in answers {
        let key = unique_key();
        let answer = answer_text(value);
        ctx.rows.answer_rows.push(json!({
            "answer_id": key,
            "problem_id": problem_id,
            "answer": answer,
            "course_id": course_id,
        }));
        infos.insert(
            key.clone(),
            AnswerInfo {
                problem_id: problem_id.clone(),
                answer,
            },
        );
        keys.push(key);
    }
    (keys, infos)
}

fn queuestate_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Object(obj)) => {
            let key = to_str(obj.get("key"));
            let time = to_str(obj.get("time"));
            if key.is_empty() && time.is_empty() {
                String::new()
            } else {
                format!("{key}:{time}")
            }
        }
        other => to_str(other),
    }
}

/// Flatten a `correct_map` mapping (answer identifier -> grading detail).
pub fn push_correct_maps(
    ctx: &mut EventContext,
    correct_map: &Map<String, Value>,
) -> (Vec<String>, HashMap<String, CorrectMapInfo>) {
    let mut keys = Vec::with_capacity(correct_map.len());
    let mut infos = HashMap::with_capacity(correct_map.len());
    for (answer_identifier, entry) in correct_map {
        let key = unique_key();
        let correctness = to_str(entry.get("correctness"));
        let npoints = entry
            .get("npoints")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        ctx.rows.correct_map_rows.push(json!({
            "correct_map_id": key,
            "answer_identifier": answer_identifier,
            "correctness": correctness,
            "npoints": npoints,
            "msg": make_insert_safe(&to_str(entry.get("msg"))),
            "hint": to_str(entry.get("hint")),
            "hintmode": to_str(entry.get("hintmode")),
            "queuestate": queuestate_text(entry.get("queuestate")),
        }));
        infos.insert(
            key.clone(),
            CorrectMapInfo {
                answer_identifier: answer_identifier.clone(),
                correctness,
            },
        );
        keys.push(key);
    }
    (keys, infos)
}

/// Flatten an `input_state` mapping; an empty nested object becomes an
/// empty state string.
pub fn push_input_states(ctx: &mut EventContext, input_state: &Map<String, Value>) -> Vec<String> {
    let mut keys = Vec::with_capacity(input_state.len());
    for (problem_id, value) in input_state {
        let key = unique_key();
        let state = match value {
            Value::Object(obj) if obj.is_empty() => String::new(),
            other => to_str(Some(other)),
        };
        ctx.rows.input_state_rows.push(json!({
            "input_state_id": key,
            "problem_id": problem_id,
            "state": state,
        }));
        keys.push(key);
    }
    keys
}

/// Flatten a state snapshot: its nested `student_answers`, `correct_map`,
/// and `input_state` maps each become auxiliary rows, and the snapshot
/// itself fans out into position-aligned state rows covering all of them.
pub fn push_state(ctx: &mut EventContext, state: &Map<String, Value>) -> Vec<String> {
    let empty = Map::new();
    let student_answers = state
        .get("student_answers")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let correct_map = state
        .get("correct_map")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let input_state = state
        .get("input_state")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let (answer_keys, answer_infos) = push_answers(ctx, student_answers);
    let (correct_map_keys, _) = push_correct_maps(ctx, correct_map);
    let input_state_keys = push_input_states(ctx, input_state);

    let seed = to_str(state.get("seed"));
    let done = to_str(state.get("done"));

    let total = answer_keys
        .len()
        .max(correct_map_keys.len())
        .max(input_state_keys.len());
    let mut keys = Vec::with_capacity(total);
    for i in 0..total {
        let key = unique_key();
        let answer_fk = answer_keys.get(i).cloned().unwrap_or_default();
        let problem_id = answer_infos
            .get(&answer_fk)
            .map(|info| info.problem_id.clone())
            .unwrap_or_default();
        ctx.rows.state_rows.push(json!({
            "state_id": key,
            "seed": seed,
            "done": done,
            "problem_id": problem_id,
            "student_answer_fk": answer_fk,
            "correct_map_fk": correct_map_keys.get(i).cloned().unwrap_or_default(),
            "input_state_fk": input_state_keys.get(i).cloned().unwrap_or_default(),
        }));
        keys.push(key);
    }
    keys
}

/// Positional fan-out of one event into `max(a, c, s)` main-table rows.
/// Row `i` takes the `i`-th key of each list that has one and leaves the
/// other foreign keys empty. Alignment is by position, not by problem
/// key; lists of unequal length produce rows referencing only a subset.
pub fn fanout_rows(
    ctx: &mut EventContext,
    answer_keys: &[String],
    answers: &HashMap<String, AnswerInfo>,
    correct_map_keys: &[String],
    correct_maps: &HashMap<String, CorrectMapInfo>,
    state_keys: &[String],
) {
    let total = answer_keys
        .len()
        .max(correct_map_keys.len())
        .max(state_keys.len());

    for i in 0..total {
        match answer_keys.get(i) {
            Some(key) => {
                ctx.set_str("answer_fk", key.clone());
                if let Some(info) = answers.get(key) {
                    let problem_id = info.problem_id.clone();
                    ctx.set_str("problem_id", problem_id.clone());
                    ctx.set_str("answer", info.answer.clone());
                    set_resource_display_name(ctx, &problem_id);
                }
            }
            None => {
                ctx.set_str("answer_fk", "");
                ctx.set_str("answer", "");
            }
        }

        match correct_map_keys.get(i) {
            Some(key) => {
                ctx.set_str("correctMap_fk", key.clone());
                if let Some(info) = correct_maps.get(key) {
                    ctx.set_str("answer_identifier", info.answer_identifier.clone());
                    ctx.set_str("correctness", info.correctness.clone());
                }
            }
            None => ctx.set_str("correctMap_fk", ""),
        }

        match state_keys.get(i) {
            Some(key) => ctx.set_str("state_fk", key.clone()),
            None => ctx.set_str("state_fk", ""),
        }

        ctx.push_event();
        ctx.next_row_id();
    }

    // All covered rows were pushed here; nothing is left for finalize.
    ctx.discard();
}
