use ripemd::{Digest, Ripemd160};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::downtime::DowntimeTracker;

pub const RAW_FRAGMENT_LIMIT: usize = 20_000;

/// Generate a universally unique key whose characters are all legal in
/// SQL identifiers.
pub fn unique_key() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect()
    }
}

/// Rows produced while translating input lines, grouped by destination table.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub event_rows: Vec<Value>,
    pub answer_rows: Vec<Value>,
    pub correct_map_rows: Vec<Value>,
    pub state_rows: Vec<Value>,
    pub input_state_rows: Vec<Value>,
    pub account_rows: Vec<Value>,
    pub ab_experiment_rows: Vec<Value>,
    pub event_ip_rows: Vec<Value>,
    pub error_rows: Vec<Value>,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.event_rows.len()
            + self.answer_rows.len()
            + self.correct_map_rows.len()
            + self.state_rows.len()
            + self.input_state_rows.len()
            + self.account_rows.len()
            + self.ab_experiment_rows.len()
            + self.event_ip_rows.len()
            + self.error_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub lines_read: u64,
    pub rows_emitted: u64,
    pub degraded_lines: u64,
    pub dropped_lines: u64,
    pub suppressed_lines: u64,
    pub bad_timestamps: u64,
}

/// Process-wide translation state. One instance per run (or per worker if
/// input files are ever split across workers); never shared without it.
pub struct TranslateState {
    /// Plaintext actor name -> 40-hex pseudonym. Append-only for the run.
    pub hash_cache: HashMap<String, String>,
    pub downtime: DowntimeTracker,
    /// IP address -> 3-letter country code, injected at construction.
    pub ip_countries: HashMap<String, String>,
    /// 32-hex module hash -> human-readable display name, injected.
    pub module_names: HashMap<String, String>,
    pub counters: Counters,
}

impl TranslateState {
    pub fn new(heartbeat_threshold_secs: i64) -> Self {
        Self {
            hash_cache: HashMap::new(),
            downtime: DowntimeTracker::new(heartbeat_threshold_secs),
            ip_countries: HashMap::new(),
            module_names: HashMap::new(),
            counters: Counters::default(),
        }
    }

    /// One-way 160-bit pseudonym for an actor name. The same plaintext
    /// always maps to the same 40-hex-char hash for the life of the run.
    pub fn actor_hash(&mut self, name: &str) -> String {
        if let Some(cached) = self.hash_cache.get(name) {
            return cached.clone();
        }
        let mut hasher = Ripemd160::new();
        hasher.update(name.as_bytes());
        let hashed = format!("{:x}", hasher.finalize());
        self.hash_cache.insert(name.to_string(), hashed.clone());
        hashed
    }
}

/// Columns of the main event table that are default-filled at push time.
const ROW_STRING_DEFAULTS: &[&str] = &[
    "agent",
    "answer",
    "answer_identifier",
    "answer_fk",
    "anon_screen_name",
    "book_interaction_type",
    "correctness",
    "correctMap_fk",
    "course_display_name",
    "course_id",
    "event_source",
    "event_type",
    "goto_from",
    "goto_dest",
    "ip_country",
    "page",
    "problem_id",
    "question_location",
    "resource_display_name",
    "sequence_id",
    "session",
    "state_fk",
    "success",
    "time",
    "transcript_code",
    "transcript_id",
    "video_code",
    "video_id",
];

/// Row builder for one input line. The `current` field map is filled
/// incrementally by the common-field extractor and the matching handler;
/// each `push_event` finalizes one immutable output row. All rows pushed
/// for the same line share `event_id`; each gets its own `_id`.
pub struct EventContext<'a> {
    pub state: &'a mut TranslateState,
    pub rows: RowSet,
    pub current: Map<String, Value>,
    pub event_id: String,
    /// Course ID side-channel consumed by answer-row generation.
    pub course_id: String,
    pub source_file: &'a str,
    pub line_no: u64,
    /// Set when the downtime tracker tagged this line; heartbeats are
    /// only kept when this is true.
    pub downtime_tagged: bool,
}

impl<'a> EventContext<'a> {
    pub fn new(state: &'a mut TranslateState, source_file: &'a str, line_no: u64) -> Self {
        Self {
            state,
            rows: RowSet::default(),
            current: Map::new(),
            event_id: unique_key(),
            course_id: String::new(),
            source_file,
            line_no,
            downtime_tagged: false,
        }
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.current.insert(column.to_string(), value);
    }

    pub fn set_str(&mut self, column: &str, value: impl Into<String>) {
        self.current
            .insert(column.to_string(), Value::String(value.into()));
    }

    pub fn get_str(&self, column: &str) -> String {
        match self.current.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Source citation used in warnings, e.g. `tracking.log line 17`.
    pub fn citation(&self) -> String {
        format!("{} line {}", self.source_file, self.line_no)
    }

    /// Finalize the current field map into one output row. Unset columns
    /// are default-filled (empty string, `attempts` -1). The map itself is
    /// left intact so shared fields carry into any follow-up row.
    pub fn push_event(&mut self) {
        for column in ROW_STRING_DEFAULTS {
            self.current
                .entry(column.to_string())
                .or_insert_with(|| Value::String(String::new()));
        }
        self.current.entry("attempts".to_string()).or_insert(json!(-1));
        self.current
            .entry("_id".to_string())
            .or_insert_with(|| Value::String(unique_key()));
        self.current
            .entry("event_id".to_string())
            .or_insert_with(|| Value::String(self.event_id.clone()));
        self.rows
            .event_rows
            .push(Value::Object(self.current.clone()));
        self.state.counters.rows_emitted += 1;
    }

    /// Assign a fresh primary key for the next row of a fan-out; the
    /// shared `event_id` is retained.
    pub fn next_row_id(&mut self) {
        self.current
            .insert("_id".to_string(), Value::String(unique_key()));
    }

    pub fn discard(&mut self) {
        self.current.clear();
    }

    /// End-of-line push: emit the row under construction unless a handler
    /// already fanned out (and cleared) or suppressed it.
    pub fn finalize(&mut self) {
        if !self.current.is_empty() {
            self.push_event();
        }
    }

    pub fn error_row(&mut self, kind: &str, text: &str, raw: &str) {
        self.rows.error_rows.push(json!({
            "error_kind": kind,
            "error_text": text,
            "raw_fragment": truncate_chars(raw, RAW_FRAGMENT_LIMIT),
            "source_file": self.source_file,
            "source_line_no": self.line_no,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_keys_are_identifier_safe_and_distinct() {
        let a = unique_key();
        let b = unique_key();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn actor_hash_is_stable_and_forty_hex_chars() {
        let mut state = TranslateState::new(360);
        let first = state.actor_hash("alice");
        let second = state.actor_hash("alice");
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, state.actor_hash("bob"));
    }

    #[test]
    fn push_event_default_fills_unset_columns() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        ctx.set_str("event_type", "play_video");
        ctx.push_event();

        let row = &ctx.rows.event_rows[0];
        assert_eq!(row["event_type"], "play_video");
        assert_eq!(row["answer"], "");
        assert_eq!(row["attempts"], -1);
        assert!(row["_id"].as_str().is_some_and(|s| !s.is_empty()));
        assert_eq!(row["event_id"].as_str(), Some(ctx.event_id.as_str()));
    }

    #[test]
    fn fanout_rows_share_event_id_with_distinct_primary_keys() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        ctx.set_str("_id", unique_key());
        ctx.push_event();
        ctx.next_row_id();
        ctx.push_event();

        let rows = &ctx.rows.event_rows;
        assert_eq!(rows[0]["event_id"], rows[1]["event_id"]);
        assert_ne!(rows[0]["_id"], rows[1]["_id"]);
    }

    #[test]
    fn finalize_skips_cleared_context() {
        let mut state = TranslateState::new(360);
        let mut ctx = EventContext::new(&mut state, "test.log", 1);
        ctx.set_str("event_type", "problem_check");
        ctx.discard();
        ctx.finalize();
        assert!(ctx.rows.event_rows.is_empty());
    }
}
