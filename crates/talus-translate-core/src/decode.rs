use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Backslash followed by anything other than `/` or `"`: the usual
/// corruption left behind by double-escaping log pipelines.
fn bad_backslash_re() -> &'static Regex {
    static BAD_BACKSLASH_RE: OnceLock<Regex> = OnceLock::new();
    BAD_BACKSLASH_RE.get_or_init(|| Regex::new(r#"\\([^/"])"#).expect("valid backslash regex"))
}

fn salvage_field_re(field: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| {
        Regex::new(&format!(r#"\b{field}\b[^:]*:[^"']*["']([^"']*)"#))
            .expect("valid salvage regex")
    })
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("username", &RE)
}

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("session", &RE)
}

fn event_source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("event_source", &RE)
}

fn event_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("event_type", &RE)
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("time", &RE)
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    salvage_field_re("ip", &RE)
}

fn event_re() -> &'static Regex {
    static EVENT_RE: OnceLock<Regex> = OnceLock::new();
    EVENT_RE.get_or_init(|| {
        Regex::new(r#"["']event["'][^:]*:(.*)"#).expect("valid event salvage regex")
    })
}

/// Fields pulled verbatim out of a line that would not parse as JSON even
/// after backslash repair. Worst case every field is empty and only `raw`
/// is populated.
#[derive(Debug, Clone, Default)]
pub struct Salvage {
    pub username: String,
    pub session: String,
    pub event_source: String,
    pub event_type: String,
    pub time: String,
    pub ip: String,
    pub event: String,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub enum Decoded {
    Parsed(Value),
    Salvaged(Salvage),
}

/// Escape every backslash not immediately followed by `/` or `"` with a
/// second backslash, so the string has a chance of parsing as JSON.
pub fn repair_backslashes(line: &str) -> String {
    bad_backslash_re().replace_all(line, r"\\$1").into_owned()
}

fn capture(re: &Regex, line: &str) -> String {
    re.captures(line)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn salvage(line: &str) -> Salvage {
    Salvage {
        username: capture(username_re(), line),
        session: capture(session_re(), line),
        event_source: capture(event_source_re(), line),
        event_type: capture(event_type_re(), line),
        time: capture(time_re(), line),
        ip: capture(ip_re(), line),
        event: capture(event_re(), line),
        raw: line.to_string(),
    }
}

/// Total decode: strict parse, then backslash-repaired parse, then regex
/// salvage. Never fails; the worst input still yields a salvage record.
pub fn decode(line: &str) -> Decoded {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
        return Decoded::Parsed(Value::Object(obj));
    }

    let repaired = repair_backslashes(line);
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&repaired) {
        return Decoded::Parsed(Value::Object(obj));
    }

    Decoded::Salvaged(salvage(line))
}
