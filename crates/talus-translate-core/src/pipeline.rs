use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use talus_config::AppConfig;
use tracing::{info, warn};

use crate::classify::{classify, is_heartbeat, is_ping, Classification};
use crate::common::{handle_common_fields, make_insert_safe, CommonOutcome};
use crate::decode::{decode, Decoded, Salvage};
use crate::handlers::dispatch_event;
use crate::model::{Counters, EventContext, RowSet, TranslateState};
use crate::sink::{emit, RelationalSink};

/// Build a degraded row out of whatever the salvage pass recovered. The
/// original line lands in `badly_formatted` for manual inspection.
fn rescue_bad_json(ctx: &mut EventContext, salvaged: &Salvage) {
    ctx.set_str("event_type", salvaged.event_type.clone());
    ctx.set_str("event_source", salvaged.event_source.clone());
    ctx.set_str("session", salvaged.session.clone());
    ctx.set_str("time", salvaged.time.clone());

    if !salvaged.username.is_empty() {
        let hashed = ctx.state.actor_hash(&salvaged.username);
        ctx.set_str("anon_screen_name", hashed);
    }

    let ip = if salvaged.ip.is_empty() {
        "127.0.0.1"
    } else {
        salvaged.ip.as_str()
    };
    let country = ctx.state.ip_countries.get(ip).cloned().unwrap_or_default();
    ctx.set_str("ip_country", country);

    let fragment = if salvaged.event.is_empty() {
        &salvaged.raw
    } else {
        &salvaged.event
    };
    ctx.set_str("badly_formatted", make_insert_safe(fragment));
    ctx.push_event();
    ctx.discard();

    ctx.error_row(
        "decode_failure",
        "line did not parse as JSON; fields salvaged by pattern match",
        &salvaged.raw,
    );
    ctx.state.counters.degraded_lines += 1;
}

/// Translate one input line into its row set. Total: every line yields
/// rows, a degraded row, an error row, or a deliberate suppression, and
/// nothing here can fail the run.
pub fn translate_line(
    state: &mut TranslateState,
    source_file: &str,
    line_no: u64,
    line: &str,
) -> RowSet {
    let mut ctx = EventContext::new(state, source_file, line_no);

    let record = match decode(line) {
        Decoded::Parsed(record) => record,
        Decoded::Salvaged(salvaged) => {
            warn!(
                "Track log {}: JSON decode failed; salvaging what pattern matching can find",
                ctx.citation()
            );
            rescue_bad_json(&mut ctx, &salvaged);
            return ctx.rows;
        }
    };

    let kind = match classify(&record) {
        Classification::Kind(kind) => kind,
        Classification::MissingEventType => {
            warn!(
                "Track log {}: record carries neither event_type nor event.name; dropped",
                ctx.citation()
            );
            ctx.error_row(
                "missing_event_type",
                "record carries neither event_type nor event.name",
                line,
            );
            ctx.state.counters.dropped_lines += 1;
            return ctx.rows;
        }
    };

    // The downtime tracker must see every valid event, pings and
    // heartbeats included, so common fields always run first.
    let outcome = handle_common_fields(&mut ctx, &record, &kind);

    // A bare `/` ping carries nothing worth a row.
    if is_ping(&kind) {
        ctx.state.counters.suppressed_lines += 1;
        ctx.rows = RowSet::default();
        return ctx.rows;
    }

    if is_heartbeat(&kind) {
        // The heartbeat row itself is only worth keeping when it marks a
        // gap; its IP side row stays either way.
        if ctx.downtime_tagged {
            ctx.finalize();
        } else {
            ctx.state.counters.suppressed_lines += 1;
            ctx.discard();
        }
        return ctx.rows;
    }

    if outcome == CommonOutcome::Continue {
        dispatch_event(&mut ctx, &record, &kind);
    }
    ctx.finalize();
    ctx.rows
}

/// Stream a track log line by line into the sink. Lines are decoded
/// lossily so invalid UTF-8 cannot abort the run; each line is translated
/// in isolation.
pub fn process_reader<R: BufRead>(
    state: &mut TranslateState,
    source_file: &str,
    reader: &mut R,
    sink: &mut dyn RelationalSink,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut line_no = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("reading {source_file} line {}", line_no + 1))?;
        if n == 0 {
            break;
        }
        line_no += 1;
        state.counters.lines_read += 1;

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }

        let rows = translate_line(state, source_file, line_no, line);
        emit(&rows, sink)?;
    }
    Ok(())
}

fn load_string_map(path: &str) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading lookup file {path}"))?;
    let map: HashMap<String, String> = serde_json::from_str(&text)
        .with_context(|| format!("parsing lookup file {path}"))?;
    Ok(map)
}

/// Run a full translation per the loaded config and report the counters.
pub fn run_translator(config: &AppConfig, sink: &mut dyn RelationalSink) -> Result<Counters> {
    let mut state = TranslateState::new(config.translate.heartbeat_threshold_seconds as i64);

    if !config.translate.ip_country_file.is_empty() {
        state.ip_countries = load_string_map(&config.translate.ip_country_file)?;
        info!(entries = state.ip_countries.len(), "loaded IP-country map");
    }
    if !config.translate.module_names_file.is_empty() {
        state.module_names = load_string_map(&config.translate.module_names_file)?;
        info!(entries = state.module_names.len(), "loaded module-name map");
    }

    let log_file = &config.input.log_file;
    let file = File::open(log_file).with_context(|| format!("opening track log {log_file}"))?;
    let mut reader = BufReader::new(file);
    let source_file = Path::new(log_file)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| log_file.clone());

    process_reader(&mut state, &source_file, &mut reader, sink)?;
    sink.flush().context("flushing sink")?;

    let counters = state.counters;
    info!(
        lines_read = counters.lines_read,
        rows_emitted = counters.rows_emitted,
        degraded_lines = counters.degraded_lines,
        dropped_lines = counters.dropped_lines,
        suppressed_lines = counters.suppressed_lines,
        bad_timestamps = counters.bad_timestamps,
        "translation complete"
    );
    Ok(counters)
}
