use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::RowSet;

pub const EVENTS_TABLE: &str = "events";
pub const ANSWERS_TABLE: &str = "answers";
pub const CORRECT_MAPS_TABLE: &str = "correct_maps";
pub const STATES_TABLE: &str = "states";
pub const INPUT_STATES_TABLE: &str = "input_states";
pub const ACCOUNTS_TABLE: &str = "accounts";
pub const AB_EXPERIMENTS_TABLE: &str = "ab_experiments";
pub const EVENT_IPS_TABLE: &str = "event_ips";
pub const LOAD_ERRORS_TABLE: &str = "load_errors";

/// Every destination table, in load order.
pub const TABLES: &[&str] = &[
    EVENTS_TABLE,
    ANSWERS_TABLE,
    CORRECT_MAPS_TABLE,
    STATES_TABLE,
    INPUT_STATES_TABLE,
    ACCOUNTS_TABLE,
    AB_EXPERIMENTS_TABLE,
    EVENT_IPS_TABLE,
    LOAD_ERRORS_TABLE,
];

/// Destination for translated rows. Implementations decide the physical
/// format; the pipeline only promises `append` calls with a table name
/// from [`TABLES`] and a final `flush`.
pub trait RelationalSink {
    fn append(&mut self, table: &str, row: &Value) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Drain a line's row set into the sink, auxiliary tables first so foreign
/// keys land before the rows referencing them.
pub fn emit(rows: &RowSet, sink: &mut dyn RelationalSink) -> Result<()> {
    let groups: [(&str, &Vec<Value>); 9] = [
        (ANSWERS_TABLE, &rows.answer_rows),
        (CORRECT_MAPS_TABLE, &rows.correct_map_rows),
        (INPUT_STATES_TABLE, &rows.input_state_rows),
        (STATES_TABLE, &rows.state_rows),
        (EVENTS_TABLE, &rows.event_rows),
        (ACCOUNTS_TABLE, &rows.account_rows),
        (AB_EXPERIMENTS_TABLE, &rows.ab_experiment_rows),
        (EVENT_IPS_TABLE, &rows.event_ip_rows),
        (LOAD_ERRORS_TABLE, &rows.error_rows),
    ];
    for (table, group) in groups {
        for row in group {
            sink.append(table, row)?;
        }
    }
    Ok(())
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: HashMap<String, Vec<Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> &[Value] {
        self.rows.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl RelationalSink for MemorySink {
    fn append(&mut self, table: &str, row: &Value) -> Result<()> {
        self.rows
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
