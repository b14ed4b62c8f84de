//! Translation core for edX track logs: decodes newline-delimited JSON
//! event lines (however mangled), classifies each event, and flattens it
//! into relational rows ready for a bulk load.

pub mod classify;
pub mod common;
pub mod decode;
pub mod downtime;
pub mod fanout;
pub mod handlers;
pub mod model;
pub mod pipeline;
pub mod sink;

pub use model::{Counters, RowSet, TranslateState};
pub use pipeline::{process_reader, run_translator, translate_line};
pub use sink::{MemorySink, RelationalSink, TABLES};
