//! File-backed relational sink: one newline-delimited JSON row file per
//! destination table, suitable for bulk loading.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use talus_translate_core::sink::TABLES;
use talus_translate_core::RelationalSink;

/// Writes each appended row as one JSON line to `<dir>/<table>.jsonl`.
/// Files are created on first append, so tables that receive no rows
/// leave nothing behind.
pub struct JsonlSink {
    dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
    rows_written: u64,
    flush_every_rows: usize,
    pending: usize,
}

impl JsonlSink {
    pub fn create(dir: impl AsRef<Path>, flush_every_rows: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        info!(dir = %dir.display(), "writing row files");
        Ok(Self {
            dir,
            writers: HashMap::new(),
            rows_written: 0,
            flush_every_rows: flush_every_rows.max(1),
            pending: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn writer_for(&mut self, table: &str) -> Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(table) {
            let path = self.dir.join(format!("{table}.jsonl"));
            let file = File::create(&path)
                .with_context(|| format!("creating row file {}", path.display()))?;
            debug!(table, path = %path.display(), "opened row file");
            self.writers.insert(table.to_string(), BufWriter::new(file));
        }
        Ok(self
            .writers
            .get_mut(table)
            .expect("writer inserted above"))
    }

    fn flush_all(&mut self) -> Result<()> {
        for (table, writer) in &mut self.writers {
            writer
                .flush()
                .with_context(|| format!("flushing row file for table {table}"))?;
        }
        self.pending = 0;
        Ok(())
    }
}

impl RelationalSink for JsonlSink {
    fn append(&mut self, table: &str, row: &Value) -> Result<()> {
        if !TABLES.contains(&table) {
            bail!("unknown destination table '{table}'");
        }
        let writer = self.writer_for(table)?;
        serde_json::to_writer(&mut *writer, row)
            .with_context(|| format!("serializing row for table {table}"))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("writing row for table {table}"))?;
        self.rows_written += 1;
        self.pending += 1;
        if self.pending >= self.flush_every_rows {
            self.flush_all()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_all()
    }
}
