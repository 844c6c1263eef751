//! Append-only CSV sink.
//!
//! One row per successful extraction. The header is written once when the
//! file is created; every append is flushed immediately so a crash never
//! loses a committed row. `existing_ids` scans a prior output file so a
//! restart can recover rows whose checkpoint mark was cut off.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Message;
use crate::error::SinkError;
use crate::extract::ExtractionResult;

const HEADERS: [&str; 7] = [
    "message_id",
    "date",
    "channel",
    "message_text",
    "analysis",
    "model",
    "extracted_at",
];

/// One output row. The structured fields ride along as embedded JSON in
/// the `analysis` column; consumers parse it separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRow {
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub channel: String,
    pub message_text: String,
    pub analysis: String,
    pub model: String,
    pub extracted_at: DateTime<Utc>,
}

impl SinkRow {
    /// Build a row from a message and its successful extraction.
    pub fn from_extraction(message: &Message, result: &ExtractionResult, model: &str) -> Self {
        Self {
            message_id: message.id,
            date: message.date,
            channel: message.channel.clone(),
            message_text: message.text.clone(),
            analysis: result
                .fields
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            model: model.to_string(),
            extracted_at: Utc::now(),
        }
    }
}

/// Durable tabular output, UTF-8 CSV.
pub struct CsvSink {
    writer: csv::Writer<std::fs::File>,
    path: PathBuf,
}

impl CsvSink {
    /// Open the sink for appending, creating it (with a header row) if it
    /// does not exist yet.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let needs_header = !path.exists() || std::fs::metadata(path)?.len() == 0;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            writer.write_record(HEADERS)?;
            writer.flush()?;
            debug!(path = %path.display(), "Created output file");
        }

        Ok(Self {
            writer,
            path: path.to_path_buf(),
        })
    }

    /// Append one row and flush it to disk.
    pub fn append(&mut self, row: &SinkRow) -> Result<(), SinkError> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids of rows already present in an output file.
    ///
    /// Unreadable records (e.g. a final row torn by a crash mid-append) are
    /// skipped: the ids that did commit are what matters for dedup.
    pub fn existing_ids(path: &Path) -> Result<HashSet<i64>, SinkError> {
        let mut ids = HashSet::new();
        if !path.exists() {
            return Ok(ids);
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let Some(id_column) = reader.headers()?.iter().position(|h| h == "message_id") else {
            return Ok(ids);
        };

        for record in reader.records() {
            let Ok(record) = record else {
                debug!(path = %path.display(), "Skipping unreadable sink record");
                continue;
            };
            if let Some(id) = record.get(id_column).and_then(|s| s.parse().ok()) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}
