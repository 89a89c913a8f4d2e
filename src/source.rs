//! Row sources: CSV files and readers, and JSON payloads.

use crate::errors::PipelineError;
use crate::normalizer::RawRow;
use serde_json::Value;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Chunks buffered ahead of the ingestor. Keeps memory bounded by
/// roughly `(CHANNEL_DEPTH + 1) * chunk_size` rows.
const CHANNEL_DEPTH: usize = 2;

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// Pair a record with the headers. Blank cells are left out, so a line
/// of empty cells becomes an empty row.
fn to_row(headers: &csv::StringRecord, record: &csv::StringRecord) -> RawRow {
    headers
        .iter()
        .zip(record.iter())
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect()
}

/// Read every row of a CSV document. Intended for bounded payloads such
/// as an uploaded body; use [`stream_csv_chunks`] for files.
pub fn read_csv_rows<R: Read>(reader: R) -> Result<Vec<RawRow>, PipelineError> {
    let mut rdr = csv_reader(reader);
    let headers = rdr.headers()?.clone();

    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(to_row(&headers, &record?));
    }
    Ok(rows)
}

/// Stream a CSV file as chunks of at most `chunk_size` rows. Parsing runs
/// on a blocking thread and stops early when the receiver is dropped. A
/// parse failure is delivered as the last item.
pub fn stream_csv_chunks(
    path: impl Into<PathBuf>,
    chunk_size: usize,
) -> mpsc::Receiver<Result<Vec<RawRow>, PipelineError>> {
    let path = path.into();
    let chunk_size = chunk_size.max(1);
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        if let Err(e) = read_chunks(&path, chunk_size, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });

    rx
}

fn read_chunks(
    path: &Path,
    chunk_size: usize,
    tx: &mpsc::Sender<Result<Vec<RawRow>, PipelineError>>,
) -> Result<(), PipelineError> {
    let file = File::open(path)?;
    let mut rdr = csv_reader(file);
    let headers = rdr.headers()?.clone();

    let mut chunk = Vec::with_capacity(chunk_size);
    for record in rdr.records() {
        chunk.push(to_row(&headers, &record?));
        if chunk.len() == chunk_size {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
            if tx.blocking_send(Ok(full)).is_err() {
                tracing::debug!(path = %path.display(), "Chunk receiver dropped, stopping read");
                return Ok(());
            }
        }
    }

    if !chunk.is_empty() {
        let _ = tx.blocking_send(Ok(chunk));
    }
    Ok(())
}

/// Accept either a bare array of objects or `{"records": [...]}`.
/// Non-object entries are kept as empty rows.
pub fn parse_json_rows(body: &[u8]) -> Result<Vec<RawRow>, PipelineError> {
    let value: Value = serde_json::from_slice(body)?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("records") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(PipelineError::BadRequest(
                    "expected an array of records or {\"records\": [...]}".to_string(),
                ))
            }
        },
        _ => {
            return Err(PipelineError::BadRequest(
                "expected an array of records".to_string(),
            ))
        }
    };

    Ok(items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => row,
            _ => RawRow::new(),
        })
        .collect())
}
