//! Blocking CSV side of an import. Runs on `spawn_blocking` threads.

use std::io::Read;

use tokio::sync::mpsc;

use shelfsync_catalog::{HeaderMap, ProductRow, RowError};

use super::ImportError;
use crate::jobs::SkippedRow;

/// One data row after normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRow {
    Valid(ProductRow),
    Skipped(SkippedRow),
}

/// A bounded batch of rows in file order.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub rows: Vec<ParsedRow>,
    /// Data rows seen from the start of the file through this chunk.
    pub rows_seen: u64,
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
}

fn csv_error(err: csv::Error) -> ImportError {
    let line = err.position().map(|p| p.line());
    match err.into_kind() {
        csv::ErrorKind::Io(e) => ImportError::Read(e.to_string()),
        other => ImportError::Malformed {
            line,
            message: format!("{other:?}"),
        },
    }
}

/// Validate the header, then count data rows. Blank lines are not rows.
///
/// A header problem is returned before any row is read, so a file that can
/// never import gets no row total.
pub fn count_data_rows<R: Read>(reader: R) -> Result<u64, ImportError> {
    let mut rdr = csv_reader(reader);
    resolve_header(&mut rdr)?;
    let mut record = csv::ByteRecord::new();
    let mut rows = 0u64;
    while rdr.read_byte_record(&mut record).map_err(csv_error)? {
        rows += 1;
    }
    Ok(rows)
}

fn resolve_header<R: Read>(rdr: &mut csv::Reader<R>) -> Result<HeaderMap, ImportError> {
    let mut record = csv::ByteRecord::new();
    if !rdr.read_byte_record(&mut record).map_err(csv_error)? {
        return Err(shelfsync_catalog::HeaderError::Empty.into());
    }
    let names: Vec<String> = record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect();
    Ok(HeaderMap::resolve(names)?)
}

fn parse_record(header: &HeaderMap, record: &csv::ByteRecord, line: u64) -> ParsedRow {
    let cells: Result<Vec<&str>, _> = record.iter().map(std::str::from_utf8).collect();
    let skipped = |sku: Option<&str>, err: RowError| {
        ParsedRow::Skipped(SkippedRow {
            line,
            sku: sku.map(str::to_string),
            reason: err.to_string(),
        })
    };

    match cells {
        Ok(cells) => match header.parse_row(&cells) {
            Ok(row) => ParsedRow::Valid(row),
            Err(err) => skipped(header.raw_sku(&cells), err),
        },
        Err(_) => skipped(None, RowError::InvalidEncoding),
    }
}

/// Parse `reader` and hand chunks of at most `chunk_size` rows to `tx`.
///
/// Header problems and unreadable input are sent as a final `Err`. Returns
/// early when the receiver goes away.
pub fn stream_chunks<R: Read>(reader: R, chunk_size: usize, tx: mpsc::Sender<Result<Chunk, ImportError>>) {
    let chunk_size = chunk_size.max(1);
    let mut rdr = csv_reader(reader);

    let header = match resolve_header(&mut rdr) {
        Ok(header) => header,
        Err(e) => {
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };

    let mut record = csv::ByteRecord::new();
    let mut chunk = Chunk::default();
    let mut seen = 0u64;

    loop {
        match rdr.read_byte_record(&mut record) {
            Ok(true) => {
                seen += 1;
                let line = record.position().map(|p| p.line()).unwrap_or(seen + 1);
                chunk.rows.push(parse_record(&header, &record, line));
                if chunk.rows.len() >= chunk_size {
                    chunk.rows_seen = seen;
                    let full = std::mem::replace(&mut chunk, Chunk::default());
                    if tx.blocking_send(Ok(full)).is_err() {
                        return;
                    }
                }
            }
            Ok(false) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(csv_error(e)));
                return;
            }
        }
    }

    if !chunk.rows.is_empty() {
        chunk.rows_seen = seen;
        let _ = tx.blocking_send(Ok(chunk));
    }
}
