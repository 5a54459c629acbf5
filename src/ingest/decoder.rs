//! Tabular decoder: delimited text and spreadsheet containers into `RowRecord`s.
//!
//! Delimited text is streamed record by record. Spreadsheets are read with
//! calamine, which materializes the whole first sheet before the first row is
//! yielded. Either way the returned `RowSource` is consumed once; a retry needs
//! a fresh `decode` call.

use calamine::{open_workbook_auto, Data, Reader};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::record::{RawValue, RowRecord};
use crate::error::DecodeError;

/// Delimiters considered by auto-detection, in tie-break order
const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Container family of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Delimited,
    Spreadsheet,
}

impl FormatHint {
    /// Pick a format from the MIME hint, falling back to the file extension
    pub fn detect(path: &Path, mime_hint: Option<&str>) -> Option<FormatHint> {
        if let Some(mime) = mime_hint.map(|m| m.to_ascii_lowercase()) {
            if mime.contains("spreadsheet") || mime.contains("excel") || mime.contains("opendocument") {
                return Some(FormatHint::Spreadsheet);
            }
            if mime.starts_with("text/csv")
                || mime.starts_with("text/tab-separated-values")
                || mime.starts_with("application/csv")
            {
                return Some(FormatHint::Delimited);
            }
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "csv" | "tsv" | "txt" => Some(FormatHint::Delimited),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(FormatHint::Spreadsheet),
            _ => None,
        }
    }
}

/// Finite, single-pass sequence of decoded rows
pub struct RowSource {
    headers: Arc<[String]>,
    inner: RowSourceInner,
}

enum RowSourceInner {
    Delimited {
        path: PathBuf,
        records: csv::StringRecordsIntoIter<File>,
    },
    Materialized(std::vec::IntoIter<RowRecord>),
}

impl RowSource {
    pub fn headers(&self) -> &Arc<[String]> {
        &self.headers
    }
}

impl Iterator for RowSource {
    type Item = Result<RowRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            RowSourceInner::Materialized(rows) => rows.next().map(Ok),
            RowSourceInner::Delimited { path, records } => loop {
                let record = match records.next()? {
                    Ok(record) => record,
                    Err(e) => return Some(Err(DecodeError::parse(path.clone(), e))),
                };
                let values = record.iter().map(|field| RawValue::Text(field.to_string())).collect();
                let row = RowRecord::new(Arc::clone(&self.headers), values);
                if row.is_blank() {
                    continue;
                }
                return Some(Ok(row));
            },
        }
    }
}

/// Open `path` and return its rows
pub fn decode(path: &Path, hint: FormatHint) -> Result<RowSource, DecodeError> {
    match hint {
        FormatHint::Delimited => decode_delimited(path),
        FormatHint::Spreadsheet => decode_spreadsheet(path),
    }
}

/// Most frequent candidate delimiter in the header line; comma when none occur
pub fn detect_delimiter(first_line: &str) -> u8 {
    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in CANDIDATE_DELIMITERS {
        let count = first_line.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Trim BOMs and whitespace; blank headers get positional names
fn normalize_headers<'a>(raw: impl Iterator<Item = &'a str>) -> Arc<[String]> {
    raw.enumerate()
        .map(|(idx, header)| {
            let cleaned = header.trim_start_matches('\u{feff}').trim();
            if cleaned.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                cleaned.to_string()
            }
        })
        .collect::<Vec<_>>()
        .into()
}

fn decode_delimited(path: &Path) -> Result<RowSource, DecodeError> {
    let file = File::open(path).map_err(|e| DecodeError::open(path, e))?;
    let mut first_line = String::new();
    BufReader::new(file)
        .read_line(&mut first_line)
        .map_err(|e| DecodeError::parse(path, e))?;

    if first_line.trim_start_matches('\u{feff}').trim().is_empty() {
        return Err(DecodeError::parse(path, "file is empty or has no header row"));
    }

    let delimiter = detect_delimiter(&first_line);
    log::debug!(
        "Detected delimiter {:?} for {}",
        delimiter as char,
        path.display()
    );

    let file = File::open(path).map_err(|e| DecodeError::open(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let headers = normalize_headers(
        reader
            .headers()
            .map_err(|e| DecodeError::parse(path, e))?
            .iter(),
    );

    Ok(RowSource {
        headers,
        inner: RowSourceInner::Delimited {
            path: path.to_path_buf(),
            records: reader.into_records(),
        },
    })
}

fn decode_spreadsheet(path: &Path) -> Result<RowSource, DecodeError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| DecodeError::open(path, e))?;

    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| DecodeError::parse(path, "workbook has no sheets"))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| DecodeError::parse(path, format!("sheet '{}': {}", first_sheet, e)))?;

    if range.is_empty() {
        return Err(DecodeError::parse(path, format!("sheet '{}' is empty", first_sheet)));
    }

    let mut rows_iter = range.rows();
    let header_cells = rows_iter
        .next()
        .ok_or_else(|| DecodeError::parse(path, format!("sheet '{}' has no header row", first_sheet)))?;
    let header_text: Vec<String> = header_cells.iter().map(cell_to_header).collect();
    let headers = normalize_headers(header_text.iter().map(|s| s.as_str()));

    let rows: Vec<RowRecord> = rows_iter
        .map(|cells| RowRecord::new(Arc::clone(&headers), cells.iter().map(cell_to_raw).collect()))
        .filter(|row| !row.is_blank())
        .collect();

    log::debug!(
        "Materialized {} row(s) from sheet '{}' of {}",
        rows.len(),
        first_sheet,
        path.display()
    );

    Ok(RowSource {
        headers,
        inner: RowSourceInner::Materialized(rows.into_iter()),
    })
}

fn cell_to_header(cell: &Data) -> String {
    match cell_to_raw(cell) {
        RawValue::Null => String::new(),
        other => other.key_fragment(),
    }
}

/// Map a spreadsheet cell to a raw value; date cells keep their serial number
pub fn cell_to_raw(cell: &Data) -> RawValue {
    match cell {
        Data::Empty | Data::Error(_) => RawValue::Null,
        Data::String(s) => RawValue::Text(s.clone()),
        Data::Int(i) => RawValue::Integer(*i),
        Data::Float(f) => RawValue::Float(*f),
        Data::Bool(b) => RawValue::Text(b.to_string()),
        Data::DateTime(dt) => RawValue::Float(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawValue::Text(s.clone()),
    }
}
