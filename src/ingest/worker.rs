//! Isolated decode unit: submit (path, format) and await the decoded table.
//!
//! Large files decode on a dedicated OS thread so that spreadsheet parsing never
//! stalls the runtime. The thread owns everything it touches and hands the
//! finished rows back over a oneshot channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::decoder::{decode, FormatHint, RowSource};
use super::record::RowRecord;
use crate::error::{DecodeError, Result, TabloadError};

/// Rows decoded between cooperative yields when decoding inline
const INLINE_YIELD_EVERY: usize = 1000;

/// Fully decoded contents of one source file
#[derive(Debug)]
pub struct DecodedTable {
    pub headers: Arc<[String]>,
    pub rows: Vec<RowRecord>,
}

impl DecodedTable {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Decode `path`, on a dedicated thread when `size_bytes` exceeds `threshold_bytes`
pub async fn decode_isolated(
    path: &Path,
    hint: FormatHint,
    size_bytes: u64,
    threshold_bytes: u64,
) -> Result<DecodedTable> {
    if size_bytes > threshold_bytes {
        decode_on_thread(path.to_path_buf(), hint).await
    } else {
        decode_inline(path, hint).await
    }
}

async fn decode_on_thread(path: PathBuf, hint: FormatHint) -> Result<DecodedTable> {
    let (tx, rx) = oneshot::channel::<std::result::Result<DecodedTable, DecodeError>>();
    let thread_path = path.clone();

    std::thread::Builder::new()
        .name("tabload-decode".to_string())
        .spawn(move || {
            let result = decode(&thread_path, hint).and_then(drain);
            // Receiver gone means the task was dropped; nothing left to report to.
            let _ = tx.send(result);
        })
        .map_err(TabloadError::Io)?;

    log::debug!("Decoding {} on a dedicated thread", path.display());

    match rx.await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DecodeError::parse(path, "decode thread exited without a result").into()),
    }
}

async fn decode_inline(path: &Path, hint: FormatHint) -> Result<DecodedTable> {
    let source = decode(path, hint)?;
    tokio::task::yield_now().await;

    let headers = Arc::clone(source.headers());
    let mut rows = Vec::new();
    for row in source {
        rows.push(row?);
        if rows.len() % INLINE_YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }
    Ok(DecodedTable { headers, rows })
}

fn drain(source: RowSource) -> std::result::Result<DecodedTable, DecodeError> {
    let headers = Arc::clone(source.headers());
    let rows = source.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(DecodedTable { headers, rows })
}
