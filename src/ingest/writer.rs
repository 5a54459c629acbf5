//! Batch writer: maps file columns onto the table and writes one chunk per statement.

use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;

use super::normalize::{is_date_like_column, normalize};
use super::record::{RawValue, RowRecord};
use super::resolver::DuplicateMode;
use crate::error::{Result, TabloadError};
use crate::store::{ColumnDescriptor, ConflictAction, RelationalStore};

/// Mapping from the uploaded file's headers to target table columns
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    /// Table column names, in file order
    columns: Arc<[String]>,
    /// Header position feeding each column
    source_indices: Vec<usize>,
    date_like: Vec<bool>,
    /// Headers with no matching table column
    dropped: Vec<String>,
}

impl ColumnPlan {
    /// Match headers to columns case-insensitively. The first header wins when two map
    /// to the same column.
    pub fn build(headers: &[String], table_columns: &[ColumnDescriptor]) -> Result<Self> {
        let mut columns = Vec::new();
        let mut source_indices = Vec::new();
        let mut date_like = Vec::new();
        let mut dropped = Vec::new();

        for (idx, header) in headers.iter().enumerate() {
            let matched = table_columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(header.trim()));
            match matched {
                Some(column) if !columns.contains(&column.name) => {
                    columns.push(column.name.clone());
                    source_indices.push(idx);
                    date_like.push(is_date_like_column(column));
                }
                _ => dropped.push(header.clone()),
            }
        }

        if columns.is_empty() {
            return Err(TabloadError::InvalidInput(format!(
                "none of the file's columns ({}) exist in the target table",
                headers.join(", ")
            )));
        }

        Ok(Self {
            columns: columns.into(),
            source_indices,
            date_like,
            dropped,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    /// Table column matching `name` case-insensitively
    pub fn find_column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name.trim()))
            .map(|c| c.as_str())
    }

    /// Re-key a decoded row to table columns and normalize its date-like values
    pub fn prepare(&self, row: &RowRecord) -> RowRecord {
        let values = self
            .source_indices
            .iter()
            .zip(self.date_like.iter())
            .map(|(&idx, &date_like)| {
                let raw = row.value_at(idx).unwrap_or(&RawValue::Null);
                normalize(raw, date_like)
            })
            .collect();
        RowRecord::new(Arc::clone(&self.columns), values)
    }
}

/// Per-chunk outcome of a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.skipped
    }
}

impl AddAssign for WriteCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Invert a conflict-aware affected count into `(inserted, updated)`.
///
/// The store counts a fresh row once and an overwritten row twice, so for a
/// batch of `rows` rows `affected = inserted + 2 * updated`. When fewer rows
/// are reported than were sent, the unreported rows matched an existing row
/// without changing it and are counted as updates.
///
/// Always `inserted + updated == rows`.
pub fn split_affected_rows(rows: u64, affected: u64) -> (u64, u64) {
    if affected >= rows {
        let updated = (affected - rows).min(rows);
        (rows - updated, updated)
    } else {
        (affected, rows - affected)
    }
}

/// Writes prepared chunks into one table
pub struct BatchWriter<'a> {
    store: &'a dyn RelationalStore,
    table: &'a str,
    plan: &'a ColumnPlan,
    key_columns: Vec<String>,
}

impl<'a> BatchWriter<'a> {
    /// `key_columns` are left untouched by upserts
    pub fn new(
        store: &'a dyn RelationalStore,
        table: &'a str,
        plan: &'a ColumnPlan,
        key_columns: Vec<String>,
    ) -> Self {
        Self {
            store,
            table,
            plan,
            key_columns,
        }
    }

    /// Write `rows` in one statement. A store failure comes back as `BatchWrite`.
    pub async fn write(&self, rows: Vec<RowRecord>, mode: DuplicateMode) -> Result<WriteCounts> {
        let row_count = rows.len() as u64;
        if row_count == 0 {
            return Ok(WriteCounts::default());
        }

        let conflict = match mode {
            DuplicateMode::Update => ConflictAction::Update {
                key_columns: self.key_columns.clone(),
            },
            DuplicateMode::Skip | DuplicateMode::Error => ConflictAction::Ignore,
        };

        let values: Vec<Vec<RawValue>> = rows.into_iter().map(RowRecord::into_values).collect();
        let affected = self
            .store
            .execute_batch_insert(self.table, self.plan.columns(), values, conflict)
            .await
            .map_err(|e| TabloadError::BatchWrite(e.to_string()))?;

        let counts = match mode {
            DuplicateMode::Update => {
                let (inserted, updated) = split_affected_rows(row_count, affected);
                WriteCounts {
                    inserted,
                    updated,
                    skipped: 0,
                }
            }
            DuplicateMode::Skip | DuplicateMode::Error => {
                let inserted = affected.min(row_count);
                let ignored = row_count - inserted;
                if ignored > 0 {
                    log::warn!(
                        "{} row(s) ignored by a uniqueness constraint on {}",
                        ignored,
                        self.table
                    );
                }
                WriteCounts {
                    inserted,
                    updated: 0,
                    skipped: ignored,
                }
            }
        };
        Ok(counts)
    }
}
