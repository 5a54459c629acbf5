//! Duplicate resolution against rows already present in the target table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::record::{RawValue, RowRecord};
use crate::error::{Result, TabloadError};
use crate::store::{quote_ident, RelationalStore};

/// Separator between identity field fragments in a composite key
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Keep each lookup below the store's bound-parameter limit
const MAX_LOOKUP_PARAMS: usize = 30_000;

/// What to do with a row whose identity already exists downstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMode {
    #[default]
    Skip,
    Update,
    Error,
}

impl fmt::Display for DuplicateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateMode::Skip => write!(f, "skip"),
            DuplicateMode::Update => write!(f, "update"),
            DuplicateMode::Error => write!(f, "error"),
        }
    }
}

impl FromStr for DuplicateMode {
    type Err = TabloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(DuplicateMode::Skip),
            "update" => Ok(DuplicateMode::Update),
            "error" => Ok(DuplicateMode::Error),
            other => Err(TabloadError::InvalidInput(format!(
                "unknown duplicate mode '{}' (expected skip, update or error)",
                other
            ))),
        }
    }
}

/// Duplicate handling for one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    #[serde(default)]
    pub mode: DuplicateMode,
    /// Empty means the table's primary key
    #[serde(default)]
    pub identity_fields: Vec<String>,
}

/// Rows of one chunk that should reach the writer
#[derive(Debug)]
pub struct Resolution {
    pub rows_to_write: Vec<RowRecord>,
    pub skipped: usize,
}

/// Composite identity key of a row
pub fn composite_key<'a>(values: impl IntoIterator<Item = &'a RawValue>) -> String {
    let mut key = String::new();
    for (idx, value) in values.into_iter().enumerate() {
        if idx > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&value.key_fragment());
    }
    key
}

fn row_key(row: &RowRecord, identity_fields: &[String]) -> String {
    composite_key(
        identity_fields
            .iter()
            .map(|f| row.get(f).unwrap_or(&RawValue::Null)),
    )
}

/// Composite keys of the rows in `table` matching any identity value of `rows`
pub async fn existing_keys(
    store: &dyn RelationalStore,
    table: &str,
    identity_fields: &[String],
    rows: &[RowRecord],
) -> Result<HashSet<String>> {
    let mut keys = HashSet::new();
    if identity_fields.is_empty() || rows.is_empty() {
        return Ok(keys);
    }

    let rows_per_lookup = (MAX_LOOKUP_PARAMS / identity_fields.len()).max(1);
    for group in rows.chunks(rows_per_lookup) {
        let Some((sql, params)) = build_lookup(table, identity_fields, group) else {
            continue;
        };
        for found in store.query(&sql, params).await? {
            keys.insert(composite_key(found.iter()));
        }
    }
    Ok(keys)
}

/// `SELECT f1..fn FROM t WHERE f1 IN (..) OR .. OR fn IN (..)` with de-duplicated values
fn build_lookup(table: &str, identity_fields: &[String], rows: &[RowRecord]) -> Option<(String, Vec<RawValue>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for field in identity_fields {
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for row in rows {
            if let Some(value) = row.get(field) {
                if !value.is_blank() && seen.insert(value.key_fragment()) {
                    values.push(value.clone());
                }
            }
        }
        if values.is_empty() {
            continue;
        }
        clauses.push(format!(
            "{} IN ({})",
            quote_ident(field),
            vec!["?"; values.len()].join(", ")
        ));
        params.extend(values);
    }

    if clauses.is_empty() {
        return None;
    }

    let select_list = identity_fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list,
        quote_ident(table),
        clauses.join(" OR ")
    );
    Some((sql, params))
}

/// Number of `rows` whose identity already exists downstream
pub async fn count_conflicts(
    store: &dyn RelationalStore,
    table: &str,
    identity_fields: &[String],
    rows: &[RowRecord],
) -> Result<usize> {
    if identity_fields.is_empty() {
        return Ok(0);
    }
    let existing = existing_keys(store, table, identity_fields, rows).await?;
    Ok(rows
        .iter()
        .filter(|row| existing.contains(&row_key(row, identity_fields)))
        .count())
}

/// Apply `mode` to one chunk of projected rows
pub async fn resolve(
    store: &dyn RelationalStore,
    table: &str,
    rows: Vec<RowRecord>,
    identity_fields: &[String],
    mode: DuplicateMode,
) -> Result<Resolution> {
    if identity_fields.is_empty() || mode == DuplicateMode::Update {
        return Ok(Resolution {
            rows_to_write: rows,
            skipped: 0,
        });
    }

    let existing = existing_keys(store, table, identity_fields, &rows).await?;

    match mode {
        DuplicateMode::Error => {
            let conflicts = rows
                .iter()
                .filter(|row| existing.contains(&row_key(row, identity_fields)))
                .count();
            if conflicts > 0 {
                return Err(TabloadError::ConflictPolicy { conflicts });
            }
            Ok(Resolution {
                rows_to_write: rows,
                skipped: 0,
            })
        }
        _ => {
            let before = rows.len();
            let rows_to_write: Vec<RowRecord> = rows
                .into_iter()
                .filter(|row| !existing.contains(&row_key(row, identity_fields)))
                .collect();
            Ok(Resolution {
                skipped: before - rows_to_write.len(),
                rows_to_write,
            })
        }
    }
}
