use async_trait::async_trait;
use rusqlite::{params_from_iter, TransactionBehavior};
use std::path::Path;

use super::{quote_ident, ColumnDescriptor, ConflictAction, KeyRole, RelationalStore};
use crate::db::Db;
use crate::error::{Result, TabloadError};
use crate::ingest::RawValue;

/// Stay below the bundled SQLite bound-parameter limit (32766)
const MAX_BOUND_PARAMS: usize = 32_000;

/// Relational store backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Db,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self::new(Db::new(path))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let table = table.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!("PRAGMA table_info({})", quote_ident(&table));
                let mut stmt = conn.prepare(&sql)?;
                let columns = stmt
                    .query_map([], |row| {
                        let not_null: i64 = row.get(3)?;
                        let pk: i64 = row.get(5)?;
                        Ok(ColumnDescriptor {
                            name: row.get(1)?,
                            declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                            nullable: not_null == 0 && pk == 0,
                            key: if pk > 0 { KeyRole::Primary } else { KeyRole::None },
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

                if columns.is_empty() {
                    return Err(TabloadError::NotFound(format!("table {}", table)));
                }
                Ok(columns)
            })
            .await
    }

    async fn unique_keys(&self, table: &str) -> Result<Vec<Vec<String>>> {
        let table = table.to_string();
        self.db
            .with_connection(move |conn| {
                let mut keys = Vec::new();

                // Rowid primary keys have no entry in index_list
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
                let mut primary: Vec<(i64, String)> = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?
                    .into_iter()
                    .filter(|(pk, _)| *pk > 0)
                    .collect();
                primary.sort();
                if !primary.is_empty() {
                    keys.push(primary.into_iter().map(|(_, name)| name).collect());
                }

                // (name, unique, partial)
                let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(&table)))?;
                let indexes: Vec<(String, bool, bool)> = stmt
                    .query_map([], |row| {
                        Ok((row.get(1)?, row.get::<_, i64>(2)? != 0, row.get::<_, i64>(4)? != 0))
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

                for (index, unique, partial) in indexes {
                    if !unique || partial {
                        continue;
                    }
                    let mut stmt = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index)))?;
                    let columns: Vec<Option<String>> = stmt
                        .query_map([], |row| row.get(2))?
                        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                    // Expression indexes report a null column name
                    if let Some(columns) = columns.into_iter().collect::<Option<Vec<String>>>() {
                        if !keys.contains(&columns) {
                            keys.push(columns);
                        }
                    }
                }
                Ok(keys)
            })
            .await
    }

    async fn execute_batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<RawValue>>,
        conflict: ConflictAction,
    ) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let table = table.to_string();
        let columns = columns.to_vec();

        self.db
            .with_connection(move |conn| {
                // Immediate: no other writer can move the row count between our reads
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let rows_per_statement = (MAX_BOUND_PARAMS / columns.len()).max(1);
                let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table));
                let mut affected = 0u64;

                for group in rows.chunks(rows_per_statement) {
                    let before: i64 = tx.query_row(&count_sql, [], |row| row.get(0))?;
                    let sql = build_insert_sql(&table, &columns, group.len(), &conflict);
                    let changed = tx.execute(&sql, params_from_iter(group.iter().flatten()))? as u64;
                    let after: i64 = tx.query_row(&count_sql, [], |row| row.get(0))?;

                    // SQLite counts an upserted row as one change; the conflict-aware
                    // convention counts it twice.
                    let inserted = (after - before).max(0) as u64;
                    let updated = changed.saturating_sub(inserted);
                    affected += inserted + 2 * updated;
                }

                tx.commit()?;
                Ok(affected)
            })
            .await
    }

    async fn query(&self, sql: &str, params: Vec<RawValue>) -> Result<Vec<Vec<RawValue>>> {
        let sql = sql.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let width = stmt.column_count();
                let rows = stmt
                    .query_map(params_from_iter(params.iter()), |row| {
                        (0..width)
                            .map(|i| row.get_ref(i).map(RawValue::from_value_ref))
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Multi-row INSERT for `row_count` rows, placeholders bound row-major
fn build_insert_sql(table: &str, columns: &[String], row_count: usize, conflict: &ConflictAction) -> String {
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![tuple; row_count].join(", ");

    match conflict {
        ConflictAction::Ignore => format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES {}",
            quote_ident(table),
            column_list,
            values
        ),
        ConflictAction::Update { key_columns } => {
            let target = if key_columns.is_empty() {
                String::new()
            } else {
                format!(
                    "({}) ",
                    key_columns.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ")
                )
            };
            let mut assignments: Vec<String> = columns
                .iter()
                .filter(|c| !key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            if assignments.is_empty() {
                // Every column is part of the identity: rewrite one in place so the
                // collision still registers as an update.
                assignments.push(format!("{0} = excluded.{0}", quote_ident(&columns[0])));
            }
            format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT {}DO UPDATE SET {}",
                quote_ident(table),
                column_list,
                values,
                target,
                assignments.join(", ")
            )
        }
    }
}
