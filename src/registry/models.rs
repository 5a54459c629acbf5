use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::ingest::{DuplicatePolicy, WriteCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Completed,
    Error,
}

/// An uploaded source file and where it stands in the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub original_name: String,
    pub stored_path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub mime_hint: Option<String>,
    /// SHA-256 of the stored bytes
    pub checksum: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    /// Default target, overridable when processing starts
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    pub status: FileStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Failure of one chunk's write; the task carries on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorEntry {
    /// 0-based chunk index
    pub batch: usize,
    /// 0-based row offset of the chunk within the file
    pub first_row: u64,
    pub row_count: usize,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One run of the pipeline over one uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionTask {
    pub id: String,
    pub file_id: String,
    pub connection: String,
    pub database: String,
    pub table: String,
    pub policy: DuplicatePolicy,
    pub started_by: String,
    pub status: TaskStatus,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub inserted_rows: u64,
    pub updated_rows: u64,
    pub skipped_rows: u64,
    #[serde(default)]
    pub errors: Vec<BatchErrorEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fatal_error: Option<String>,
}

impl IngestionTask {
    pub fn new(
        file_id: &str,
        connection: &str,
        database: &str,
        table: &str,
        policy: DuplicatePolicy,
        started_by: &str,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            id: task_id_at(started_at),
            file_id: file_id.to_string(),
            connection: connection.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            policy,
            started_by: started_by.to_string(),
            status: TaskStatus::Processing,
            total_rows: 0,
            processed_rows: 0,
            inserted_rows: 0,
            updated_rows: 0,
            skipped_rows: 0,
            errors: Vec::new(),
            started_at,
            completed_at: None,
            fatal_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TaskStatus::Processing
    }

    /// Fold one chunk's outcome into the counters
    pub fn record_chunk(&mut self, rows: u64, counts: WriteCounts, error: Option<BatchErrorEntry>) {
        debug_assert_eq!(counts.total(), rows, "chunk counts must reconcile");
        self.processed_rows += rows;
        self.inserted_rows += counts.inserted;
        self.updated_rows += counts.updated;
        self.skipped_rows += counts.skipped;
        if let Some(entry) = error {
            self.errors.push(entry);
        }
    }

    /// `inserted + updated + skipped == processed`
    pub fn is_reconciled(&self) -> bool {
        self.inserted_rows + self.updated_rows + self.skipped_rows == self.processed_rows
            && self.processed_rows <= self.total_rows
    }

    pub fn finish(&mut self, status: TaskStatus, fatal_error: Option<String>) {
        self.status = status;
        self.fatal_error = fatal_error;
        self.completed_at = Some(Utc::now());
    }
}

/// `task-<unix millis>-<8 hex>`
fn task_id_at(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", at.timestamp_millis(), &suffix[..8])
}
