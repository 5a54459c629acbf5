//! Ingestion orchestrator: task lifecycle from `start` to a terminal state.
//!
//! `start` admits the request and returns the task id at once; the run itself is
//! detached. Progress is persisted to the registry after every chunk so a client
//! can poll the task at any time.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use super::decoder::FormatHint;
use super::record::RowRecord;
use super::resolver::{count_conflicts, resolve, DuplicateMode, DuplicatePolicy};
use super::worker::decode_isolated;
use super::writer::{BatchWriter, ColumnPlan, WriteCounts};
use crate::access::{AccessControl, Caller};
use crate::config::IngestConfig;
use crate::error::{Result, TabloadError};
use crate::registry::{
    self, BatchErrorEntry, FileStatus, IngestionTask, Registry, TaskStatus, UploadedFile,
};
use crate::store::{ColumnDescriptor, RelationalStore, StoreCache};

/// Parameters of a process request; missing targets fall back to the upload's
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub mode: DuplicateMode,
    #[serde(default)]
    pub identity_fields: Vec<String>,
}

impl ProcessRequest {
    pub fn policy(&self) -> DuplicatePolicy {
        DuplicatePolicy {
            mode: self.mode,
            identity_fields: self
                .identity_fields
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }
}

/// An admitted task, ready to run
struct Job {
    task_id: String,
    file: UploadedFile,
    store: Arc<dyn RelationalStore>,
    table: String,
    policy: DuplicatePolicy,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    stores: Arc<StoreCache>,
    access: Arc<dyn AccessControl>,
    config: IngestConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        stores: Arc<StoreCache>,
        access: Arc<dyn AccessControl>,
        config: IngestConfig,
    ) -> Self {
        Self {
            registry,
            stores,
            access,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    /// Admit the request and run the task in the background
    pub async fn start(&self, file_id: &str, request: ProcessRequest, caller: &Caller) -> Result<String> {
        let job = self.admit(file_id, request, caller).await?;
        let task_id = job.task_id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(job).await;
        });
        Ok(task_id)
    }

    /// Admit the request and run the task inline, returning its final snapshot
    pub async fn run_to_completion(
        &self,
        file_id: &str,
        request: ProcessRequest,
        caller: &Caller,
    ) -> Result<IngestionTask> {
        let job = self.admit(file_id, request, caller).await?;
        let task_id = job.task_id.clone();
        self.execute(job).await;
        self.registry
            .task(&task_id)
            .await
            .ok_or_else(|| TabloadError::NotFound(format!("task {}", task_id)))
    }

    async fn admit(&self, file_id: &str, request: ProcessRequest, caller: &Caller) -> Result<Job> {
        let file = self
            .registry
            .file(file_id)
            .await
            .ok_or_else(|| TabloadError::NotFound(format!("file {}", file_id)))?;

        let connection = request
            .connection
            .clone()
            .or_else(|| file.connection.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| TabloadError::MissingParameter("connection".to_string()))?;
        let table = request
            .table
            .clone()
            .or_else(|| file.table.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| TabloadError::MissingParameter("table".to_string()))?;
        let database = request
            .database
            .clone()
            .or_else(|| file.database.clone())
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| connection.clone());

        self.access.authorize(caller, &database, &table)?;
        let store = self.stores.resolve(&connection)?;
        let policy = request.policy();

        let task = IngestionTask::new(&file.id, &connection, &database, &table, policy.clone(), &caller.user);
        let task_id = task.id.clone();
        self.registry.mutate(|s| s.begin_task(task, caller)).await?;

        log::info!(
            "Task {} started: {} -> {}.{} (mode {}) by {}",
            task_id,
            file.original_name,
            database,
            table,
            policy.mode,
            caller.user
        );

        Ok(Job {
            task_id,
            file,
            store,
            table,
            policy,
        })
    }

    /// Drive the task to a terminal state and schedule its reclamation
    async fn execute(&self, job: Job) {
        match self.run(&job).await {
            Ok(()) => self.complete(&job).await,
            Err(e) => self.fail(&job, e).await,
        }
        self.schedule_reclamation(job.task_id);
    }

    async fn run(&self, job: &Job) -> Result<()> {
        let store = job.store.as_ref();
        let table_columns = store.describe_columns(&job.table).await?;

        let hint = FormatHint::detect(&job.file.stored_path, job.file.mime_hint.as_deref())
            .or_else(|| FormatHint::detect(std::path::Path::new(&job.file.original_name), None))
            .ok_or_else(|| {
                TabloadError::InvalidInput(format!("unsupported file type: {}", job.file.original_name))
            })?;
        let decoded = decode_isolated(
            &job.file.stored_path,
            hint,
            job.file.size_bytes,
            self.config.isolate_threshold_bytes,
        )
        .await?;

        let plan = ColumnPlan::build(&decoded.headers, &table_columns)?;
        if !plan.dropped().is_empty() {
            log::warn!(
                "Task {}: ignoring column(s) not in {}: {}",
                job.task_id,
                job.table,
                plan.dropped().join(", ")
            );
        }
        let identity = identity_columns(&job.policy.identity_fields, &plan, &table_columns)?;
        let mode = job.policy.mode;
        if mode == DuplicateMode::Update && !identity.is_empty() {
            let unique_keys = store.unique_keys(&job.table).await?;
            ensure_unique_identity(&identity, &unique_keys, &job.table)?;
        }
        let key_columns = identity.clone();

        let total_rows = decoded.total_rows() as u64;
        self.registry
            .mutate(|s| {
                s.task_mut(&job.task_id)?.total_rows = total_rows;
                Ok(())
            })
            .await?;
        log::info!("Task {}: {} row(s) decoded", job.task_id, total_rows);

        let batch_size = self.config.batch_size.max(1);

        if mode == DuplicateMode::Error && !identity.is_empty() {
            let mut conflicts = 0;
            for chunk in decoded.rows.chunks(batch_size) {
                let prepared = prepare_chunk(&plan, chunk);
                conflicts += count_conflicts(store, &job.table, &identity, &prepared).await?;
            }
            if conflicts > 0 {
                return Err(TabloadError::ConflictPolicy { conflicts });
            }
        }

        let writer = BatchWriter::new(store, &job.table, &plan, key_columns);

        for (batch, chunk) in decoded.rows.chunks(batch_size).enumerate() {
            let row_count = chunk.len();
            let prepared = prepare_chunk(&plan, chunk);

            let resolution = resolve(store, &job.table, prepared, &identity, mode).await?;
            let mut counts = WriteCounts {
                skipped: resolution.skipped as u64,
                ..Default::default()
            };
            let write_count = resolution.rows_to_write.len() as u64;

            let mut error = None;
            match writer.write(resolution.rows_to_write, mode).await {
                Ok(written) => counts += written,
                Err(TabloadError::BatchWrite(message)) => {
                    log::warn!("Task {}: batch {} failed: {}", job.task_id, batch, message);
                    counts.skipped += write_count;
                    error = Some(BatchErrorEntry {
                        batch,
                        first_row: (batch * batch_size) as u64,
                        row_count,
                        message,
                        at: Utc::now(),
                    });
                }
                Err(e) => return Err(e),
            }

            self.registry
                .mutate(|s| {
                    s.task_mut(&job.task_id)?
                        .record_chunk(row_count as u64, counts, error);
                    Ok(())
                })
                .await?;
            log::debug!(
                "Task {}: batch {} done (+{} inserted, +{} updated, +{} skipped)",
                job.task_id,
                batch,
                counts.inserted,
                counts.updated,
                counts.skipped
            );
        }

        Ok(())
    }

    /// Mark the task completed, drop the file record, then delete the bytes
    async fn complete(&self, job: &Job) {
        let result = self
            .registry
            .mutate(|s| {
                s.task_mut(&job.task_id)?.finish(TaskStatus::Completed, None);
                s.files.remove(&job.file.id);
                Ok(s.tasks.get(&job.task_id).cloned())
            })
            .await;

        match result {
            Ok(Some(task)) => {
                log::info!(
                    "Task {} completed: {} processed, {} inserted, {} updated, {} skipped, {} batch error(s)",
                    task.id,
                    task.processed_rows,
                    task.inserted_rows,
                    task.updated_rows,
                    task.skipped_rows,
                    task.errors.len()
                );
                registry::remove_bytes(&job.file.stored_path);
            }
            Ok(None) => {}
            Err(e) => log::error!("Task {}: failed to record completion: {}", job.task_id, e),
        }
    }

    /// Mark task and file `error`; the source bytes stay for a retry
    async fn fail(&self, job: &Job, error: TabloadError) {
        let message = error.to_string();
        log::error!("Task {} failed: {}", job.task_id, message);

        let result = self
            .registry
            .mutate(|s| {
                s.task_mut(&job.task_id)?
                    .finish(TaskStatus::Error, Some(message.clone()));
                if let Ok(file) = s.file_mut(&job.file.id) {
                    file.status = FileStatus::Error;
                    file.last_error = Some(message.clone());
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            log::error!("Task {}: failed to record failure: {}", job.task_id, e);
        }
    }

    fn schedule_reclamation(&self, task_id: String) {
        let registry = Arc::clone(&self.registry);
        let retention = self.config.task_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            match registry.remove_task(&task_id).await {
                Ok(true) => log::debug!("Reclaimed task {}", task_id),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to reclaim task {}: {}", task_id, e),
            }
        });
    }
}

fn prepare_chunk(plan: &ColumnPlan, chunk: &[RowRecord]) -> Vec<RowRecord> {
    chunk.iter().map(|row| plan.prepare(row)).collect()
}

/// Table columns identifying a row.
///
/// Explicit fields must all be mapped columns. Without any, the primary key is
/// used when the file carries every key column; otherwise resolution is off.
fn identity_columns(
    fields: &[String],
    plan: &ColumnPlan,
    table_columns: &[ColumnDescriptor],
) -> Result<Vec<String>> {
    if !fields.is_empty() {
        return fields
            .iter()
            .map(|field| {
                plan.find_column(field).map(str::to_string).ok_or_else(|| {
                    TabloadError::InvalidInput(format!(
                        "identity field '{}' is not a column of both the file and the table",
                        field
                    ))
                })
            })
            .collect();
    }

    let primary: Vec<&ColumnDescriptor> = table_columns.iter().filter(|c| c.is_primary_key()).collect();
    let mapped: Option<Vec<String>> = primary
        .iter()
        .map(|c| plan.find_column(&c.name).map(str::to_string))
        .collect();
    match mapped {
        Some(keys) if !keys.is_empty() => Ok(keys),
        _ => {
            log::debug!("No usable identity; duplicate resolution disabled");
            Ok(Vec::new())
        }
    }
}

/// Upserts need a conflict target: the identity must be exactly one of the table's unique keys
fn ensure_unique_identity(identity: &[String], unique_keys: &[Vec<String>], table: &str) -> Result<()> {
    let same_columns = |key: &Vec<String>| {
        key.len() == identity.len()
            && key
                .iter()
                .all(|k| identity.iter().any(|i| i.eq_ignore_ascii_case(k)))
    };
    if unique_keys.iter().any(same_columns) {
        return Ok(());
    }
    Err(TabloadError::InvalidInput(format!(
        "update needs a primary key or unique index on ({}) in {}",
        identity.join(", "),
        table
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TableAllowList;
    use crate::config::AccessConfig;
    use crate::ingest::fixtures::people_workbook;
    use crate::ingest::RawValue;
    use crate::registry::NewUpload;
    use crate::store::SqliteStore;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _temp_dir: TempDir,
        orchestrator: Orchestrator,
        store: SqliteStore,
        caller: Caller,
    }

    async fn harness(schema: &str, batch_size: usize) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db_path: PathBuf = temp_dir.path().join("target.db");
        let store = SqliteStore::open(&db_path);
        let schema = schema.to_string();
        store
            .db()
            .with_connection(move |conn| {
                conn.execute_batch(&schema)?;
                Ok(())
            })
            .await
            .unwrap();

        let config = IngestConfig {
            batch_size,
            ..Default::default()
        };
        let registry = Arc::new(Registry::load(&temp_dir.path().join("data"), &config).await.unwrap());
        let stores = Arc::new(StoreCache::new(HashMap::from([("main".to_string(), db_path)]), 4));
        let access: Arc<dyn AccessControl> = Arc::new(TableAllowList::from_config(&AccessConfig::default()));
        let orchestrator = Orchestrator::new(registry, stores, access, config);

        Harness {
            _temp_dir: temp_dir,
            orchestrator,
            store,
            caller: Caller::new("ann", false),
        }
    }

    impl Harness {
        async fn upload(&self, name: &str, body: &[u8]) -> UploadedFile {
            self.orchestrator
                .registry()
                .store_upload(
                    NewUpload {
                        original_name: name.to_string(),
                        uploaded_by: self.caller.user.clone(),
                        connection: Some("main".to_string()),
                        table: Some("users".to_string()),
                        ..Default::default()
                    },
                    body,
                )
                .await
                .unwrap()
        }

        async fn run(&self, file_id: &str, mode: DuplicateMode, identity: &[&str]) -> IngestionTask {
            let request = ProcessRequest {
                mode,
                identity_fields: identity.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            };
            self.orchestrator
                .run_to_completion(file_id, request, &self.caller)
                .await
                .unwrap()
        }

        async fn exec(&self, sql: &str) {
            let sql = sql.to_string();
            self.store
                .db()
                .with_connection(move |conn| {
                    conn.execute_batch(&sql)?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        async fn count(&self) -> i64 {
            match &self.store.query("SELECT COUNT(*) FROM users", vec![]).await.unwrap()[0][0] {
                RawValue::Integer(n) => *n,
                other => panic!("unexpected count {:?}", other),
            }
        }
    }

    const USERS: &str = "CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT,
        created_at DATETIME
    );";

    #[tokio::test]
    async fn test_update_scenario_two_inserts_one_update() {
        let h = harness(USERS, 1000).await;
        h.exec("INSERT INTO users (email, name) VALUES ('b@x', 'Before')").await;

        let file = h.upload("people.csv", b"email,name\na@x,Ann\nb@x,After\nc@x,Cy\n").await;
        let task = h.run(&file.id, DuplicateMode::Update, &["email"]).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.total_rows, 3);
        assert_eq!(task.processed_rows, 3);
        assert_eq!(task.inserted_rows, 2);
        assert_eq!(task.updated_rows, 1);
        assert_eq!(task.skipped_rows, 0);

        let name = h
            .store
            .query("SELECT name FROM users WHERE email = 'b@x'", vec![])
            .await
            .unwrap();
        assert_eq!(name[0][0], RawValue::Text("After".into()));

        // completed files are dropped from the registry and their bytes deleted
        assert!(h.orchestrator.registry().file(&file.id).await.is_none());
        assert!(!file.stored_path.exists());
    }

    #[tokio::test]
    async fn test_update_without_unique_identity_fails_before_writing() {
        let schema = "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
                      INSERT INTO users (email, name) VALUES ('b@x', 'Before');";
        let h = harness(schema, 1000).await;

        let file = h.upload("people.csv", b"email,name\na@x,Ann\nb@x,After\n").await;
        let task = h.run(&file.id, DuplicateMode::Update, &["email"]).await;

        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.fatal_error.unwrap().contains("unique index on (email)"));
        assert_eq!(task.processed_rows, 0);
        assert_eq!(h.count().await, 1);

        // skip does not need a constraint: the lookup filters b@x
        let retried = h.run(&file.id, DuplicateMode::Skip, &["email"]).await;
        assert_eq!(retried.status, TaskStatus::Completed);
        assert_eq!((retried.inserted_rows, retried.skipped_rows), (1, 1));
    }

    #[test]
    fn test_ensure_unique_identity() {
        let keys = vec![vec!["id".to_string()], vec!["org".to_string(), "email".to_string()]];
        let names = |n: &[&str]| n.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(ensure_unique_identity(&names(&["ID"]), &keys, "users").is_ok());
        assert!(ensure_unique_identity(&names(&["email", "org"]), &keys, "users").is_ok());
        assert!(ensure_unique_identity(&names(&["email"]), &keys, "users").is_err());
        assert!(ensure_unique_identity(&names(&["id", "email"]), &keys, "users").is_err());
    }

    #[tokio::test]
    async fn test_skip_is_idempotent() {
        let h = harness(USERS, 2).await;
        let body = b"email,name\na@x,A\nb@x,B\nc@x,C\n";

        let first = h.upload("people.csv", body).await;
        let task = h.run(&first.id, DuplicateMode::Skip, &["email"]).await;
        assert_eq!((task.inserted_rows, task.skipped_rows), (3, 0));

        let second = h.upload("people.csv", body).await;
        let task = h.run(&second.id, DuplicateMode::Skip, &["email"]).await;
        assert_eq!((task.inserted_rows, task.skipped_rows), (0, 3));
        assert!(task.is_reconciled());
        assert_eq!(h.count().await, 3);
    }

    #[tokio::test]
    async fn test_error_policy_writes_nothing() {
        let h = harness(USERS, 2).await;
        h.exec("INSERT INTO users (email, name) VALUES ('z@x', 'Existing')").await;

        // the conflicting row sits in the last chunk
        let file = h.upload("people.csv", b"email,name\na@x,A\nb@x,B\nc@x,C\nz@x,Z\n").await;
        let task = h.run(&file.id, DuplicateMode::Error, &["email"]).await;

        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.fatal_error.unwrap().contains("1 row(s)"));
        assert_eq!(task.processed_rows, 0);
        assert_eq!(h.count().await, 1);

        let file = h.orchestrator.registry().file(&file.id).await.unwrap();
        assert_eq!(file.status, FileStatus::Error);
        assert!(file.stored_path.exists());
    }

    #[tokio::test]
    async fn test_workbook_ingestion_normalizes_date_cells() {
        let h = harness(USERS, 1).await;
        let workbook = people_workbook(h._temp_dir.path());
        let file = h.upload("people.xlsx", &std::fs::read(&workbook).unwrap()).await;

        let task = h.run(&file.id, DuplicateMode::Skip, &["email"]).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!((task.total_rows, task.inserted_rows), (2, 2));

        let rows = h
            .store
            .query("SELECT email, name, created_at FROM users ORDER BY email", vec![])
            .await
            .unwrap();
        let text = |s: &str| RawValue::Text(s.to_string());
        assert_eq!(
            rows,
            vec![
                vec![text("a@x"), text("Ann"), text("2024-01-15 00:00:00")],
                vec![text("b@x"), text("Bob & Co"), text("2024-01-16 12:00:00")],
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_spreadsheet_fails_task_and_keeps_bytes() {
        let h = harness(USERS, 1000).await;
        let file = h.upload("people.xlsx", b"PK\x03\x04 definitely not a workbook").await;
        let task = h.run(&file.id, DuplicateMode::Skip, &[]).await;

        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.fatal_error.unwrap().contains("Decode error"));
        let file = h.orchestrator.registry().file(&file.id).await.unwrap();
        assert_eq!(file.status, FileStatus::Error);
        assert!(file.last_error.is_some());
        assert!(file.stored_path.exists());
    }

    #[tokio::test]
    async fn test_batch_error_is_recorded_and_run_continues() {
        let schema = "CREATE TABLE users (
            email TEXT PRIMARY KEY,
            name TEXT,
            joined_at TEXT NOT NULL
        );";
        let h = harness(schema, 2).await;
        // second chunk has a blank date, which normalizes to null and violates NOT NULL
        let file = h
            .upload(
                "people.csv",
                b"email,name,joined_at\na@x,A,15/01/2024\nb@x,B,2024-01-16\nc@x,C,\nd@x,D,\"Jan 18, 2024\"\ne@x,E,45310\n",
            )
            .await;
        let task = h.run(&file.id, DuplicateMode::Update, &["email"]).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.processed_rows, 5);
        assert_eq!(task.inserted_rows, 3);
        assert_eq!(task.skipped_rows, 2);
        assert!(task.is_reconciled());
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.errors[0].batch, 1);
        assert_eq!(task.errors[0].first_row, 2);
        assert_eq!(task.errors[0].row_count, 2);

        let dates = h
            .store
            .query("SELECT joined_at FROM users ORDER BY email", vec![])
            .await
            .unwrap();
        assert_eq!(dates[0][0], RawValue::Text("2024-01-15 00:00:00".into()));
        assert_eq!(dates[1][0], RawValue::Text("2024-01-16 00:00:00".into()));
        assert_eq!(dates[2][0], RawValue::Text("2024-01-19 00:00:00".into()));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let h = harness(USERS, 1000).await;
        let file = h.upload("people.csv", b"email,name\na@x,A\n").await;
        h.orchestrator
            .registry()
            .mutate(|s| {
                let task = IngestionTask::new(&file.id, "main", "main", "users", DuplicatePolicy::default(), "ann");
                s.begin_task(task, &Caller::new("ann", false))
            })
            .await
            .unwrap();

        let err = h
            .orchestrator
            .start(&file.id, ProcessRequest::default(), &h.caller)
            .await
            .unwrap_err();
        assert!(matches!(err, TabloadError::AlreadyProcessing(_)));
    }

    #[tokio::test]
    async fn test_failed_file_can_be_retried() {
        let h = harness(USERS, 1000).await;
        let file = h.upload("people.csv", b"email,name\na@x,A\n").await;

        let request = ProcessRequest {
            table: Some("missing_table".to_string()),
            ..Default::default()
        };
        let failed = h
            .orchestrator
            .run_to_completion(&file.id, request, &h.caller)
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Error);

        let retried = h.run(&file.id, DuplicateMode::Skip, &[]).await;
        assert_eq!(retried.status, TaskStatus::Completed);
        assert_eq!(retried.inserted_rows, 1);
        assert_ne!(retried.id, failed.id);
    }

    #[tokio::test]
    async fn test_admission_errors() {
        let h = harness(USERS, 1000).await;
        let file = h.upload("people.csv", b"email,name\na@x,A\n").await;

        let err = h
            .orchestrator
            .start("no-such-file", ProcessRequest::default(), &h.caller)
            .await
            .unwrap_err();
        assert!(matches!(err, TabloadError::NotFound(_)));

        let err = h
            .orchestrator
            .start(&file.id, ProcessRequest::default(), &Caller::new("bob", false))
            .await
            .unwrap_err();
        assert!(matches!(err, TabloadError::AccessDenied(_)));

        let request = ProcessRequest {
            connection: Some("elsewhere".to_string()),
            ..Default::default()
        };
        let err = h.orchestrator.start(&file.id, request, &h.caller).await.unwrap_err();
        assert!(matches!(err, TabloadError::NotFound(_)));

        // nothing above may leave the file stuck in processing
        let file = h.orchestrator.registry().file(&file.id).await.unwrap();
        assert_eq!(file.status, FileStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_identity_field_fails_task() {
        let h = harness(USERS, 1000).await;
        let file = h.upload("people.csv", b"email,name\na@x,A\n").await;
        let task = h.run(&file.id, DuplicateMode::Skip, &["phone"]).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.fatal_error.unwrap().contains("phone"));
    }

    #[tokio::test]
    async fn test_start_returns_before_completion_and_task_finishes() {
        let h = harness(USERS, 1).await;
        let file = h.upload("people.csv", b"email,name\na@x,A\nb@x,B\n").await;
        let task_id = h
            .orchestrator
            .start(&file.id, ProcessRequest::default(), &h.caller)
            .await
            .unwrap();

        let mut snapshot = None;
        for _ in 0..200 {
            let task = h.orchestrator.registry().task(&task_id).await.unwrap();
            assert!(task.is_reconciled());
            if task.is_terminal() {
                snapshot = Some(task);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let task = snapshot.expect("task should finish");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.inserted_rows, 2);
    }
}
