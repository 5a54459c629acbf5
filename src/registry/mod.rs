//! Task & file registry: the durable record of uploads and ingestion tasks.
//!
//! Both maps live behind one async mutex. Every change goes through
//! [`Registry::mutate`], which applies it to a copy, writes the copy to disk and
//! only then makes it visible. A failed write leaves the in-memory state as it was.

pub mod models;
pub mod sweep;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::access::Caller;
use crate::config::IngestConfig;
use crate::error::{Result, TabloadError};

pub use models::{BatchErrorEntry, FileStatus, IngestionTask, TaskStatus, UploadedFile};
pub use sweep::{spawn_sweeper, StartupReport, SweepReport};

const FILES_FILE: &str = "files.json";
const TASKS_FILE: &str = "tasks.json";

/// Everything the registry knows, keyed by id
#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    pub files: BTreeMap<String, UploadedFile>,
    pub tasks: BTreeMap<String, IngestionTask>,
}

impl RegistryState {
    pub fn file_mut(&mut self, id: &str) -> Result<&mut UploadedFile> {
        self.files
            .get_mut(id)
            .ok_or_else(|| TabloadError::NotFound(format!("file {}", id)))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut IngestionTask> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| TabloadError::NotFound(format!("task {}", id)))
    }

    /// Move the task's file to `processing` and register the task.
    ///
    /// Pending files and files that previously failed may start; a file that
    /// is already processing may not.
    pub fn begin_task(&mut self, task: IngestionTask, caller: &Caller) -> Result<()> {
        let file = self.file_mut(&task.file_id)?;
        if !caller.can_act_for(&file.uploaded_by) {
            return Err(TabloadError::AccessDenied(format!(
                "file {} belongs to another user",
                file.id
            )));
        }
        match file.status {
            FileStatus::Processing => return Err(TabloadError::AlreadyProcessing(file.id.clone())),
            FileStatus::Completed => {
                return Err(TabloadError::InvalidInput(format!(
                    "file {} has already been ingested",
                    file.id
                )))
            }
            FileStatus::Pending | FileStatus::Error => {}
        }
        file.status = FileStatus::Processing;
        file.task_id = Some(task.id.clone());
        file.last_error = None;
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }
}

/// Metadata of a new upload; the bytes are passed alongside
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    pub original_name: String,
    pub mime_hint: Option<String>,
    pub uploaded_by: String,
    pub connection: Option<String>,
    pub database: Option<String>,
    pub table: Option<String>,
}

pub struct Registry {
    registry_dir: PathBuf,
    uploads_dir: PathBuf,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Read the persisted maps under `data_dir` without any startup recovery
    pub fn open(data_dir: &Path) -> Result<Self> {
        let registry_dir = data_dir.join("registry");
        let uploads_dir = data_dir.join("uploads");
        std::fs::create_dir_all(&registry_dir)?;
        std::fs::create_dir_all(&uploads_dir)?;

        let state = RegistryState {
            files: load_map(&registry_dir.join(FILES_FILE))?,
            tasks: load_map(&registry_dir.join(TASKS_FILE))?,
        };
        log::debug!(
            "Registry opened at {} ({} file(s), {} task(s))",
            registry_dir.display(),
            state.files.len(),
            state.tasks.len()
        );

        Ok(Self {
            registry_dir,
            uploads_dir,
            state: Mutex::new(state),
        })
    }

    /// Open the registry and run startup recovery
    pub async fn load(data_dir: &Path, config: &IngestConfig) -> Result<Self> {
        let registry = Self::open(data_dir)?;
        let report = sweep::recover_on_startup(&registry, config).await?;
        log::info!(
            "Registry loaded: {} evicted, {} interrupted file(s) reset, {} orphan upload(s) removed",
            report.evicted,
            report.recovered,
            report.orphans_removed
        );
        Ok(registry)
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Apply `f` to a copy of the state, persist it, then publish it
    pub async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryState) -> Result<T>,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        persist(&self.registry_dir, &next)?;
        *state = next;
        Ok(out)
    }

    /// Run a read-only closure against the current state
    pub async fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn file(&self, id: &str) -> Option<UploadedFile> {
        self.read(|s| s.files.get(id).cloned()).await
    }

    pub async fn task(&self, id: &str) -> Option<IngestionTask> {
        self.read(|s| s.tasks.get(id).cloned()).await
    }

    /// Files not yet ingested that `caller` may see, oldest first
    pub async fn visible_files(&self, caller: &Caller) -> Vec<UploadedFile> {
        let mut files: Vec<UploadedFile> = self
            .read(|s| {
                s.files
                    .values()
                    .filter(|f| f.status != FileStatus::Completed)
                    .filter(|f| caller.can_act_for(&f.uploaded_by))
                    .cloned()
                    .collect()
            })
            .await;
        files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        files
    }

    /// Store the bytes under the uploads directory and record a `pending` file
    pub async fn store_upload(&self, upload: NewUpload, bytes: &[u8]) -> Result<UploadedFile> {
        if upload.uploaded_by.trim().is_empty() {
            return Err(TabloadError::MissingParameter("uploaded_by".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let stored_path = self.uploads_dir.join(stored_name(&id, &upload.original_name));
        std::fs::write(&stored_path, bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(bytes);

        let file = UploadedFile {
            id: id.clone(),
            original_name: upload.original_name,
            stored_path: stored_path.clone(),
            size_bytes: bytes.len() as u64,
            mime_hint: upload.mime_hint,
            checksum: format!("{:x}", hasher.finalize()),
            uploaded_by: upload.uploaded_by,
            uploaded_at: Utc::now(),
            connection: upload.connection,
            database: upload.database,
            table: upload.table,
            status: FileStatus::Pending,
            task_id: None,
            last_error: None,
        };

        let record = file.clone();
        if let Err(e) = self
            .mutate(move |s| {
                s.files.insert(record.id.clone(), record);
                Ok(())
            })
            .await
        {
            let _ = std::fs::remove_file(&stored_path);
            return Err(e);
        }

        log::info!(
            "Stored upload {} ({}, {} bytes) for {}",
            file.id,
            file.original_name,
            file.size_bytes,
            file.uploaded_by
        );
        Ok(file)
    }

    /// Drop a file record and its bytes. Rejected while the file is processing.
    pub async fn delete_file(&self, id: &str, caller: &Caller) -> Result<UploadedFile> {
        let removed = self
            .mutate(|s| {
                let file = s
                    .files
                    .get(id)
                    .ok_or_else(|| TabloadError::NotFound(format!("file {}", id)))?;
                if !caller.can_act_for(&file.uploaded_by) {
                    return Err(TabloadError::AccessDenied(format!(
                        "file {} belongs to another user",
                        id
                    )));
                }
                if file.status == FileStatus::Processing {
                    return Err(TabloadError::AlreadyProcessing(id.to_string()));
                }
                s.files
                    .remove(id)
                    .ok_or_else(|| TabloadError::NotFound(format!("file {}", id)))
            })
            .await?;

        remove_bytes(&removed.stored_path);
        Ok(removed)
    }

    /// Forget a task record; `false` if it was already gone
    pub async fn remove_task(&self, id: &str) -> Result<bool> {
        self.mutate(|s| Ok(s.tasks.remove(id).is_some())).await
    }
}

/// `<id>.<ext>` with the extension of the original name kept for format detection
fn stored_name(id: &str, original_name: &str) -> String {
    let extension: String = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if extension.is_empty() {
        id.to_string()
    } else {
        format!("{}.{}", id, extension)
    }
}

/// Delete stored upload bytes; a missing file is fine, anything else is left to the sweep
pub(crate) fn remove_bytes(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {} (left for the sweep)", path.display(), e),
    }
}

fn load_map<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&text)
        .map_err(|e| TabloadError::Registry(format!("{} is corrupt: {}", path.display(), e)))
}

/// Tasks go first: a crash in between leaves a finished task next to a stale
/// file record, which startup recovery can tell apart from interrupted work
fn persist(dir: &Path, state: &RegistryState) -> Result<()> {
    write_json(&dir.join(TASKS_FILE), &state.tasks)?;
    write_json(&dir.join(FILES_FILE), &state.files)?;
    Ok(())
}

/// Write to a sibling temp file and rename over the target
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| TabloadError::Registry(format!("serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| TabloadError::Registry(format!("persist {}: {}", path.display(), e)))
}
