use serde::Serialize;

use crate::registry::{IngestionTask, UploadedFile};

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Stable error kind (`not_found`, `access_denied`, ...)
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file: UploadedFile,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: UploadedFile,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task: IngestionTask,
}
