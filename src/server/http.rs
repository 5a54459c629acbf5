use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::access::Caller;
use crate::config::{Config, HttpServerConfig};
use crate::error::{Result, TabloadError};
use crate::ingest::{FormatHint, Orchestrator, ProcessRequest};
use crate::registry::{NewUpload, UploadedFile};
use crate::server::types::*;

/// Header carrying the caller's identity
pub const USER_HEADER: &str = "x-tabload-user";

/// Check if a port is available by attempting to bind to it
async fn check_port_available(port: u16) -> bool {
    tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .is_ok()
}

/// HTTP surface of the ingestion pipeline
pub struct HttpServer {
    state: AppState,
    max_upload_bytes: usize,
}

impl HttpServer {
    /// Create a new HTTP server, reading the API key from the configured env var
    pub fn new(config: &Config, orchestrator: Orchestrator) -> Result<Self> {
        // API key is empty if authless mode is enabled
        let api_key = config
            .api_key()
            .map_err(|e| TabloadError::Config(e.to_string()))?;
        Ok(Self::with_api_key(orchestrator, &config.http_server, api_key))
    }

    pub fn with_api_key(orchestrator: Orchestrator, http: &HttpServerConfig, api_key: String) -> Self {
        Self {
            state: AppState {
                orchestrator: Arc::new(orchestrator),
                api_key,
                allowed_origins: http.allowed_origins.clone(),
                authless: http.authless,
            },
            max_upload_bytes: http.max_upload_bytes,
        }
    }

    /// Run the HTTP server
    pub async fn run(&self, port: u16) -> Result<()> {
        let app = self.router();
        let addr = format!("127.0.0.1:{}", port);

        if !check_port_available(port).await {
            return Err(TabloadError::Config(format!(
                "Port {} is already in use. Stop the other process or set http_server.port in config.toml",
                port
            )));
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            TabloadError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Failed to bind to {}: {}", addr, e),
            ))
        })?;
        log::info!("Starting tabload HTTP server on http://{}", addr);

        axum::serve(listener, app).await.map_err(|e| {
            TabloadError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("HTTP server error: {}", e),
            ))
        })?;

        Ok(())
    }

    /// Create the axum router
    pub fn router(&self) -> Router {
        let allowed_origins = &self.state.allowed_origins;

        // CORS preflight mirrors the origin check done in the handlers
        let cors = if allowed_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<axum::http::HeaderValue> = allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .route("/uploads", post(handle_upload).get(handle_list))
            .route("/uploads/:id", delete(handle_delete))
            .route("/uploads/:id/process", post(handle_process))
            .route("/tasks/:id", get(handle_task))
            .route("/health", get(handle_health))
            .layer(DefaultBodyLimit::max(self.max_upload_bytes))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self.state.clone())
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    api_key: String,
    allowed_origins: Vec<String>,
    authless: bool,
}

/// Map a pipeline error to its status code and stable kind
pub fn error_response(err: &TabloadError) -> Response {
    let (status, kind) = match err {
        TabloadError::NoFile => (StatusCode::BAD_REQUEST, "no_file"),
        TabloadError::MissingParameter(_) => (StatusCode::BAD_REQUEST, "missing_parameter"),
        TabloadError::AccessDenied(_) => (StatusCode::FORBIDDEN, "access_denied"),
        TabloadError::AlreadyProcessing(_) => (StatusCode::CONFLICT, "already_processing"),
        TabloadError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        TabloadError::InvalidInput(_) | TabloadError::Decode(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorBody {
            error: kind,
            message: err.to_string(),
        }),
    )
        .into_response()
}

/// Auth, origin check and caller identity for one request
fn authenticate(state: &AppState, headers: &HeaderMap) -> std::result::Result<Caller, Response> {
    // Validate authentication and Origin header (skip if authless mode)
    if !state.authless {
        validate_auth(headers, &state.api_key)?;
        validate_origin(headers, &state.allowed_origins)?;
    }

    let user = headers
        .get(USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| error_response(&TabloadError::MissingParameter(USER_HEADER.to_string())))?;

    Ok(state.orchestrator.access().caller(user))
}

/// Handle POST /uploads (multipart: file, connection, database, table)
async fn handle_upload(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match receive_upload(&state, &caller, multipart).await {
        Ok(file) => (StatusCode::CREATED, Json(UploadResponse { file })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn receive_upload(state: &AppState, caller: &Caller, mut multipart: Multipart) -> Result<UploadedFile> {
    let mut upload = NewUpload {
        uploaded_by: caller.user.clone(),
        ..Default::default()
    };
    let mut bytes: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| TabloadError::InvalidInput(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                upload.original_name = field.file_name().unwrap_or("upload").to_string();
                upload.mime_hint = field.content_type().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| TabloadError::InvalidInput(format!("failed to read file: {}", e)))?,
                );
            }
            "connection" | "database" | "table" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| TabloadError::InvalidInput(format!("failed to read {}: {}", name, e)))?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match name.as_str() {
                    "connection" => upload.connection = value,
                    "database" => upload.database = value,
                    _ => upload.table = value,
                }
            }
            other => log::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let bytes = bytes.filter(|b| !b.is_empty()).ok_or(TabloadError::NoFile)?;
    let connection = upload
        .connection
        .clone()
        .ok_or_else(|| TabloadError::MissingParameter("connection".to_string()))?;
    let table = upload
        .table
        .clone()
        .ok_or_else(|| TabloadError::MissingParameter("table".to_string()))?;

    if FormatHint::detect(std::path::Path::new(&upload.original_name), upload.mime_hint.as_deref()).is_none() {
        return Err(TabloadError::InvalidInput(format!(
            "unsupported file type: {}",
            upload.original_name
        )));
    }

    let database = upload.database.clone().unwrap_or(connection);
    state.orchestrator.access().authorize(caller, &database, &table)?;

    state.orchestrator.registry().store_upload(upload, &bytes).await
}

/// Handle POST /uploads/:id/process
async fn handle_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
    body: Bytes,
) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(response) => return response,
    };

    let request: ProcessRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ProcessRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return error_response(&TabloadError::InvalidInput(format!("Invalid JSON: {}", e)));
            }
        }
    };

    match state.orchestrator.start(&file_id, request, &caller).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(ProcessResponse { task_id })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle DELETE /uploads/:id
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap, Path(file_id): Path<String>) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.orchestrator.registry().delete_file(&file_id, &caller).await {
        Ok(deleted) => (StatusCode::OK, Json(DeleteResponse { deleted })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle GET /uploads: files not yet ingested
async fn handle_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(response) => return response,
    };
    let files = state.orchestrator.registry().visible_files(&caller).await;
    (StatusCode::OK, Json(FileListResponse { files })).into_response()
}

/// Handle GET /tasks/:id
async fn handle_task(State(state): State<AppState>, headers: HeaderMap, Path(task_id): Path<String>) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.orchestrator.registry().task(&task_id).await {
        Some(task) if caller.can_act_for(&task.started_by) => {
            (StatusCode::OK, Json(TaskResponse { task })).into_response()
        }
        Some(_) => error_response(&TabloadError::AccessDenied(format!("task {}", task_id))),
        None => error_response(&TabloadError::NotFound(format!("task {}", task_id))),
    }
}

/// Handle health check
async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "tabload",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "access_denied",
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Validate Authorization header
fn validate_auth(headers: &HeaderMap, expected_key: &str) -> std::result::Result<(), Response> {
    let auth_header = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header. Use 'Authorization: Bearer <api-key>'"))?;

    let provided_key = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Invalid Authorization header format. Use 'Authorization: Bearer <api-key>'"))?;

    if provided_key != expected_key {
        return Err(unauthorized("Invalid API key"));
    }

    Ok(())
}

/// Validate Origin header (prevents DNS rebinding attacks)
fn validate_origin(headers: &HeaderMap, allowed_origins: &[String]) -> std::result::Result<(), Response> {
    // If no origins are configured, allow all (for local development)
    if allowed_origins.is_empty() {
        return Ok(());
    }

    // If no origin header, allow (direct requests, not browser)
    let origin = match headers.get("origin").and_then(|h| h.to_str().ok()) {
        Some(o) => o,
        None => return Ok(()),
    };

    if allowed_origins
        .iter()
        .any(|allowed| origin == allowed || origin.starts_with(&format!("{}://", allowed)))
    {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: "access_denied",
                message: format!("Origin '{}' is not in the allowed origins list", origin),
            }),
        )
            .into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessControl, TableAllowList};
    use crate::config::{AccessConfig, IngestConfig};
    use crate::registry::{IngestionTask, Registry};
    use crate::ingest::DuplicatePolicy;
    use crate::store::{SqliteStore, StoreCache};
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "tabloadboundary";

    struct TestApp {
        _temp_dir: TempDir,
        router: Router,
        orchestrator: Orchestrator,
    }

    async fn test_app() -> TestApp {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("target.db");
        SqliteStore::open(&db_path)
            .db()
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE users (email TEXT PRIMARY KEY, name TEXT);")?;
                Ok(())
            })
            .await
            .unwrap();

        let config = IngestConfig::default();
        let registry = Arc::new(Registry::load(&temp_dir.path().join("data"), &config).await.unwrap());
        let stores = Arc::new(StoreCache::new(HashMap::from([("main".to_string(), db_path)]), 4));
        let access: Arc<dyn AccessControl> = Arc::new(TableAllowList::from_config(&AccessConfig {
            allowed_tables: vec!["main.users".to_string()],
            privileged_users: vec![],
        }));
        let orchestrator = Orchestrator::new(registry, stores, access, config);
        let server = HttpServer::with_api_key(orchestrator.clone(), &HttpServerConfig::default(), "secret".to_string());

        TestApp {
            _temp_dir: temp_dir,
            router: server.router(),
            orchestrator,
        }
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer secret")
            .header(USER_HEADER, "ann")
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some((filename, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: text/csv\r\n\r\n",
                    BOUNDARY, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Body::from(body)
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn upload(app: &TestApp, fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> (StatusCode, serde_json::Value) {
        let req = request("POST", "/uploads")
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(multipart_body(fields, file))
            .unwrap();
        send(app, req).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_requires_bearer_key_and_user() {
        let app = test_app().await;
        let req = Request::builder().uri("/uploads").body(Body::empty()).unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/uploads")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing_parameter");
    }

    #[tokio::test]
    async fn test_upload_error_kinds() {
        let app = test_app().await;

        let (status, json) = upload(&app, &[("connection", "main"), ("table", "users")], None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "no_file");

        let (status, json) = upload(&app, &[("connection", "main")], Some(("a.csv", b"email\na@x\n"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing_parameter");

        let (status, json) = upload(
            &app,
            &[("connection", "main"), ("table", "payroll")],
            Some(("a.csv", b"email\na@x\n")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"], "access_denied");

        let (status, json) = upload(
            &app,
            &[("connection", "main"), ("table", "users")],
            Some(("a.pdf", b"%PDF")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_upload_process_and_poll() {
        let app = test_app().await;
        let (status, json) = upload(
            &app,
            &[("connection", "main"), ("table", "users")],
            Some(("people.csv", b"email,name\na@x,Ann\nb@x,Bob\n")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let file_id = json["file"]["id"].as_str().unwrap().to_string();
        assert_eq!(json["file"]["status"], "pending");

        let req = request("GET", "/uploads").body(Body::empty()).unwrap();
        let (_, json) = send(&app, req).await;
        assert_eq!(json["files"].as_array().unwrap().len(), 1);

        let req = request("POST", &format!("/uploads/{}/process", file_id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"mode":"skip","identity_fields":["email"]}"#))
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = json["task_id"].as_str().unwrap().to_string();
        assert!(task_id.starts_with("task-"));

        let mut last = serde_json::Value::Null;
        for _ in 0..200 {
            let req = request("GET", &format!("/tasks/{}", task_id)).body(Body::empty()).unwrap();
            let (status, json) = send(&app, req).await;
            assert_eq!(status, StatusCode::OK);
            last = json["task"].clone();
            if last["status"] != "processing" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], "completed");
        assert_eq!(last["inserted_rows"], 2);

        let req = request("GET", "/uploads").body(Body::empty()).unwrap();
        let (_, json) = send(&app, req).await;
        assert!(json["files"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_conflicts_and_unknowns() {
        let app = test_app().await;
        let (_, json) = upload(
            &app,
            &[("connection", "main"), ("table", "users")],
            Some(("people.csv", b"email,name\na@x,Ann\n")),
        )
        .await;
        let file_id = json["file"]["id"].as_str().unwrap().to_string();

        let req = request("POST", &format!("/uploads/{}/process", file_id))
            .body(Body::from(r#"{"mode":"merge"}"#))
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_input");

        app.orchestrator
            .registry()
            .mutate(|s| {
                let task = IngestionTask::new(&file_id, "main", "main", "users", DuplicatePolicy::default(), "ann");
                s.begin_task(task, &Caller::new("ann", false))
            })
            .await
            .unwrap();

        let req = request("POST", &format!("/uploads/{}/process", file_id)).body(Body::empty()).unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "already_processing");

        let req = request("DELETE", &format!("/uploads/{}", file_id)).body(Body::empty()).unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let req = request("GET", "/tasks/task-0-deadbeef").body(Body::empty()).unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_delete_upload() {
        let app = test_app().await;
        let (_, json) = upload(
            &app,
            &[("connection", "main"), ("table", "users")],
            Some(("people.csv", b"email,name\na@x,Ann\n")),
        )
        .await;
        let file_id = json["file"]["id"].as_str().unwrap().to_string();

        let req = request("DELETE", &format!("/uploads/{}", file_id)).body(Body::empty()).unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deleted"]["id"], file_id.as_str());
        assert!(app.orchestrator.registry().file(&file_id).await.is_none());
    }

    #[test]
    fn test_error_response_status_codes() {
        assert_eq!(error_response(&TabloadError::NoFile).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            error_response(&TabloadError::AlreadyProcessing("f".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(&TabloadError::Registry("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
