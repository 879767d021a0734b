//! HTTP surface over [`JobService`].
//!
//! Endpoints:
//! - GET  /                             - service name, version, status
//! - POST /documents/process            - multipart upload, returns a task id
//! - GET  /documents/:task_id/status    - current task status
//! - GET  /documents/:task_id/download  - zip bundle of a completed task

use crate::config::{ProcessingOptions, TableFormat};
use crate::error::DocBundleError;
use crate::job::{JobId, JobStatus};
use crate::service::JobService;
use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Multipart framing allowance on top of the configured upload limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

/// Request-level failure.
#[derive(Debug)]
pub enum ApiError {
    Service(DocBundleError),
    /// Malformed multipart body or missing `file` field.
    BadRequest(String),
    /// The body exceeded the transport limit before it could be parsed.
    Multipart(StatusCode, String),
}

impl From<DocBundleError> for ApiError {
    fn from(e: DocBundleError) -> Self {
        ApiError::Service(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Multipart(e.status(), e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Multipart(status, msg) => {
                let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
                    "FILE_TOO_LARGE"
                } else {
                    "BAD_REQUEST"
                };
                (status, code, msg)
            }
            ApiError::Service(e) => {
                let (status, code) = match &e {
                    DocBundleError::FileTooLarge { .. } => {
                        (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE")
                    }
                    DocBundleError::UnsupportedFileType { .. } => {
                        (StatusCode::BAD_REQUEST, "UNSUPPORTED_FILE_TYPE")
                    }
                    DocBundleError::InvalidOption { .. } => {
                        (StatusCode::BAD_REQUEST, "INVALID_OPTION")
                    }
                    DocBundleError::NotReady { .. } => {
                        (StatusCode::BAD_REQUEST, "TASK_NOT_COMPLETED")
                    }
                    DocBundleError::NotFound { .. } => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
                    DocBundleError::ShuttingDown => {
                        (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN")
                    }
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
                };
                (status, code, e.to_string())
            }
        };
        debug!(%status, code, "Request failed: {}", message);
        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router.
pub fn router(service: Arc<JobService>) -> Router {
    let body_limit = usize::try_from(service.config().max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/", get(root))
        .route("/documents/process", post(process_document))
        .route("/documents/:task_id/status", get(task_status))
        .route("/documents/:task_id/download", get(download_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve `service` on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    service: Arc<JobService>,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /
async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

/// POST /documents/process
async fn process_document(
    State(service): State<Arc<JobService>>,
    mut multipart: Multipart,
) -> Result<Json<TaskResponse>, ApiError> {
    let mut upload: Option<(String, axum::body::Bytes)> = None;
    let mut options = ProcessingOptions::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await?;
                upload = Some((name, data));
            }
            "force_ocr" => {
                let value = field.text().await?;
                options.force_ocr = parse_flag("force_ocr", &value)?;
            }
            "table_format" => {
                let value = field.text().await?;
                options.table_format = value.parse::<TableFormat>()?;
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (file_name, data) =
        upload.ok_or_else(|| ApiError::BadRequest("Missing multipart field 'file'".into()))?;
    let task_id = service.submit(&file_name, &data, options).await?;

    Ok(Json(TaskResponse {
        task_id,
        status: JobStatus::Pending,
        message: "Document uploaded successfully. Processing started.".to_string(),
    }))
}

/// GET /documents/:task_id/status
async fn task_status(
    State(service): State<Arc<JobService>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let id = parse_task_id(&task_id)?;
    let meta = service.status(&id)?;
    Ok(Json(TaskStatusResponse {
        task_id: meta.id,
        status: meta.status,
        message: format!("Task is {}", meta.status),
        error: meta.error,
    }))
}

/// GET /documents/:task_id/download
async fn download_result(
    State(service): State<Arc<JobService>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_task_id(&task_id)?;
    let archive = service.download(&id)?;
    let file = tokio::fs::File::open(&archive).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DocBundleError::NotFound { id: id.to_string() }
        } else {
            DocBundleError::Internal(format!("Failed to open '{}': {e}", archive.display()))
        }
    })?;
    let body = Body::from_stream(ReaderStream::new(file));

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"result_{id}.zip\""),
        ),
    ];
    Ok((headers, body).into_response())
}

fn parse_task_id(raw: &str) -> Result<JobId, DocBundleError> {
    raw.parse()
        .map_err(|_| DocBundleError::NotFound { id: raw.to_string() })
}

fn parse_flag(option: &str, value: &str) -> Result<bool, DocBundleError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" | "off" => Ok(false),
        "true" | "1" | "yes" | "on" => Ok(true),
        _ => Err(DocBundleError::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
        }),
    }
}
