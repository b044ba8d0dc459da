//! Axum handlers for the retrieval façade
//!
//! Resolution for `/file`: catalog lookup → cached/downloaded container →
//! member slice. The catalog is authoritative: a record whose member is
//! missing from its container is an internal error, not a 404.

use crate::cache::{ContainerCache, ProofCache};
use crate::error::FacadeError;
use crate::validate::validate_request;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cafio_adapters::{BlobService, Catalog, CatalogRecord};
use cafio_archive::CafReader;
use cafio_common::member_path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

type Result<T> = std::result::Result<T, FacadeError>;

/// Shared state for façade handlers.
pub struct FacadeState {
    pub catalog: Arc<dyn Catalog>,
    pub blob: Arc<dyn BlobService>,
    pub containers: ContainerCache,
    pub proofs: ProofCache,
    pub worker_id: u16,
    pub download_timeout: Duration,
}

impl FacadeState {
    async fn lookup(&self, task_id: &str, file_path: &str) -> Result<CatalogRecord> {
        self.catalog
            .lookup(task_id, file_path)
            .await
            .map_err(|e| {
                error!(task_id, file_path, error = %e, "catalog lookup failed");
                FacadeError::internal("Catalog lookup failed").with_context(task_id, file_path)
            })?
            .ok_or_else(|| {
                FacadeError::not_found("File not found").with_context(task_id, file_path)
            })
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(rename = "workerId")]
    worker_id: u16,
    timestamp: DateTime<Utc>,
}

/// GET /health
pub async fn health(State(state): State<Arc<FacadeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        worker_id: state.worker_id,
        timestamp: Utc::now(),
    })
}

/// GET /file/{taskId}/{*filePath}
///
/// Streams the member's raw bytes as an attachment.
pub async fn get_file(
    State(state): State<Arc<FacadeState>>,
    Path((task_id, file_path)): Path<(String, String)>,
) -> Result<Response> {
    validate_request(&task_id, &file_path)?;
    let record = state.lookup(&task_id, &file_path).await?;

    let local = state
        .containers
        .fetch(state.blob.as_ref(), &record.bundle_id, state.download_timeout)
        .await
        .map_err(|e| {
            // The catalog asserted the container exists, so every fetch
            // failure (absent, timeout, corrupt) is an internal error.
            error!(container = record.bundle_id, error = %e, "container fetch failed");
            FacadeError::internal("Failed to fetch container")
                .with_message(e.to_string())
                .with_context(&task_id, &file_path)
        })?;

    let member = member_path(&task_id, &file_path);
    let slice_path = local.clone();
    let slice_member = member.clone();
    let data = tokio::task::spawn_blocking(move || {
        let mut reader = CafReader::open(&slice_path);
        reader.load_index()?;
        reader.extract(&slice_member)
    })
    .await
    .map_err(|e| FacadeError::internal("Extraction task failed").with_message(e.to_string()))?
    .map_err(|e| {
        // The catalog asserted presence; a missing member is corruption,
        // not a retrievable 404.
        error!(member, container = record.bundle_id, error = %e, "extraction failed");
        FacadeError::internal("Failed to extract file from container")
            .with_message(e.to_string())
            .with_context(&task_id, &file_path)
    })?;

    state.containers.finish(&local).await;

    let basename = file_path.rsplit('/').next().unwrap_or(&file_path);
    debug!(member, bytes = data.len(), "serving file");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, data.len().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{basename}\""),
            ),
        ],
        data,
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoResponse {
    file_path: String,
    task_id: String,
    bundle_id: String,
    js_worker_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// GET /file-info/{taskId}/{*filePath}
pub async fn file_info(
    State(state): State<Arc<FacadeState>>,
    Path((task_id, file_path)): Path<(String, String)>,
) -> Result<Json<FileInfoResponse>> {
    validate_request(&task_id, &file_path)?;
    let record = state.lookup(&task_id, &file_path).await?;

    Ok(Json(FileInfoResponse {
        file_path: record.file_path,
        task_id: record.task_id,
        bundle_id: record.bundle_id,
        js_worker_id: record.js_worker_id,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }))
}

#[derive(Serialize)]
pub struct ProofResponse {
    proofs: Vec<String>,
}

/// GET /file-proof/{taskId}/{*filePath}
pub async fn file_proof(
    State(state): State<Arc<FacadeState>>,
    Path((task_id, file_path)): Path<(String, String)>,
) -> Result<Json<ProofResponse>> {
    validate_request(&task_id, &file_path)?;
    let record = state.lookup(&task_id, &file_path).await?;

    let key = (record.bundle_id.clone(), file_path.clone(), task_id.clone());
    if let Some(proofs) = state.proofs.get(&key) {
        debug!(container = record.bundle_id, "proof cache hit");
        return Ok(Json(ProofResponse { proofs }));
    }

    let proofs = state
        .blob
        .get_proofs(&record.bundle_id)
        .await
        .map_err(|e| {
            error!(container = record.bundle_id, error = %e, "proof fetch failed");
            FacadeError::from(e).with_context(&task_id, &file_path)
        })?;

    state.proofs.insert(key, proofs.clone());
    Ok(Json(ProofResponse { proofs }))
}

/// Handler for data routes hit without both path parameters.
pub async fn missing_params() -> FacadeError {
    FacadeError::bad_request("Missing taskId or filePath")
}
