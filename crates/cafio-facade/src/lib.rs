//! CAFIO retrieval façade
//!
//! HTTP surface that resolves a logical `(task, path)` pair to a shipped
//! container and a byte range, fetches/caches the container locally, and
//! serves the slice. Built as an Axum router so the worker binary can serve
//! it next to the packing pipeline.
//!
//! Endpoints:
//! - `GET /health`
//! - `GET /file/{taskId}/{*filePath}` serves raw member bytes as an attachment
//! - `GET /file-info/{taskId}/{*filePath}` returns the catalog record
//! - `GET /file-proof/{taskId}/{*filePath}` returns blob-service proof tokens

pub mod cache;
pub mod error;
pub mod handlers;
pub mod validate;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use cache::{ContainerCache, ProofCache};
use cafio_adapters::{BlobService, Catalog};
use cafio_common::WorkerConfig;
use handlers::FacadeState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Proof-cache entry lifetime.
const PROOF_TTL: Duration = Duration::from_secs(60);
/// How often the janitor sweeps expired proof entries.
const PROOF_JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the retrieval façade.
pub struct FacadeConfig {
    pub worker_id: u16,
    /// Directory for the local container cache
    pub temp_dir: PathBuf,
    /// Container download deadline
    pub download_timeout: Duration,
    /// Keep downloaded containers after serving
    pub keep_containers: bool,
    /// CORS origin allow-list
    pub allowed_origins: Vec<String>,
}

impl FacadeConfig {
    /// Derive the façade configuration from the worker configuration.
    #[must_use]
    pub fn from_worker(config: &WorkerConfig, allowed_origins: Vec<String>) -> Self {
        Self {
            worker_id: config.worker_id,
            temp_dir: config.temp_dir.clone(),
            download_timeout: config.download_timeout(),
            keep_containers: config.keep_caf_files,
            allowed_origins,
        }
    }
}

/// Build the façade router. Spawns the proof-cache janitor; call from
/// within a Tokio runtime.
pub fn router(
    catalog: Arc<dyn Catalog>,
    blob: Arc<dyn BlobService>,
    config: FacadeConfig,
) -> Router {
    let proofs = ProofCache::new(PROOF_TTL);
    proofs.spawn_janitor(PROOF_JANITOR_INTERVAL);

    let state = Arc::new(FacadeState {
        catalog,
        blob,
        containers: ContainerCache::new(config.temp_dir, config.keep_containers),
        proofs,
        worker_id: config.worker_id,
        download_timeout: config.download_timeout,
    });

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    // Matched origins are echoed back; anything else gets no CORS headers,
    // which browsers treat as a denial.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/file/{task_id}/{*file_path}", get(handlers::get_file))
        .route("/file-info/{task_id}/{*file_path}", get(handlers::file_info))
        .route("/file-proof/{task_id}/{*file_path}", get(handlers::file_proof))
        // Data routes without both parameters are validation failures, not
        // router misses.
        .route("/file", get(handlers::missing_params))
        .route("/file/{task_id}", get(handlers::missing_params))
        .route("/file-info", get(handlers::missing_params))
        .route("/file-info/{task_id}", get(handlers::missing_params))
        .route("/file-proof", get(handlers::missing_params))
        .route("/file-proof/{task_id}", get(handlers::missing_params))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
