//! HTTP API server for blockjobd.
//!
//! This module provides an HTTP API for starting, watching and finishing
//! block jobs on the guest's disks.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! blockjobd serve --config /etc/blockjobd/config.toml
//!
//! # Copy a disk and pivot to the copy once it is ready
//! curl -X POST http://localhost:8089/api/v1/disks/vda/copy \
//!   -H "Content-Type: application/json" \
//!   -d '{"destination": "/images/vda-copy.qcow2"}'
//! curl -X POST http://localhost:8089/api/v1/disks/vda/abort \
//!   -H "Content-Type: application/json" \
//!   -d '{"pivot": true}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use state::ApiState;

/// Requests taking longer than this are answered with 408.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    let health_route = Router::new().route("/health", get(handlers::health::health));

    let disk_routes = Router::new()
        .route("/", get(handlers::disks::list_disks))
        .route("/:disk", get(handlers::disks::get_disk))
        .route("/:disk/job", get(handlers::jobs::get_job))
        .route("/:disk/pull", post(handlers::jobs::start_pull))
        .route("/:disk/commit", post(handlers::jobs::start_commit))
        .route("/:disk/copy", post(handlers::jobs::start_copy))
        .route("/:disk/abort", post(handlers::jobs::abort_job))
        .route("/:disk/speed", post(handlers::jobs::set_speed))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let api_v1 = Router::new().nest("/disks", disk_routes);

    // Local management tooling only
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:8089"),
            HeaderValue::from_static("http://127.0.0.1:8089"),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
