//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `devices` - Detector configuration and per-device connection control
//! - `adapter` - Fleet-wide reconnect and adapter power notifications
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod adapter;
pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                      - Health check
/// /swagger-ui                  - Interactive API docs
/// /api
/// ├── /devices                 - List / add devices
/// │   └── /{id}                - Get / update / remove one device
/// │       ├── /reconnect       - Reconnect now
/// │       └── /disconnect      - Disconnect
/// ├── /reconnect               - Reconnect every active device
/// ├── /adapter/powered         - Adapter power notification
/// └── /openapi.json            - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/devices", devices::router())
                .route("/reconnect", post(adapter::reconnect_all))
                .route("/adapter/powered", post(adapter::adapter_powered))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/swagger-ui/openapi.json", openapi::ApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
