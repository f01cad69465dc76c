//! OpenAPI specification generation for the vega API.
//!
//! The document is served at `/api/openapi.json`, browsable through Swagger UI
//! at `/swagger-ui`, and written to disk by the `gen-openapi` binary.

use axum::Json;
use utoipa::OpenApi;
use vega_core::{ConnectionState, DeviceConfig, DeviceSnapshot, Reading};

use super::adapter::AdapterPowerRequest;
use super::devices::{
    ActionResponse, CreateDeviceRequest, DeviceListResponse, UpdateDeviceRequest,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a string (for writing to file).
/// Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for vega.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "vega API",
        version = "0.1.0",
        description = r#"
# vega API

vega keeps BLE radiation detectors connected and streams their dose rate and
count rate.

## Overview

Each configured detector runs its own connection state machine:

- `disconnected` - idle, nothing scheduled
- `connecting` - opening the link or running the init handshake
- `connected` - polling telemetry once per second
- `reconnecting` - waiting out a linear backoff (2s per attempt, max 60s)
- `error` - the configuration cannot work (e.g. a malformed address)

Transient read failures are tolerated until three happen in a row or no data
arrives for 30 seconds; then the device reconnects.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local vega server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and service status"
        ),
        (
            name = "devices",
            description = "Detector configuration and connection control"
        ),
        (
            name = "adapter",
            description = "Host radio notifications"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Device endpoints
        super::devices::list_devices,
        super::devices::create_device,
        super::devices::get_device,
        super::devices::update_device,
        super::devices::delete_device,
        super::devices::reconnect_device,
        super::devices::disconnect_device,
        // Fleet endpoints
        super::adapter::reconnect_all,
        super::adapter::adapter_powered,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Device types
            ConnectionState,
            DeviceConfig,
            DeviceSnapshot,
            Reading,
            DeviceListResponse,
            CreateDeviceRequest,
            UpdateDeviceRequest,
            ActionResponse,
            // Adapter types
            AdapterPowerRequest,
        )
    )
)]
pub struct ApiDoc;
