//! Device API endpoints.
//!
//! Provides endpoints for managing the configured detectors and for driving
//! their connections by hand.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use vega_core::{is_valid_mac_address, ConnectionState, DeviceConfig, DeviceSnapshot};

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the devices router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_devices).post(create_device))
        .route(
            "/{id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/{id}/reconnect", post(reconnect_device))
        .route("/{id}/disconnect", post(disconnect_device))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// All configured devices with their live state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceListResponse {
    /// Devices, oldest first.
    pub devices: Vec<DeviceSnapshot>,

    /// How many are `connected`.
    #[schema(example = 1)]
    pub connected: usize,
}

/// Request to add a device.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "52:43:06:60:12:34",
    "name": "Kitchen",
    "color": "#4CAF50"
}))]
pub struct CreateDeviceRequest {
    /// Bluetooth MAC address (XX:XX:XX:XX:XX:XX format).
    #[schema(example = "52:43:06:60:12:34")]
    pub address: String,

    /// Display name.
    #[schema(example = "Kitchen")]
    pub name: String,

    /// Display color (`#RRGGBB`). Defaults to green.
    #[schema(example = "#4CAF50")]
    pub color: Option<String>,

    /// Whether the device should be kept connected. Defaults to true.
    #[schema(example = true)]
    pub enabled: Option<bool>,
}

/// Partial update of a device. Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "enabled": false
}))]
pub struct UpdateDeviceRequest {
    /// New Bluetooth MAC address. Changing it reconnects the device.
    pub address: Option<String>,

    /// New display name.
    pub name: Option<String>,

    /// New display color.
    pub color: Option<String>,

    /// Enable or disable the device.
    pub enabled: Option<bool>,
}

/// Outcome of a control action.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionResponse {
    /// Whether the action was accepted.
    pub success: bool,

    /// What the server did.
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

fn check_address(address: &str) -> ApiResult<()> {
    if is_valid_mac_address(address.trim()) {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            "invalid_address",
            "Bluetooth address must be in format XX:XX:XX:XX:XX:XX",
        ))
    }
}

async fn current(state: &SharedState, id: Uuid) -> ApiResult<DeviceSnapshot> {
    state
        .registry()
        .snapshot(id)
        .await
        .ok_or_else(|| vega_core::VegaError::DeviceNotFound(id).into())
}

/// List configured devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List devices",
    description = "Returns every configured detector with its connection state, \
        status text and last reading.",
    responses(
        (status = 200, description = "Devices listed", body = DeviceListResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DeviceListResponse> {
    let devices = state.registry().snapshots().await;
    let connected = devices
        .iter()
        .filter(|d| d.state == ConnectionState::Connected)
        .count();
    Json(DeviceListResponse { devices, connected })
}

/// Add a device.
#[utoipa::path(
    post,
    path = "/api/devices",
    tag = "devices",
    operation_id = "createDevice",
    summary = "Add a device",
    description = "Registers and persists a detector. Enabled devices start \
        connecting immediately.",
    request_body = CreateDeviceRequest,
    responses(
        (status = 201, description = "Device added", body = DeviceSnapshot),
        (status = 400, description = "Invalid address, name or color", body = super::error::ErrorResponse)
    )
)]
pub async fn create_device(
    State(state): State<SharedState>,
    Json(request): Json<CreateDeviceRequest>,
) -> ApiResult<(StatusCode, Json<DeviceSnapshot>)> {
    check_address(&request.address)?;

    let mut config = DeviceConfig::new(request.address, request.name)
        .with_enabled(request.enabled.unwrap_or(true));
    if let Some(color) = request.color {
        config = config.with_color(color);
    }

    let snapshot = state.registry().add_device(config, true).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// Get one device.
#[utoipa::path(
    get,
    path = "/api/devices/{id}",
    tag = "devices",
    operation_id = "getDevice",
    summary = "Get a device",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device found", body = DeviceSnapshot),
        (status = 404, description = "Unknown device", body = super::error::ErrorResponse)
    )
)]
pub async fn get_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeviceSnapshot>> {
    current(&state, id).await.map(Json)
}

/// Update a device.
#[utoipa::path(
    put,
    path = "/api/devices/{id}",
    tag = "devices",
    operation_id = "updateDevice",
    summary = "Update a device",
    description = "Applies a partial update. Disabling disconnects the device, \
        enabling connects it, and an address change reconnects it. Name and \
        color changes leave the connection alone.",
    params(("id" = Uuid, Path, description = "Device id")),
    request_body = UpdateDeviceRequest,
    responses(
        (status = 200, description = "Device updated", body = DeviceSnapshot),
        (status = 400, description = "Invalid field", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown device", body = super::error::ErrorResponse)
    )
)]
pub async fn update_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateDeviceRequest>,
) -> ApiResult<Json<DeviceSnapshot>> {
    let mut config = current(&state, id).await?.device;
    if let Some(address) = request.address {
        check_address(&address)?;
        config = config.with_address(address);
    }
    if let Some(name) = request.name {
        config = config.with_name(name);
    }
    if let Some(color) = request.color {
        config = config.with_color(color);
    }
    if let Some(enabled) = request.enabled {
        config = config.with_enabled(enabled);
    }

    let snapshot = state.registry().update_device(config).await?;
    Ok(Json(snapshot))
}

/// Remove a device.
#[utoipa::path(
    delete,
    path = "/api/devices/{id}",
    tag = "devices",
    operation_id = "deleteDevice",
    summary = "Remove a device",
    description = "Disconnects the device, cancels any pending retry and \
        deletes it from storage.",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device removed"),
        (status = 404, description = "Unknown device", body = super::error::ErrorResponse)
    )
)]
pub async fn delete_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.registry().remove_device(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reconnect one device now.
#[utoipa::path(
    post,
    path = "/api/devices/{id}/reconnect",
    tag = "devices",
    operation_id = "reconnectDevice",
    summary = "Reconnect a device",
    description = "Resets the retry backoff and reconnects immediately. An idle \
        device is connected instead.",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 202, description = "Reconnect started", body = ActionResponse),
        (status = 404, description = "Unknown device", body = super::error::ErrorResponse)
    )
)]
pub async fn reconnect_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ActionResponse>)> {
    let snapshot = current(&state, id).await?;
    let message = if snapshot.state.is_active() {
        state.registry().force_reconnect(id).await?;
        "Reconnecting"
    } else {
        state.registry().connect(id).await?;
        "Connecting"
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            success: true,
            message: message.to_string(),
        }),
    ))
}

/// Disconnect one device.
#[utoipa::path(
    post,
    path = "/api/devices/{id}/disconnect",
    tag = "devices",
    operation_id = "disconnectDevice",
    summary = "Disconnect a device",
    description = "Closes the session and cancels any pending retry. The device \
        stays disconnected until reconnected or re-enabled.",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device disconnected", body = DeviceSnapshot),
        (status = 404, description = "Unknown device", body = super::error::ErrorResponse)
    )
)]
pub async fn disconnect_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeviceSnapshot>> {
    state.registry().disconnect(id).await?;
    current(&state, id).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_defaults() {
        let json = r#"{"address": "52:43:06:60:12:34", "name": "Kitchen"}"#;
        let request: CreateDeviceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.color, None);
        assert_eq!(request.enabled, None);
    }

    #[test]
    fn test_check_address() {
        assert!(check_address("52:43:06:60:12:34").is_ok());
        assert!(check_address(" 52:43:06:60:12:34 ").is_ok());
        assert!(matches!(
            check_address("52-43-06"),
            Err(ApiError::BadRequest { .. })
        ));
    }
}
