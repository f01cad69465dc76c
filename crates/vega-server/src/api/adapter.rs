//! Fleet-wide control endpoints.
//!
//! The adapter power hook lets an external watcher (or the operator) tell the
//! server that the radio came back, which short-circuits every pending retry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::devices::ActionResponse;
use crate::state::SharedState;

/// Adapter power change notification.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "powered": true }))]
pub struct AdapterPowerRequest {
    /// New power state of the host radio.
    #[schema(example = true)]
    pub powered: bool,
}

/// Reconnect every active device now.
#[utoipa::path(
    post,
    path = "/api/reconnect",
    tag = "devices",
    operation_id = "reconnectAll",
    summary = "Reconnect all devices",
    description = "Resets the retry backoff of every connecting, connected or \
        reconnecting device and reconnects it immediately. Idle devices are \
        left alone.",
    responses(
        (status = 202, description = "Reconnect started", body = ActionResponse)
    )
)]
pub async fn reconnect_all(State(state): State<SharedState>) -> (StatusCode, Json<ActionResponse>) {
    state.registry().force_reconnect_all().await;
    (
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            success: true,
            message: "Reconnecting all active devices".to_string(),
        }),
    )
}

/// Report an adapter power change.
#[utoipa::path(
    post,
    path = "/api/adapter/powered",
    tag = "adapter",
    operation_id = "setAdapterPowered",
    summary = "Report adapter power state",
    description = "When the adapter powers on, every active device reconnects \
        with its backoff reset. Powering off is only logged; the affected \
        sessions fail on their own and retry.",
    request_body = AdapterPowerRequest,
    responses(
        (status = 200, description = "Notification handled", body = ActionResponse)
    )
)]
pub async fn adapter_powered(
    State(state): State<SharedState>,
    Json(request): Json<AdapterPowerRequest>,
) -> Json<ActionResponse> {
    tracing::info!(powered = request.powered, "adapter power reported");
    let message = if request.powered {
        state.registry().force_reconnect_all().await;
        "Adapter on; reconnecting active devices"
    } else {
        "Adapter off"
    };
    Json(ActionResponse {
        success: true,
        message: message.to_string(),
    })
}
