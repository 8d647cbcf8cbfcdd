//! Route handlers for the pairing API.

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::ApiError;
use crate::pairing::{Credential, PairingService};

/// Body of `POST /auth/pair`.
#[derive(Debug, Deserialize)]
pub struct PairRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

/// `POST /auth/pair`: mobile app redeems a pairing code.
pub async fn pair(
    State(service): State<PairingService>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Json<Credential>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("Invalid request body"))?;

    if req.code.is_empty() || req.device_id.is_empty() {
        return Err(ApiError::bad_request("Code and Device ID are required"));
    }

    let credential = service
        .redeem(&req.code, &req.device_id, &req.device_name)
        .await?;
    Ok(Json(credential))
}

/// `POST /auth/code`: desktop UI mints a code.
pub async fn issue_code(State(service): State<PairingService>) -> Result<Response, ApiError> {
    let code = service.issue_code().await?;
    Ok(Json(code).into_response())
}

/// `GET /auth/code`: the code currently shown on the desktop, if any.
pub async fn peek_code(State(service): State<PairingService>) -> Response {
    match service.peek_active_code().await {
        Some(code) => Json(code).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No active pairing code" })),
        )
            .into_response(),
    }
}

/// `GET /auth/status`
pub async fn status(Extension(credential): Extension<Credential>) -> Response {
    Json(json!({ "status": "valid", "token": credential })).into_response()
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(service): State<PairingService>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<Credential>, ApiError> {
    Ok(Json(service.refresh(&credential.value).await?))
}

/// `GET /auth/devices`
pub async fn list_devices(State(service): State<PairingService>) -> Json<Vec<Credential>> {
    Json(service.list_active().await)
}

/// `DELETE /auth/devices/{device_id}`
pub async fn revoke_device(
    State(service): State<PairingService>,
    Path(device_id): Path<String>,
) -> StatusCode {
    if service.revoke_device(&device_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `DELETE /auth/token`: revoke the presented credential.
pub async fn revoke_token(
    State(service): State<PairingService>,
    Extension(credential): Extension<Credential>,
) -> StatusCode {
    service.revoke(&credential.value).await;
    StatusCode::NO_CONTENT
}
