//! HTTP surface for the pairing service.
//!
//! Code issuance is restricted to loopback peers, pairing is public, and
//! everything else requires a bearer credential. Serve the router with
//! `into_make_service_with_connect_info::<SocketAddr>()` so the loopback
//! guard can see peer addresses.

pub mod auth;
pub mod handlers;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

pub use auth::{extract_bearer, is_local_request, require_bearer, require_loopback};

use crate::error::PairingError;
use crate::pairing::PairingService;

/// Build the `/auth` router around a shared service.
pub fn router(service: PairingService) -> Router {
    let local = Router::new()
        .route(
            "/auth/code",
            post(handlers::issue_code).get(handlers::peek_code),
        )
        .route_layer(middleware::from_fn(require_loopback));

    let protected = Router::new()
        .route("/auth/status", get(handlers::status))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/devices", get(handlers::list_devices))
        .route("/auth/devices/{device_id}", delete(handlers::revoke_device))
        .route("/auth/token", delete(handlers::revoke_token))
        .route_layer(middleware::from_fn_with_state(
            service.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/auth/pair", post(handlers::pair))
        .merge(local)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// JSON error response: `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            code: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        let status = if err.is_auth_failure() {
            StatusCode::UNAUTHORIZED
        } else {
            tracing::error!(error = %err, "Pairing service failure");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
            code: Some(err.code()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.code {
            Some(code) => json!({ "error": self.message, "code": code }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}
