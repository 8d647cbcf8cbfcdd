//! Bearer token and loopback middleware.

use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::ApiError;
use crate::pairing::PairingService;

/// Pull a bearer token from the `Authorization` header or `?token=`.
///
/// The header wins when both are present. Browser `EventSource` and
/// WebSocket clients can't set headers, hence the query fallback.
pub fn extract_bearer(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get("authorization")
        && let Ok(value) = value.to_str()
        && let Some((scheme, token)) = value.trim().split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }

    uri.query()?
        .split('&')
        .filter_map(|pair| pair.strip_prefix("token="))
        .find(|raw| !raw.is_empty())
        .map(|raw| {
            urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        })
}

/// Reject requests without a valid credential. The validated
/// [`Credential`](crate::pairing::Credential) is stored in the request
/// extensions for handlers.
///
/// `OPTIONS` passes through untouched for CORS preflight.
pub async fn require_bearer(
    State(service): State<PairingService>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let Some(token) = extract_bearer(request.headers(), request.uri()) else {
        return ApiError::unauthorized("Authentication required").into_response();
    };

    match service.validate(&token).await {
        Ok(credential) => {
            request.extensions_mut().insert(credential);
            next.run(request).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Only let through requests from the local machine.
pub async fn require_loopback(request: Request, next: Next) -> Response {
    if is_local_request(&request) {
        return next.run(request).await;
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "Only available from localhost" })),
    )
        .into_response()
}

/// Whether the peer address is loopback and no proxy forwarded the request.
///
/// Requires the server to be run with
/// `into_make_service_with_connect_info::<SocketAddr>()`; without peer info
/// the request is treated as remote.
pub fn is_local_request<B>(request: &axum::http::Request<B>) -> bool {
    if request.headers().contains_key("x-forwarded-for") {
        return false;
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|ConnectInfo(addr)| addr.ip().to_canonical().is_loopback())
}
