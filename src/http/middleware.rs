//! Middleware translating admission decisions into HTTP responses.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{GateError, Result};
use crate::ratelimit::{AdmissionController, Policy, Reservation};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Identity used when neither a header nor a peer address is available.
pub const UNKNOWN_IDENTITY: &str = "unknown";

const RATE_LIMITED_MESSAGE: &str = "you are being rate limited";

/// JSON error body shared by all error responses.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub code: u16,
    pub message: &'static str,
}

impl ErrorBody {
    pub(crate) fn response(status: StatusCode, message: &'static str) -> Response {
        let body = ErrorBody {
            code: status.as_u16(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Where the client identity of a request comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IdentitySource {
    /// The IP address of the connected peer
    #[default]
    PeerAddr,
    /// The first value of a header set by a trusted proxy, falling back to
    /// the peer address
    Header(HeaderName),
}

impl IdentitySource {
    /// Build from the optional `server.identity_header` setting.
    pub fn from_config(header: Option<&str>) -> Result<Self> {
        match header {
            None => Ok(IdentitySource::PeerAddr),
            Some(name) => HeaderName::from_bytes(name.as_bytes())
                .map(IdentitySource::Header)
                .map_err(|e| GateError::Config(format!("invalid identity header '{}': {}", name, e))),
        }
    }

    /// Extract the client identity from a request.
    pub fn identify(&self, request: &Request) -> String {
        if let IdentitySource::Header(name) = self {
            let forwarded = request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());

            if let Some(identity) = forwarded {
                return identity.to_string();
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
    }
}

/// Middleware state protecting one route with one policy.
#[derive(Clone)]
pub struct RouteGuard {
    controller: Arc<AdmissionController>,
    policy: Policy,
    identity: IdentitySource,
}

impl RouteGuard {
    pub fn new(controller: Arc<AdmissionController>, policy: Policy, identity: IdentitySource) -> Self {
        Self {
            controller,
            policy,
            identity,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Protect every route of `router` with `guard`.
pub fn guard<S>(router: Router<S>, guard: RouteGuard) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(guard, enforce))
}

/// Admit or reject a request, always attaching the quota headers.
pub async fn enforce(State(guard): State<RouteGuard>, request: Request, next: Next) -> Response {
    let identity = guard.identity.identify(&request);
    let reservation = guard.controller.decide(&identity, &guard.policy);

    if !reservation.allowed {
        return rejection(&reservation);
    }

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &reservation);
    response
}

/// Set the `X-RateLimit-*` headers for a reservation.
pub fn apply_quota_headers(headers: &mut HeaderMap, reservation: &Reservation) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(reservation.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(reservation.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reservation.reset_timestamp()));
}

/// The `429` response for a denied reservation.
pub fn rejection(reservation: &Reservation) -> Response {
    let mut response = ErrorBody::response(StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE);
    apply_quota_headers(response.headers_mut(), reservation);
    response
}
