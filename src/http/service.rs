//! Admission service routes.
//!
//! Each configured policy is exposed at `/v1/admission/{policy}` behind the
//! rate limit middleware, so a web server or a forward-auth proxy can ask
//! whether the calling client may proceed with the operation that policy
//! protects.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::middleware::{self, ErrorBody, IdentitySource, RouteGuard};
use crate::ratelimit::{AdmissionController, PolicySet};

/// Shared state of the admission service.
#[derive(Clone)]
pub struct AppState {
    controller: Arc<AdmissionController>,
    policies: Arc<PolicySet>,
    identity: IdentitySource,
}

impl AppState {
    pub fn new(
        controller: Arc<AdmissionController>,
        policies: PolicySet,
        identity: IdentitySource,
    ) -> Self {
        Self {
            controller,
            policies: Arc::new(policies),
            identity,
        }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    stored_buckets: usize,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let mut admission = Router::new();

    for policy in state.policies.iter() {
        let guard = RouteGuard::new(
            Arc::clone(&state.controller),
            policy.clone(),
            state.identity.clone(),
        );
        let route = Router::new().route(&format!("/v1/admission/{}", policy.name()), any(admitted));
        admission = admission.merge(middleware::guard(route, guard));
    }

    info!(policies = state.policies.len(), "Admission routes registered");

    Router::new()
        .route("/health", get(health))
        .route("/v1/admission/{policy}", any(unknown_policy))
        .merge(admission)
        .with_state(state)
}

/// Reached only when the middleware admitted the request.
async fn admitted() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[instrument(skip_all)]
async fn unknown_policy(Path(policy): Path<String>) -> Response {
    debug!(policy = %policy, "Admission requested for unknown policy");
    ErrorBody::response(StatusCode::NOT_FOUND, "unknown policy")
}

#[instrument(skip_all)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        stored_buckets: state.controller.stored_buckets(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::{LIMIT_HEADER, REMAINING_HEADER};
    use crate::ratelimit::default_rules;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Method, Request};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let policies = PolicySet::from_rules(&default_rules()).unwrap();
        AppState::new(
            Arc::new(AdmissionController::new()),
            policies,
            IdentitySource::PeerAddr,
        )
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 50000))));
        request
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_allowed() {
        let app = router(state());

        let response = app
            .oneshot(request(Method::POST, "/v1/admission/create_link"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[LIMIT_HEADER], "3");
        assert_eq!(response.headers()[REMAINING_HEADER], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_rate_limited() {
        let app = router(state());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/v1/admission/login"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/v1/admission/login"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"code": 429, "message": "you are being rate limited"})
        );

        // Other operations keep their own budget
        let response = app
            .oneshot(request(Method::GET, "/v1/admission/list_links"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_policy() {
        let app = router(state());

        let response = app
            .oneshot(request(Method::GET, "/v1/admission/upload"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"code": 404, "message": "unknown policy"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_stored_buckets() {
        let state = state();
        let app = router(state.clone());

        app.clone()
            .oneshot(request(Method::GET, "/v1/admission/get_link"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["stored_buckets"], 1);
        assert_eq!(state.controller().tracked_clients(), 1);

        // Idle buckets count until the sweep reclaims them
        tokio::time::advance(state.controller().entry_lifetime() + Duration::from_secs(1)).await;

        let json = json_body(
            app.oneshot(request(Method::GET, "/health"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["stored_buckets"], 1);
        assert_eq!(state.controller().tracked_clients(), 0);
    }
}
