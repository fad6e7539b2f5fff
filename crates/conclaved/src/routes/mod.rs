//! HTTP route handlers for the peer-facing API.

use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

use conclave_common::{ConclaveError, ErrorResponse};

use crate::state::AppState;

mod health;
mod services;
mod session;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/1.0/session", get(session::get_session))

        // Session endpoints (passphrase HMAC, or a trusted certificate to stop)
        .route("/1.0/session/join", post(session::join_intent))
        .route("/1.0/session/stop", put(session::stop_session))

        // Service endpoints (trusted client certificate)
        .route("/1.0/services", put(services::join_services))
        .route("/1.0/services/{service}/tokens", post(services::issue_token))
        .route("/1.0/services/{service}/members", get(services::cluster_members))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body and status for a failed request
#[derive(Debug)]
pub struct ApiError(ConclaveError);

impl<E: Into<ConclaveError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }

        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response();

        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::handler::Handler;

    pub(crate) fn app(handler: Arc<Handler>) -> Router {
        create_router(AppState::with_handler(AppConfig::default(), handler))
    }

    /// Send a request and return the status and JSON body
    pub(crate) async fn call(
        app: Router,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[test]
    fn test_retryable_errors_carry_retry_after() {
        let response = ApiError::from(ConclaveError::Network("unreachable".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");

        let response = ApiError::from(ConclaveError::NoActiveSession).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
