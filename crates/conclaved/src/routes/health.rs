//! Health check endpoint.

use axum::Json;
use serde::Serialize;

use conclave_common::constants::PROTOCOL_VERSION;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{app, call};
    use crate::handler::tests::test_handler;
    use crate::services::ServiceRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health() {
        let handler = Arc::new(test_handler("health", ServiceRegistry::default()));
        let (status, body) = call(
            app(handler),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["protocol"], "1.0");
    }
}
