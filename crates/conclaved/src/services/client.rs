//! JSON-over-HTTP client shared by the local service clients.

use std::time::Duration;

use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use conclave_common::ErrorResponse;

use super::ServiceError;

#[derive(Clone, Debug)]
pub(crate) struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub(crate) fn new(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let resp = self.send(Method::GET, path, None::<&()>).await?;
        Ok(resp.json().await?)
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let resp = self.send(Method::POST, path, Some(body)).await?;
        Ok(resp.json().await?)
    }

    pub(crate) async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ServiceError> {
        self.send(Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        self.send(Method::DELETE, path, None::<&()>).await?;
        Ok(())
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ServiceError> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(method = %method, url = %url, "Service request");
        let resp = request.send().await?;
        error_for_status(resp).await
    }
}

/// Turn a non-2xx response into [`ServiceError::Status`], keeping the
/// remote error text when it sent one.
pub(crate) async fn error_for_status(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or_else(|_| {
            if text.is_empty() {
                status.to_string()
            } else {
                text
            }
        });

    Err(ServiceError::Status {
        status: status.as_u16(),
        message,
    })
}
