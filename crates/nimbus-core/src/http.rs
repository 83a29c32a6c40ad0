//! Outbound HTTP port used by the cron dispatcher and webhook
//! subscriptions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::backend::{BackendError, BackendResult};

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    /// A JSON `POST`.
    pub fn post_json(url: impl Into<String>, body: String, timeout: Duration) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> BackendResult<HttpResponse>;
}

/// `reqwest`-backed client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> BackendResult<HttpResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| BackendError::Failed(format!("invalid method {}: {e}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                BackendError::Unavailable(e.to_string())
            } else {
                BackendError::Failed(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}
