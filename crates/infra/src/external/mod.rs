//! Narrow interfaces to the external collaborators, plus HTTP clients for them.
//!
//! Every call returns `ExternalError::Transient` (retry with backoff) or
//! `ExternalError::Permanent` (terminal for the job or action).

pub mod http_intake;
pub mod http_publisher;
pub mod http_render;
pub mod http_webhook;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use vidflow_core::{Category, ExternalError};
use vidflow_jobs::{Job, Platform};

pub use http_intake::HttpContentIntake;
pub use http_publisher::HttpPlatformPublisher;
pub use http_render::HttpRenderService;
pub use http_webhook::HttpWebhookSender;

/// External status of a render, as reported by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStatus {
    Processing,
    Done { result_ref: String },
    Error { reason: String },
}

#[async_trait]
pub trait RenderService: Send + Sync {
    /// Start a render for the job's content. Returns the renderer's handle.
    async fn submit(&self, job: &Job) -> Result<String, ExternalError>;

    async fn check_status(&self, handle: &str) -> Result<RenderStatus, ExternalError>;
}

/// Publishes finished videos to one platform.
#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    fn platform(&self) -> Platform;

    /// Returns a platform-side reference (post id, URL) when there is one.
    async fn publish(&self, job: &Job, result_ref: &str) -> Result<Option<String>, ExternalError>;
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn notify(&self, url: &str, payload: &serde_json::Value) -> Result<(), ExternalError>;
}

/// A content item offered by the intake source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Source-side identifier, the dedup key.
    pub identifier: String,
    /// What the renderer is given.
    pub content_ref: String,
}

#[async_trait]
pub trait ContentIntake: Send + Sync {
    /// New items for a category, given the identifiers admitted most recently.
    async fn fetch_new(&self, category: &Category, recent: &[String]) -> Result<Vec<ContentItem>, ExternalError>;
}

/// 2xx is success; 408, 429 and 5xx are transient; any other status is permanent.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), ExternalError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(status_error(status, body))
    }
}

fn status_error(status: StatusCode, body: &str) -> ExternalError {
    let message = format!("HTTP {status}: {}", truncate(body, 512));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ExternalError::transient(message)
    } else {
        ExternalError::permanent(message)
    }
}

/// Transport failures are transient unless the request itself was malformed.
pub fn classify_transport(err: &reqwest::Error) -> ExternalError {
    if err.is_builder() {
        ExternalError::permanent(format!("invalid request: {err}"))
    } else if err.is_decode() {
        ExternalError::transient(format!("undecodable response: {err}"))
    } else {
        ExternalError::transient(format!("request failed: {err}"))
    }
}

/// Run an external call with a deadline; running out of time is transient.
pub async fn call_with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::transient(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Send a request and turn non-success statuses into classified errors.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ExternalError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
