//! HTTP client for a talking-head style render API.
//!
//! `POST create_url` starts a render and answers with an `id`;
//! `GET status_url` (with `{id}` substituted) reports its `status`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use vidflow_core::ExternalError;
use vidflow_jobs::Job;

use super::{RenderService, RenderStatus, classify_transport, http_client, send};

const DEFAULT_SOURCE_URL: &str = "https://d-id-public-bucket.s3.us-west-2.amazonaws.com/alice.jpg";

#[derive(Debug, Clone)]
pub struct HttpRenderService {
    client: Client,
    create_url: String,
    status_url: String,
    api_key: Option<String>,
    source_url: String,
}

impl HttpRenderService {
    pub fn new(create_url: impl Into<String>, status_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            create_url: create_url.into(),
            status_url: status_url.into(),
            api_key: None,
            source_url: DEFAULT_SOURCE_URL.to_string(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = source_url.into();
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StatusResponse {
    pub status: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<serde_json::Value>,
}

/// Map the provider's status vocabulary onto `RenderStatus`.
///
/// Unknown statuses count as still processing; the poller's timeout bounds
/// how long that can last.
pub(crate) fn map_provider_status(response: StatusResponse) -> Result<RenderStatus, ExternalError> {
    let status = response.status.unwrap_or_default().to_ascii_lowercase();
    match status.as_str() {
        "done" | "ready" | "completed" => match response.result_url {
            Some(url) if !url.is_empty() => Ok(RenderStatus::Done { result_ref: url }),
            _ => Err(ExternalError::transient(format!(
                "render reported '{status}' without a result url"
            ))),
        },
        "error" | "rejected" => {
            let reason = match response.error {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Object(map)) => map
                    .get("description")
                    .or_else(|| map.get("message"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
                Some(other) => other.to_string(),
                None => format!("render {status}"),
            };
            Ok(RenderStatus::Error { reason })
        }
        _ => Ok(RenderStatus::Processing),
    }
}

#[async_trait]
impl RenderService for HttpRenderService {
    async fn submit(&self, job: &Job) -> Result<String, ExternalError> {
        let payload = json!({
            "source_url": self.source_url,
            "script": {
                "type": "text",
                "input": job.content_ref,
            },
            "config": { "fluent": false },
        });

        let request = self.authorize(self.client.post(&self.create_url)).json(&payload);
        let response: CreateResponse = send(request)
            .await?
            .json()
            .await
            .map_err(|e| classify_transport(&e))?;

        let handle = response
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExternalError::permanent("render service accepted the job without an id"))?;

        debug!(job_id = %job.id, handle = %handle, "render submitted");
        Ok(handle)
    }

    async fn check_status(&self, handle: &str) -> Result<RenderStatus, ExternalError> {
        let url = self.status_url.replace("{id}", handle);
        let request = self.authorize(self.client.get(url));
        let response: StatusResponse = send(request)
            .await?
            .json()
            .await
            .map_err(|e| classify_transport(&e))?;

        map_provider_status(response)
    }
}
