//! Publishes finished videos to a platform through an HTTP bridge.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use vidflow_core::ExternalError;
use vidflow_jobs::{Job, Platform};

use super::{PlatformPublisher, http_client, send};

#[derive(Debug, Clone)]
pub struct HttpPlatformPublisher {
    platform: Platform,
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPlatformPublisher {
    pub fn new(platform: Platform, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            platform,
            client: http_client(timeout),
            url: url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct PublishResponse {
    post_id: Option<String>,
    id: Option<String>,
    url: Option<String>,
}

#[async_trait]
impl PlatformPublisher for HttpPlatformPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(&self, job: &Job, result_ref: &str) -> Result<Option<String>, ExternalError> {
        let payload = json!({
            "job_id": job.id.to_string(),
            "platform": self.platform.as_str(),
            "video_url": result_ref,
            "content_ref": job.content_ref,
            "category": job.category.as_str(),
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let body = send(request).await?.text().await.unwrap_or_default();
        // Bridges that answer with an empty or non-JSON body still count as published.
        let response: PublishResponse = serde_json::from_str(&body).unwrap_or_default();
        let reference = response.post_id.or(response.id).or(response.url);

        debug!(
            job_id = %job.id,
            platform = %self.platform.as_str(),
            reference = ?reference,
            "video published"
        );
        Ok(reference)
    }
}
