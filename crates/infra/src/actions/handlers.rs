//! Handlers for the built-in actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use vidflow_core::ExternalError;
use vidflow_jobs::{ActionKind, Job, Platform};

use crate::config::EndpointsConfig;
use crate::external::{HttpPlatformPublisher, HttpWebhookSender, PlatformPublisher, WebhookSender};

use super::registry::{ActionHandler, ActionOutput, ActionRegistry};

fn result_ref(job: &Job) -> Result<&str, ExternalError> {
    job.result_ref
        .as_deref()
        .ok_or_else(|| ExternalError::permanent(format!("job {} has no result to deliver", job.id)))
}

/// `publish:<platform>`: hands the finished video to a platform publisher.
pub struct PublishAction {
    publisher: Arc<dyn PlatformPublisher>,
}

impl PublishAction {
    pub fn new(publisher: Arc<dyn PlatformPublisher>) -> Self {
        Self { publisher }
    }

    pub fn platform(&self) -> Platform {
        self.publisher.platform()
    }
}

#[async_trait]
impl ActionHandler for PublishAction {
    async fn execute(&self, job: &Job) -> Result<ActionOutput, ExternalError> {
        let video = result_ref(job)?;
        let detail = self.publisher.publish(job, video).await?;
        Ok(ActionOutput { detail })
    }
}

/// `webhook`: posts the completion to the configured URL.
pub struct WebhookAction {
    sender: Arc<dyn WebhookSender>,
    url: String,
}

impl WebhookAction {
    pub fn new(sender: Arc<dyn WebhookSender>, url: impl Into<String>) -> Self {
        Self {
            sender,
            url: url.into(),
        }
    }

    pub fn payload(job: &Job) -> serde_json::Value {
        json!({
            "job_id": job.id.to_string(),
            "state": job.state.as_str(),
            "content_ref": job.content_ref,
            "category": job.category.as_str(),
            "priority": job.priority.ordinal(),
            "result_ref": job.result_ref,
        })
    }
}

#[async_trait]
impl ActionHandler for WebhookAction {
    async fn execute(&self, job: &Job) -> Result<ActionOutput, ExternalError> {
        result_ref(job)?;
        self.sender.notify(&self.url, &Self::payload(job)).await?;
        Ok(ActionOutput::with_detail(format!("delivered to {}", self.url)))
    }
}

/// Registry backed by the HTTP clients, one entry per configured endpoint.
pub fn http_registry(endpoints: &EndpointsConfig, call_timeout: Duration) -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    for platform in Platform::ALL {
        if let Some(url) = endpoints.publish_url(platform) {
            let publisher = HttpPlatformPublisher::new(platform, url, call_timeout)
                .with_api_key(endpoints.publish_api_key.clone());
            registry = registry.register(
                ActionKind::Publish(platform),
                Arc::new(PublishAction::new(Arc::new(publisher))),
            );
        }
    }

    if let Some(url) = &endpoints.webhook_url {
        let sender = HttpWebhookSender::new(call_timeout);
        registry = registry.register(ActionKind::Webhook, Arc::new(WebhookAction::new(Arc::new(sender), url.clone())));
    }

    registry
}
