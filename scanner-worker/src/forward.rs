//! Handing verified addresses to whatever consumes them downstream.
use std::time;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::{DispatchError, WorkerError};

/// A downstream consumer of verified addresses.
///
/// Failures are returned to the caller and never retried: the registry has already
/// marked the address as dispatched by the time `forward` is called.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, address: &str) -> Result<(), DispatchError>;
}

/// Only logs addresses. Used when no forward url is configured.
pub struct LogForwarder {}

#[async_trait]
impl Forwarder for LogForwarder {
    async fn forward(&self, address: &str) -> Result<(), DispatchError> {
        info!(address, "forwarding address");
        Ok(())
    }
}

#[derive(Serialize)]
struct ForwardPayload<'a> {
    address: &'a str,
}

/// POSTs every address as JSON to a webhook.
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookForwarder {
    pub fn new(url: &str, timeout: time::Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .user_agent("Token Address Scanner")
            .timeout(timeout)
            .build()?;
        let url = reqwest::Url::parse(url).map_err(WorkerError::ForwardUrlError)?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Forwarder for WebhookForwarder {
    async fn forward(&self, address: &str) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&ForwardPayload { address })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::StatusError(status));
        }

        Ok(())
    }
}
