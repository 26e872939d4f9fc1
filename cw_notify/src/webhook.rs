//! ABOUTME: Webhook sink that POSTs each engine event as JSON
//! ABOUTME: Deliveries run on spawned tasks; failures are logged and dropped

use std::time::Duration;

use cw_core::{Error, Result};
use reqwest::Client;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use url::Url;

use crate::{EngineEvent, NotificationSink};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: Url,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid webhook URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Webhook URL must use http or https: {}",
                url
            )));
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Deliver a single event, waiting for the response
    pub async fn deliver(&self, event: &EngineEvent) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .map_err(|e| Error::CapabilityFailure(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::CapabilityFailure(format!(
                "Webhook returned status {}",
                status
            )));
        }

        debug!(kind = event.kind(), %status, "Webhook delivered");
        Ok(())
    }
}

impl NotificationSink for WebhookSink {
    fn publish(&self, event: EngineEvent) {
        let Ok(handle) = Handle::try_current() else {
            warn!(kind = event.kind(), "No runtime available; webhook event dropped");
            return;
        };

        let sink = self.clone();
        handle.spawn(async move {
            if let Err(e) = sink.deliver(&event).await {
                warn!(kind = event.kind(), url = %sink.url, "Webhook delivery failed: {}", e);
            }
        });
    }
}
