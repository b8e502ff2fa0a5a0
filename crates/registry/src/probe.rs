use async_trait::async_trait;

use crate::endpoint::ServiceEndpoint;

/// Checks whether one endpoint is currently serving.
///
/// The registry applies the configured per-probe timeout around `check`;
/// implementations just answer.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, endpoint: &ServiceEndpoint) -> bool;
}

/// HTTP probe: GET `{endpoint}/health`, healthy on any 2xx.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, endpoint: &ServiceEndpoint) -> bool {
        match self.client.get(endpoint.health_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(
                    endpoint = %endpoint.registration_id(),
                    error = %err,
                    "health probe failed"
                );
                false
            }
        }
    }
}
