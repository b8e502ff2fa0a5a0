use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default probe interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-probe timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default continuous-failure grace before eviction.
const DEFAULT_DEREGISTER_AFTER: Duration = Duration::from_secs(60);

/// A network address advertising one service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub address: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(service: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.url())
    }

    /// Stable registration id for this instance.
    pub fn registration_id(&self) -> String {
        format!("{}-{}-{}", self.service, self.address, self.port)
    }
}

/// How a registered endpoint is probed and when it is given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckSpec {
    /// Time between probes.
    pub interval: Duration,
    /// A probe slower than this counts as failed.
    pub timeout: Duration,
    /// Continuous failure longer than this evicts the registration.
    pub deregister_after: Duration,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            deregister_after: DEFAULT_DEREGISTER_AFTER,
        }
    }
}
