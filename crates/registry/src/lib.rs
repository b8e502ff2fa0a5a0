//! Service registration and health-based discovery.
//!
//! Registration arms a periodic health probe; an endpoint whose probe keeps
//! failing past a grace period is evicted server-side, so a crashed process
//! needs no explicit deregistration. Discovery hands out one uniformly
//! random healthy endpoint per call and is re-resolved live (or memoized
//! only for a short TTL), so endpoint churn shows up promptly.

mod endpoint;
mod probe;
mod registry;

pub use endpoint::{HealthCheckSpec, ServiceEndpoint};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use registry::{Discovery, RegistrationHandle, RegistryError, ServiceRegistry};
