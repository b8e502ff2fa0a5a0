use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::endpoint::{HealthCheckSpec, ServiceEndpoint};
use crate::probe::HealthProbe;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no healthy instances for service: {0}")]
    NoHealthyInstances(String),
}

#[derive(Debug, Clone)]
struct Registration {
    endpoint: ServiceEndpoint,
    healthy: bool,
    failing_since: Option<Instant>,
}

type Services = HashMap<String, HashMap<String, Registration>>;

/// Registry of service instances with health-based eviction.
///
/// A fresh registration is optimistically healthy until its first probe
/// says otherwise.
pub struct ServiceRegistry {
    services: Arc<Mutex<Services>>,
    probe: Arc<dyn HealthProbe>,
}

impl ServiceRegistry {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            probe,
        }
    }

    /// Enroll an endpoint and arm its periodic health probe.
    ///
    /// The probe task evicts the registration on its own once the endpoint
    /// has failed continuously past the grace period; the handle only needs
    /// to be used for graceful shutdown.
    pub fn register(&self, endpoint: ServiceEndpoint, spec: HealthCheckSpec) -> RegistrationHandle {
        let service = endpoint.service.clone();
        let id = endpoint.registration_id();

        {
            let mut services = self.services.lock().unwrap();
            services.entry(service.clone()).or_default().insert(
                id.clone(),
                Registration {
                    endpoint: endpoint.clone(),
                    healthy: true,
                    failing_since: None,
                },
            );
        }
        info!(service = %service, id = %id, "service endpoint registered");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(probe_loop(
            self.services.clone(),
            self.probe.clone(),
            endpoint,
            spec,
            shutdown_rx,
        ));

        RegistrationHandle {
            service,
            id,
            services: self.services.clone(),
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One uniformly random healthy endpoint for `service`.
    pub fn discover(&self, service: &str) -> Result<ServiceEndpoint, RegistryError> {
        let services = self.services.lock().unwrap();
        let healthy: Vec<&Registration> = services
            .get(service)
            .map(|regs| regs.values().filter(|reg| reg.healthy).collect())
            .unwrap_or_default();

        use rand::seq::SliceRandom;
        healthy
            .choose(&mut rand::thread_rng())
            .map(|reg| reg.endpoint.clone())
            .ok_or_else(|| RegistryError::NoHealthyInstances(service.to_string()))
    }
}

async fn probe_loop(
    services: Arc<Mutex<Services>>,
    probe: Arc<dyn HealthProbe>,
    endpoint: ServiceEndpoint,
    spec: HealthCheckSpec,
    shutdown_rx: watch::Receiver<bool>,
) {
    let service = endpoint.service.clone();
    let id = endpoint.registration_id();

    loop {
        tokio::time::sleep(spec.interval).await;
        if *shutdown_rx.borrow() {
            break;
        }

        let passing = tokio::time::timeout(spec.timeout, probe.check(&endpoint))
            .await
            .unwrap_or(false);
        let now = Instant::now();

        let mut services = services.lock().unwrap();
        let Some(regs) = services.get_mut(&service) else {
            break;
        };
        let Some(reg) = regs.get_mut(&id) else {
            break; // Deregistered while we were probing.
        };

        if passing {
            reg.healthy = true;
            reg.failing_since = None;
            continue;
        }

        reg.healthy = false;
        let failing_since = *reg.failing_since.get_or_insert(now);
        if now.saturating_duration_since(failing_since) >= spec.deregister_after {
            regs.remove(&id);
            warn!(service = %service, id = %id, "endpoint evicted after failing past grace period");
            break;
        }
    }
}

/// Handle for one registration, used for graceful shutdown.
#[derive(Debug)]
pub struct RegistrationHandle {
    service: String,
    id: String,
    services: Arc<Mutex<Services>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the registration and stop its probe task.
    pub async fn deregister(self) {
        {
            let mut services = self.services.lock().unwrap();
            if let Some(regs) = services.get_mut(&self.service) {
                regs.remove(&self.id);
            }
        }
        let _ = self.shutdown.send(true);
        self.join.abort();
        let _ = self.join.await;
        info!(service = %self.service, id = %self.id, "service endpoint deregistered");
    }
}

/// Short-TTL discovery memo.
///
/// Resolution stays per-call; the memo only bounds how often the registry is
/// consulted, never how long an endpoint survives churn.
pub struct Discovery {
    registry: Arc<ServiceRegistry>,
    ttl: Duration,
    memo: Mutex<HashMap<String, (Instant, ServiceEndpoint)>>,
}

impl Discovery {
    pub fn new(registry: Arc<ServiceRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, service: &str) -> Result<ServiceEndpoint, RegistryError> {
        let now = Instant::now();
        {
            let memo = self.memo.lock().unwrap();
            if let Some((resolved_at, endpoint)) = memo.get(service) {
                if now.saturating_duration_since(*resolved_at) < self.ttl {
                    return Ok(endpoint.clone());
                }
            }
        }

        let endpoint = self.registry.discover(service)?;
        self.memo
            .lock()
            .unwrap()
            .insert(service.to_string(), (now, endpoint.clone()));
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl HealthProbe for FlagProbe {
        async fn check(&self, _endpoint: &ServiceEndpoint) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fast_spec() -> HealthCheckSpec {
        HealthCheckSpec {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            deregister_after: Duration::from_millis(350),
        }
    }

    /// Let the probe tasks run through `n` intervals.
    async fn run_probes(n: u32, spec: &HealthCheckSpec) {
        // Let freshly-spawned probe tasks get polled so they register their
        // first sleep timer before we start advancing the (paused) clock;
        // otherwise the first `advance` elapses before any timer exists and
        // is wasted.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        for _ in 0..n {
            tokio::time::advance(spec.interval).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registered_endpoint_is_discoverable() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = ServiceRegistry::new(Arc::new(FlagProbe(up)));
        let endpoint = ServiceEndpoint::new("book-service", "10.0.0.1", 8080);

        let _handle = registry.register(endpoint.clone(), fast_spec());
        assert_eq!(registry.discover("book-service").unwrap(), endpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_stops_being_returned_then_evicts() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = ServiceRegistry::new(Arc::new(FlagProbe(up.clone())));
        let spec = fast_spec();
        let _handle = registry.register(
            ServiceEndpoint::new("book-service", "10.0.0.1", 8080),
            spec,
        );

        up.store(false, Ordering::SeqCst);

        // First failed probe: unhealthy, no longer discoverable.
        run_probes(1, &spec).await;
        assert!(matches!(
            registry.discover("book-service"),
            Err(RegistryError::NoHealthyInstances(_))
        ));

        // Failing continuously past the grace period: evicted entirely.
        run_probes(5, &spec).await;
        let services = registry.services.lock().unwrap();
        assert!(
            services
                .get("book-service")
                .map(|regs| regs.is_empty())
                .unwrap_or(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_before_grace_resets_the_clock() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = ServiceRegistry::new(Arc::new(FlagProbe(up.clone())));
        let spec = fast_spec();
        let _handle = registry.register(
            ServiceEndpoint::new("book-service", "10.0.0.1", 8080),
            spec,
        );

        up.store(false, Ordering::SeqCst);
        run_probes(2, &spec).await;

        up.store(true, Ordering::SeqCst);
        run_probes(1, &spec).await;
        assert!(registry.discover("book-service").is_ok());

        // A later failure starts a fresh grace window.
        up.store(false, Ordering::SeqCst);
        run_probes(2, &spec).await;
        let services = registry.services.lock().unwrap();
        assert!(
            !services
                .get("book-service")
                .map(|regs| regs.is_empty())
                .unwrap_or(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn discover_picks_among_all_healthy_instances() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = ServiceRegistry::new(Arc::new(FlagProbe(up)));
        let spec = fast_spec();
        let a = ServiceEndpoint::new("book-service", "10.0.0.1", 8080);
        let b = ServiceEndpoint::new("book-service", "10.0.0.2", 8080);
        let _ha = registry.register(a.clone(), spec);
        let _hb = registry.register(b.clone(), spec);

        for _ in 0..10 {
            let picked = registry.discover("book-service").unwrap();
            assert!(picked == a || picked == b);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_removes_the_endpoint() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = ServiceRegistry::new(Arc::new(FlagProbe(up)));
        let handle = registry.register(
            ServiceEndpoint::new("book-service", "10.0.0.1", 8080),
            fast_spec(),
        );

        handle.deregister().await;
        assert!(matches!(
            registry.discover("book-service"),
            Err(RegistryError::NoHealthyInstances(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_memo_expires_after_its_ttl() {
        let up = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(ServiceRegistry::new(Arc::new(FlagProbe(up))));
        let handle = registry.register(
            ServiceEndpoint::new("book-service", "10.0.0.1", 8080),
            fast_spec(),
        );

        let discovery = Discovery::new(registry.clone(), Duration::from_millis(50));
        let endpoint = discovery.resolve("book-service").unwrap();

        handle.deregister().await;

        // Within the TTL the memo still answers.
        assert_eq!(discovery.resolve("book-service").unwrap(), endpoint);

        // Past the TTL churn is reflected.
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(matches!(
            discovery.resolve("book-service"),
            Err(RegistryError::NoHealthyInstances(_))
        ));
    }
}
