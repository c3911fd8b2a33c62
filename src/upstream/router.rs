use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::support::{RemoteSocksSupport, SocksSupport};
use super::{Upstream, UpstreamSupport};
use crate::config::{RouteMode, UpstreamConfig};
use crate::endpoint::{AuthenticEndpoint, UnresolvedEndpoint};

/// Picks the upstream for one destination. `None` means no backend is
/// available, which fails that connect attempt.
pub trait Router: Send + Sync {
    fn route(&self, destination: &UnresolvedEndpoint) -> Option<Upstream>;
}

impl<F> Router for F
where
    F: Fn(&UnresolvedEndpoint) -> Option<Upstream> + Send + Sync,
{
    fn route(&self, destination: &UnresolvedEndpoint) -> Option<Upstream> {
        self(destination)
    }
}

pub struct DirectRouter;

impl Router for DirectRouter {
    fn route(&self, _destination: &UnresolvedEndpoint) -> Option<Upstream> {
        Some(Upstream::Direct)
    }
}

/// Cycles through the configured backends.
pub struct RoundRobinRouter {
    backends: Vec<UpstreamSupport>,
    next: AtomicUsize,
}

impl RoundRobinRouter {
    /// Every backend shares `support`.
    pub fn new(backends: Vec<AuthenticEndpoint>, support: Option<Arc<dyn SocksSupport>>) -> Self {
        Self::with_supports(
            backends
                .into_iter()
                .map(|endpoint| UpstreamSupport {
                    endpoint,
                    support: support.clone(),
                })
                .collect(),
        )
    }

    pub fn with_supports(backends: Vec<UpstreamSupport>) -> Self {
        Self {
            backends,
            next: AtomicUsize::new(0),
        }
    }
}

impl Router for RoundRobinRouter {
    fn route(&self, _destination: &UnresolvedEndpoint) -> Option<Upstream> {
        if self.backends.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Some(Upstream::Proxy(self.backends[index].clone()))
    }
}

pub fn from_config(config: &UpstreamConfig, support: Option<Arc<dyn SocksSupport>>) -> Arc<dyn Router> {
    match config.route_mode {
        RouteMode::Direct => Arc::new(DirectRouter),
        RouteMode::Backend => Arc::new(RoundRobinRouter::new(config.backends.clone(), support)),
    }
}

/// Router for a node whose backends run in other processes: each backend
/// gets a [`RemoteSocksSupport`] so fake endpoints are registered on the
/// node that has to restore them. With propagation off, hostnames are
/// forwarded as they are.
pub fn chained(config: &UpstreamConfig, local: Arc<dyn SocksSupport>) -> Arc<dyn Router> {
    match config.route_mode {
        RouteMode::Direct => Arc::new(DirectRouter),
        RouteMode::Backend if !config.propagate_fake_endpoints => {
            Arc::new(RoundRobinRouter::new(config.backends.clone(), None))
        }
        RouteMode::Backend => Arc::new(RoundRobinRouter::with_supports(
            config
                .backends
                .iter()
                .map(|endpoint| {
                    let remote: Arc<dyn SocksSupport> = Arc::new(RemoteSocksSupport::new(
                        endpoint.clone(),
                        config.cipher.clone(),
                        config.connect_timeout(),
                        Arc::clone(&local),
                    ));
                    UpstreamSupport {
                        endpoint: endpoint.clone(),
                        support: Some(remote),
                    }
                })
                .collect(),
        )),
    }
}
