//! Fake-endpoint substitution.
//!
//! A destination that must not be resolved by an intermediate hop is replaced
//! by `"{hash}{suffix}"` on an obfuscation port. The `hash -> "host:port"`
//! mapping is registered in the Cache Registry at most once per live entry and
//! handed to the [`SocksSupport`] collaborator in a spawned task with a
//! deadline; the data path never waits on that task. A failed propagation
//! keeps the local mapping and marks the hash for another attempt on its
//! next substitution.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::support::SocksSupport;
use crate::cache::CacheRegistry;
use crate::config::FakeEndpointPolicy;
use crate::endpoint::UnresolvedEndpoint;
use crate::error::TunnelError;

/// Stable 64-bit hash of a canonical `host:port` string.
pub fn endpoint_hash(real_endpoint: &str) -> u64 {
    let digest = Sha256::digest(real_endpoint.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[derive(Debug)]
pub struct Substitution {
    pub hash: u64,
    /// What the backend is asked to CONNECT to.
    pub endpoint: UnresolvedEndpoint,
    /// Propagation task, present only for the caller that registered.
    pub registration: Option<JoinHandle<()>>,
}

pub struct FakeEndpoints {
    registry: Arc<CacheRegistry<u64, String>>,
    suffix: String,
    fake_ips: HashSet<IpAddr>,
    fake_ports: HashSet<u16>,
    obfuscation_ports: Vec<u16>,
    registration_timeout: Duration,
    ttl: Duration,
    /// Hashes whose last propagation failed.
    unpropagated: Arc<DashSet<u64>>,
}

impl FakeEndpoints {
    pub fn new(policy: &FakeEndpointPolicy, registry: Arc<CacheRegistry<u64, String>>) -> Self {
        Self {
            registry,
            suffix: policy.host_suffix.clone(),
            fake_ips: policy.fake_ips.clone(),
            fake_ports: policy.fake_ports.clone(),
            obfuscation_ports: policy.obfuscation_ports.clone(),
            registration_timeout: policy.registration_timeout(),
            ttl: policy.ttl(),
            unpropagated: Arc::new(DashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry<u64, String>> {
        &self.registry
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Hostnames, fake IPs and fake ports are substituted.
    pub fn should_substitute(&self, destination: &UnresolvedEndpoint) -> bool {
        let fake_host = match destination.ip() {
            Some(ip) => self.fake_ips.contains(&ip),
            None => true,
        };
        fake_host || self.fake_ports.contains(&destination.port())
    }

    pub fn is_fake_host(&self, host: &str) -> bool {
        self.hash_of_fake_host(host).is_some()
    }

    fn hash_of_fake_host(&self, host: &str) -> Option<u64> {
        host.strip_suffix(self.suffix.as_str())?.parse().ok()
    }

    fn pick_port(&self) -> u16 {
        self.obfuscation_ports
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(443)
    }

    /// Replaces `destination` and, if this call created the mapping, starts
    /// propagating it to `support`.
    pub fn substitute(&self, destination: &UnresolvedEndpoint, support: Arc<dyn SocksSupport>) -> Substitution {
        let real = destination.to_string();
        let hash = endpoint_hash(&real);
        let endpoint = UnresolvedEndpoint::new(format!("{hash}{}", self.suffix), self.pick_port());

        let computed = self.registry.entry_with(hash, || real.clone(), self.ttl);
        if computed.value != real {
            warn!(hash, existing = %computed.value, incoming = %real, "fake endpoint hash collision");
        }

        let retry = !computed.inserted
            && computed.value == real
            && self.unpropagated.remove(&hash).is_some();
        let registration = if computed.inserted || retry {
            self.unpropagated.remove(&hash);
            Some(self.spawn_registration(hash, real, support))
        } else {
            trace!(hash, "fake endpoint already registered");
            None
        };
        debug!(%destination, substitute = %endpoint, "destination substituted");

        Substitution {
            hash,
            endpoint,
            registration,
        }
    }

    fn spawn_registration(&self, hash: u64, real: String, support: Arc<dyn SocksSupport>) -> JoinHandle<()> {
        let unpropagated = Arc::clone(&self.unpropagated);
        let deadline = self.registration_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(deadline, support.fake_endpoint(hash, &real)).await {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Registration(format!(
                    "timed out after {}ms",
                    deadline.as_millis()
                ))),
            };
            match outcome {
                Ok(()) => debug!(hash, real_endpoint = %real, "fake endpoint propagated"),
                Err(e) => {
                    unpropagated.insert(hash);
                    warn!(hash, real_endpoint = %real, error = %e, "fake endpoint registration failed");
                }
            }
        })
    }

    /// Stores a mapping pushed by an upstream node. The hash is derived here
    /// from the canonical `host:port`, never taken from the wire.
    pub fn register(&self, real: &UnresolvedEndpoint) -> u64 {
        let real = real.to_string();
        let hash = endpoint_hash(&real);
        self.registry.put(hash, real, self.ttl);
        hash
    }

    /// The real destination behind a fake host, when this node knows it.
    pub fn resolve_fake(&self, destination: &UnresolvedEndpoint) -> Option<UnresolvedEndpoint> {
        let hash = self.hash_of_fake_host(destination.host())?;
        let real = self.registry.get(&hash)?;
        real.parse().ok()
    }

    /// `destination` with any known fake host restored to its real endpoint.
    pub fn restore(&self, destination: UnresolvedEndpoint) -> UnresolvedEndpoint {
        match self.resolve_fake(&destination) {
            Some(real) => {
                debug!(fake = %destination, %real, "fake endpoint restored");
                real
            }
            None => {
                if self.is_fake_host(destination.host()) {
                    trace!(%destination, "unknown fake host forwarded unchanged");
                }
                destination
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegistryPolicy;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSupport {
        calls: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl SocksSupport for CountingSupport {
        async fn fake_endpoint(&self, _hash: u64, _real: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(TunnelError::Registration("collaborator down".into()));
            }
            Ok(())
        }

        async fn resolve_host(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(Vec::new())
        }

        async fn add_white_list(&self, _addr: IpAddr) -> Result<()> {
            Ok(())
        }
    }

    fn fakes(policy: FakeEndpointPolicy) -> FakeEndpoints {
        FakeEndpoints::new(&policy, Arc::new(CacheRegistry::new("fake", RegistryPolicy::default())))
    }

    #[test]
    fn test_hash_is_stable_and_distinct() {
        assert_eq!(endpoint_hash("example.test:80"), endpoint_hash("example.test:80"));
        assert_ne!(endpoint_hash("example.test:80"), endpoint_hash("example.test:81"));
    }

    #[test]
    fn test_substitution_policy() {
        let mut policy = FakeEndpointPolicy::default();
        policy.fake_ips.insert("198.18.0.1".parse().unwrap());
        policy.fake_ports.insert(25);
        let fakes = fakes(policy);

        assert!(fakes.should_substitute(&UnresolvedEndpoint::new("example.test", 80)));
        assert!(fakes.should_substitute(&UnresolvedEndpoint::new("198.18.0.1", 80)));
        assert!(fakes.should_substitute(&UnresolvedEndpoint::new("10.0.0.1", 25)));
        assert!(!fakes.should_substitute(&UnresolvedEndpoint::new("10.0.0.1", 80)));
    }

    #[tokio::test]
    async fn test_substitute_registers_recoverable_mapping() {
        let fakes = fakes(FakeEndpointPolicy::default());
        let support = Arc::new(CountingSupport::default());
        let dest = UnresolvedEndpoint::new("example.test", 80);

        let sub = fakes.substitute(&dest, support.clone());
        assert_eq!(sub.endpoint.host(), format!("{}.fake.internal", sub.hash));
        assert!([443, 3306].contains(&sub.endpoint.port()));
        assert_eq!(fakes.registry().get(&sub.hash).as_deref(), Some("example.test:80"));

        sub.registration.expect("first substitution registers").await.unwrap();
        assert_eq!(support.calls.load(Ordering::SeqCst), 1);

        // Restoring on the next hop yields the original destination.
        assert_eq!(fakes.resolve_fake(&sub.endpoint), Some(dest));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_substitutions_register_once() {
        let fakes = Arc::new(fakes(FakeEndpointPolicy::default()));
        let support = Arc::new(CountingSupport::default());
        let dest = UnresolvedEndpoint::new("race.test", 443);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let fakes = Arc::clone(&fakes);
            let support: Arc<dyn SocksSupport> = support.clone();
            let dest = dest.clone();
            tasks.push(tokio::spawn(async move { fakes.substitute(&dest, support) }));
        }

        let mut registrations = Vec::new();
        for task in tasks {
            if let Some(handle) = task.await.unwrap().registration {
                registrations.push(handle);
            }
        }
        assert_eq!(registrations.len(), 1);
        for handle in registrations {
            handle.await.unwrap();
        }
        assert_eq!(support.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_timeout_is_not_fatal() {
        let policy = FakeEndpointPolicy {
            registration_timeout_ms: 50,
            ..FakeEndpointPolicy::default()
        };
        let fakes = fakes(policy);
        let slow = Arc::new(CountingSupport {
            delay: Some(Duration::from_secs(10)),
            ..CountingSupport::default()
        });

        let dest = UnresolvedEndpoint::new("slow.test", 80);
        let sub = fakes.substitute(&dest, slow.clone());
        // Substitution is already in effect before the collaborator answers.
        assert!(sub.endpoint.host().ends_with(".fake.internal"));

        sub.registration.unwrap().await.unwrap();
        // The local mapping survives; the next substitution propagates again.
        assert_eq!(fakes.registry().get(&sub.hash).as_deref(), Some("slow.test:80"));
        assert_eq!(fakes.resolve_fake(&sub.endpoint), Some(dest.clone()));
        let retry = fakes.substitute(&dest, slow.clone());
        assert_eq!(retry.hash, sub.hash);
        assert!(retry.registration.is_some());
        // Only one retry is in flight per failure.
        assert!(fakes.substitute(&dest, slow).registration.is_none());
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_fresher_entry() {
        let fakes = fakes(FakeEndpointPolicy::default());
        let failing = Arc::new(CountingSupport {
            delay: Some(Duration::from_millis(20)),
            fail: true,
            ..CountingSupport::default()
        });
        let dest = UnresolvedEndpoint::new("fresh.test", 80);
        let sub = fakes.substitute(&dest, failing);

        // A pushed registration lands while propagation is still running.
        assert_eq!(fakes.register(&dest), sub.hash);
        sub.registration.unwrap().await.unwrap();
        assert_eq!(fakes.registry().get(&sub.hash).as_deref(), Some("fresh.test:80"));
    }

    #[test]
    fn test_register_derives_hash_from_endpoint() {
        let fakes = fakes(FakeEndpointPolicy::default());
        let real = UnresolvedEndpoint::new("pushed.test", 8080);
        let hash = fakes.register(&real);
        assert_eq!(hash, endpoint_hash("pushed.test:8080"));
        let fake = UnresolvedEndpoint::new(format!("{hash}.fake.internal"), 3306);
        assert_eq!(fakes.restore(fake), real);
    }

    #[tokio::test]
    async fn test_failed_registration_is_logged_only() {
        let fakes = fakes(FakeEndpointPolicy::default());
        let failing = Arc::new(CountingSupport {
            fail: true,
            ..CountingSupport::default()
        });
        let sub = fakes.substitute(&UnresolvedEndpoint::new("down.test", 80), failing);
        sub.registration.unwrap().await.unwrap();
    }

    #[test]
    fn test_unknown_fake_host_is_forwarded_unchanged() {
        let fakes = fakes(FakeEndpointPolicy::default());
        let unknown = UnresolvedEndpoint::new("12345.fake.internal", 443);
        assert!(fakes.is_fake_host(unknown.host()));
        assert_eq!(fakes.restore(unknown.clone()), unknown);
        let plain = UnresolvedEndpoint::new("example.test", 80);
        assert_eq!(fakes.restore(plain.clone()), plain);
    }
}
