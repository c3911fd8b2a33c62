//! Boundary to the resolution collaborator that makes fake hosts resolvable
//! on later hops.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ciphered, dial};
use crate::cache::{CacheRegistry, RegistryPolicy};
use crate::config::CipherConfig;
use crate::endpoint::{AuthenticEndpoint, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};
use crate::socks5::client;

const WHITE_LIST_CAPACITY: usize = 4096;
const DEFAULT_WHITE_LIST_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait SocksSupport: Send + Sync {
    /// Make `hash` resolvable back to `real_endpoint` (`host:port`).
    async fn fake_endpoint(&self, hash: u64, real_endpoint: &str) -> Result<()>;

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>>;

    async fn add_white_list(&self, addr: IpAddr) -> Result<()>;

    /// White-listed peers skip inbound authentication.
    fn is_white_listed(&self, _addr: &IpAddr) -> bool {
        false
    }
}

/// In-process support backed by the node's own fake-endpoint registry and
/// the system resolver. White-list entries expire.
pub struct LocalSocksSupport {
    registry: Arc<CacheRegistry<u64, String>>,
    suffix: String,
    ttl: Duration,
    white_list: CacheRegistry<IpAddr, ()>,
    white_list_ttl: Duration,
}

impl LocalSocksSupport {
    pub fn new(registry: Arc<CacheRegistry<u64, String>>, suffix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            registry,
            suffix: suffix.into(),
            ttl,
            white_list: CacheRegistry::new(
                "white-list",
                RegistryPolicy {
                    hot_capacity: WHITE_LIST_CAPACITY,
                    default_ttl: DEFAULT_WHITE_LIST_TTL,
                    cold_capacity: None,
                    ..RegistryPolicy::default()
                },
            ),
            white_list_ttl: DEFAULT_WHITE_LIST_TTL,
        }
    }

    pub fn with_white_list_ttl(mut self, ttl: Duration) -> Self {
        self.white_list_ttl = ttl;
        self
    }

    fn real_endpoint_of(&self, host: &str) -> Option<UnresolvedEndpoint> {
        let hash = host.strip_suffix(self.suffix.as_str())?.parse::<u64>().ok()?;
        self.registry.get(&hash)?.parse().ok()
    }
}

#[async_trait]
impl SocksSupport for LocalSocksSupport {
    async fn fake_endpoint(&self, hash: u64, real_endpoint: &str) -> Result<()> {
        self.registry.put(hash, real_endpoint.to_string(), self.ttl);
        debug!(hash, real_endpoint, "fake endpoint registered");
        Ok(())
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        let (host, port) = match self.real_endpoint_of(host) {
            Some(real) => (real.host().to_string(), real.port()),
            None => (host.to_string(), 0),
        };
        if let Some(ip) = UnresolvedEndpoint::new(host.clone(), port).ip() {
            return Ok(vec![ip]);
        }
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            )));
        }
        Ok(addrs)
    }

    async fn add_white_list(&self, addr: IpAddr) -> Result<()> {
        self.white_list.put(addr, (), self.white_list_ttl);
        debug!(%addr, ttl_secs = self.white_list_ttl.as_secs(), "peer white-listed");
        Ok(())
    }

    fn is_white_listed(&self, addr: &IpAddr) -> bool {
        self.white_list.get(addr).is_some()
    }
}

/// Support for one backend node: fake endpoints are pushed to that node over
/// its (ciphered, authenticated) front end, so its own registry can restore
/// them. Resolution and white-listing stay with `local`.
pub struct RemoteSocksSupport {
    backend: AuthenticEndpoint,
    cipher: Option<CipherConfig>,
    connect_timeout: Duration,
    local: Arc<dyn SocksSupport>,
}

impl RemoteSocksSupport {
    pub fn new(
        backend: AuthenticEndpoint,
        cipher: Option<CipherConfig>,
        connect_timeout: Duration,
        local: Arc<dyn SocksSupport>,
    ) -> Self {
        Self {
            backend,
            cipher,
            connect_timeout,
            local,
        }
    }
}

impl fmt::Debug for RemoteSocksSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSocksSupport")
            .field("backend", &self.backend)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SocksSupport for RemoteSocksSupport {
    /// The receiving node derives the hash from `real_endpoint` itself.
    async fn fake_endpoint(&self, hash: u64, real_endpoint: &str) -> Result<()> {
        let real: UnresolvedEndpoint = real_endpoint.parse()?;
        let tcp = dial(&self.backend.endpoint, self.connect_timeout).await?;
        let mut stream = ciphered(tcp, self.cipher.as_ref())?;
        client::register_fake(&mut stream, &self.backend, &real).await?;
        debug!(hash, %real, backend = %self.backend, "fake endpoint pushed to backend");
        Ok(())
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.local.resolve_host(host).await
    }

    async fn add_white_list(&self, addr: IpAddr) -> Result<()> {
        self.local.add_white_list(addr).await
    }

    fn is_white_listed(&self, addr: &IpAddr) -> bool {
        self.local.is_white_listed(addr)
    }
}
