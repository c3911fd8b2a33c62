//! Upstream Selector: turns a destination plus a routing decision into a
//! ready channel, either a direct TCP connection or a CONNECT tunnel through
//! a (ciphered, authenticated) backend proxy.

pub mod fake;
pub mod router;
pub mod support;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use fake::{endpoint_hash, FakeEndpoints, Substitution};
pub use router::{DirectRouter, RoundRobinRouter, Router};
pub use support::{LocalSocksSupport, RemoteSocksSupport, SocksSupport};

use crate::cipher::{CipherProvider, CipherStream};
use crate::config::CipherConfig;
use crate::endpoint::{AuthenticEndpoint, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};
use crate::relay::BoxStream;
use crate::socks5::client;

/// A backend proxy plus the collaborator used for fake-endpoint propagation.
#[derive(Clone)]
pub struct UpstreamSupport {
    pub endpoint: AuthenticEndpoint,
    pub support: Option<Arc<dyn SocksSupport>>,
}

impl fmt::Debug for UpstreamSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSupport")
            .field("endpoint", &self.endpoint)
            .field("support", &self.support.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Upstream {
    Direct,
    Proxy(UpstreamSupport),
}

/// A connected upstream, ready for relaying.
pub struct UpstreamChannel {
    pub stream: BoxStream,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    /// What was actually requested from the backend (or dialled directly).
    pub requested: UnresolvedEndpoint,
    /// Fake-endpoint propagation still in flight; never awaited on the data
    /// path.
    pub registration: Option<JoinHandle<()>>,
}

impl fmt::Debug for UpstreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamChannel")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

pub struct UpstreamSelector {
    connect_timeout: Duration,
    cipher: Option<CipherConfig>,
    fake: Arc<FakeEndpoints>,
}

impl UpstreamSelector {
    pub fn new(connect_timeout: Duration, cipher: Option<CipherConfig>, fake: Arc<FakeEndpoints>) -> Self {
        Self {
            connect_timeout,
            cipher,
            fake,
        }
    }

    pub fn fake_endpoints(&self) -> &Arc<FakeEndpoints> {
        &self.fake
    }

    /// Connects toward `destination` along the route `router` picks. No
    /// retries happen here; a failure ends this attempt.
    pub async fn connect<R>(&self, destination: &UnresolvedEndpoint, router: R) -> Result<UpstreamChannel>
    where
        R: FnOnce() -> Option<Upstream>,
    {
        let upstream = router().ok_or_else(|| TunnelError::NoUpstream(destination.to_string()))?;
        match upstream {
            Upstream::Direct => self.connect_direct(destination).await,
            Upstream::Proxy(upstream) => self.connect_via(destination, upstream).await,
        }
    }

    async fn connect_direct(&self, destination: &UnresolvedEndpoint) -> Result<UpstreamChannel> {
        let tcp = dial(destination, self.connect_timeout).await?;
        let (local_addr, peer_addr) = (tcp.local_addr()?, tcp.peer_addr()?);
        debug!(%destination, %peer_addr, "direct upstream connected");
        Ok(UpstreamChannel {
            stream: Box::new(tcp),
            local_addr,
            peer_addr,
            requested: destination.clone(),
            registration: None,
        })
    }

    async fn connect_via(&self, destination: &UnresolvedEndpoint, upstream: UpstreamSupport) -> Result<UpstreamChannel> {
        let (requested, registration) = match &upstream.support {
            Some(support) if self.fake.should_substitute(destination) => {
                let sub = self.fake.substitute(destination, Arc::clone(support));
                (sub.endpoint, sub.registration)
            }
            _ => (destination.clone(), None),
        };

        let backend = &upstream.endpoint;
        let tcp = dial(&backend.endpoint, self.connect_timeout).await?;
        let (local_addr, peer_addr) = (tcp.local_addr()?, tcp.peer_addr()?);
        let mut stream = ciphered(tcp, self.cipher.as_ref())?;

        let handshake = client::connect_through(&mut stream, backend, &requested);
        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(result) => {
                result?;
            }
            Err(_) => return Err(timeout_error(backend.to_string(), self.connect_timeout)),
        }
        info!(%destination, %requested, backend = %backend, "upstream tunnel established");

        Ok(UpstreamChannel {
            stream,
            local_addr,
            peer_addr,
            requested,
            registration,
        })
    }
}

/// TCP connect bounded by `timeout`, with Nagle disabled.
pub(crate) async fn dial(endpoint: &UnresolvedEndpoint, timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
    let tcp = match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result?,
        Err(_) => return Err(timeout_error(endpoint.to_string(), timeout)),
    };
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Wraps `tcp` in the hop cipher, when one is configured.
pub(crate) fn ciphered(tcp: TcpStream, cipher: Option<&CipherConfig>) -> Result<BoxStream> {
    Ok(match cipher {
        Some(cipher) => {
            let pair = CipherProvider::get(&cipher.name, &cipher.secret, false)?;
            Box::new(CipherStream::new(tcp, pair))
        }
        None => Box::new(tcp),
    })
}

fn timeout_error(endpoint: String, timeout: Duration) -> TunnelError {
    TunnelError::ConnectTimeout {
        endpoint,
        timeout_ms: timeout.as_millis() as u64,
    }
}
