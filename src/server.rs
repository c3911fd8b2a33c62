//! SOCKS5 tunnel server: accepts clients, negotiates, connects upstream and
//! relays, one task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheRegistry;
use crate::config::TunnelConfig;
use crate::endpoint::{Credentials, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};
use crate::relay::{relay, BoxStream};
use crate::socks5::{negotiate, Handshake, ProxyIntent};
use crate::tracer::EndpointTracer;
use crate::tunnel_stats::TunnelStats;
use crate::udp_relay::{UdpRelay, UdpUpstream};
use crate::upstream::{self, router, FakeEndpoints, LocalSocksSupport, Router, SocksSupport, UpstreamSelector};

const LISTEN_BACKLOG: i32 = 1024;
const KEEPALIVE_SECS: u64 = 60;

/// Everything a connection task needs, shared across tasks.
pub struct ServerContext {
    config: TunnelConfig,
    selector: UpstreamSelector,
    router: Arc<dyn Router>,
    tracer: EndpointTracer,
    support: Option<Arc<dyn SocksSupport>>,
    stats: Arc<TunnelStats>,
}

impl ServerContext {
    pub fn fake_endpoints(&self) -> &Arc<FakeEndpoints> {
        self.selector.fake_endpoints()
    }

    pub fn tracer(&self) -> &EndpointTracer {
        &self.tracer
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    pub fn support(&self) -> Option<&Arc<dyn SocksSupport>> {
        self.support.as_ref()
    }
}

pub struct TunnelServer {
    context: Arc<ServerContext>,
    listener: Option<TcpListener>,
    sweepers: Vec<JoinHandle<()>>,
}

impl TunnelServer {
    /// Builds a server whose fake endpoints are pushed to the chosen backend
    /// node over its ciphered front end. Resolution and white-listing use an
    /// in-process [`LocalSocksSupport`].
    pub fn new(config: TunnelConfig) -> Result<Self> {
        Self::build(config, None, None)
    }

    /// Builds a server around a caller-provided collaborator and/or router.
    pub fn with_parts(
        config: TunnelConfig,
        support: Option<Arc<dyn SocksSupport>>,
        router: Option<Arc<dyn Router>>,
    ) -> Result<Self> {
        Self::build(config, support, router)
    }

    fn build(
        config: TunnelConfig,
        support: Option<Arc<dyn SocksSupport>>,
        router: Option<Arc<dyn Router>>,
    ) -> Result<Self> {
        config.validate()?;

        let fake_registry = Arc::new(CacheRegistry::new(
            "fake-endpoints",
            config.cache.fake_registry(&config.fake_endpoint),
        ));
        let link_registry = Arc::new(CacheRegistry::new("endpoint-links", config.cache.link_registry()));

        let (support, router) = match support {
            Some(support) => {
                let router =
                    router.unwrap_or_else(|| router::from_config(&config.upstream, Some(Arc::clone(&support))));
                (support, router)
            }
            None => {
                let local: Arc<dyn SocksSupport> = Arc::new(
                    LocalSocksSupport::new(
                        Arc::clone(&fake_registry),
                        config.fake_endpoint.host_suffix.clone(),
                        config.fake_endpoint.ttl(),
                    )
                    .with_white_list_ttl(config.proxy_policy.white_list_ttl()),
                );
                let router = router.unwrap_or_else(|| router::chained(&config.upstream, Arc::clone(&local)));
                (local, router)
            }
        };
        let fake = Arc::new(FakeEndpoints::new(&config.fake_endpoint, Arc::clone(&fake_registry)));

        let selector = UpstreamSelector::new(
            config.upstream.connect_timeout(),
            config.upstream.cipher.clone(),
            fake,
        );

        let sweep_interval = config.cache.sweep_interval();
        let context = Arc::new(ServerContext {
            selector,
            router,
            tracer: EndpointTracer::new(Arc::clone(&link_registry)),
            support: Some(support),
            stats: TunnelStats::new(),
            config,
        });

        // Sweepers need a runtime; a server built outside one simply skips them.
        let sweepers = match tokio::runtime::Handle::try_current() {
            Ok(_) => vec![
                fake_registry.spawn_sweeper(sweep_interval),
                link_registry.spawn_sweeper(sweep_interval),
            ],
            Err(_) => Vec::new(),
        };

        Ok(Self {
            context,
            listener: None,
            sweepers,
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bind to the configured address and port
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.context.config.proxy_policy.bind_addr();
        let addr = tokio::net::lookup_host(bind_addr.as_str())
            .await?
            .next()
            .ok_or_else(|| TunnelError::config(format!("bind address {bind_addr} does not resolve")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;

        let local = listener.local_addr()?;
        info!(%local, "SOCKS5 tunnel listening");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accept connections until the listener fails.
    pub async fn accept_connections(&self) -> Result<()> {
        self.serve_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TunnelError::config("proxy server not bound"));
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("SOCKS5 tunnel shutting down");
                    self.context.stats.log_stats();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted connection");
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(&context, stream, peer).await {
                            context.stats.record_error(&e);
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
    }
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(KEEPALIVE_SECS));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Handle a single client connection
pub async fn handle_connection(context: &ServerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if let Err(e) = tune_socket(&stream) {
        debug!(%peer, error = %e, "could not tune client socket");
    }
    let local_ip = stream.local_addr()?.ip();
    let policy = &context.config.proxy_policy;
    let mut client = upstream::ciphered(stream, policy.cipher.as_ref())?;

    let trusted = context
        .support
        .as_ref()
        .map(|s| s.is_white_listed(&peer.ip()))
        .unwrap_or(false);
    let credentials: Option<Credentials> = policy.authentication.clone();
    let handshake = Handshake::new(credentials, trusted).with_registrations(policy.accept_fake_registration);
    let negotiated = negotiate(&mut client, handshake, local_ip).await?;

    if negotiated.authenticated {
        if let Some(support) = &context.support {
            if let Err(e) = support.add_white_list(peer.ip()).await {
                debug!(%peer, error = %e, "white-listing failed");
            }
        }
    }

    match negotiated.intent {
        ProxyIntent::Connect(destination) => {
            let destination = context.fake_endpoints().restore(destination);
            connect_and_relay(context, client, peer, destination, &negotiated.pending).await
        }
        ProxyIntent::UdpAssociate(bound) => {
            let Some(socket) = negotiated.udp_socket else {
                return Err(TunnelError::protocol("UDP association without a socket"));
            };
            debug!(%peer, %bound, "udp association started");
            let upstream = UdpUpstream::from_config(context.config.upstream.udp_backend.as_ref()).await?;
            let relay = UdpRelay::new(socket, peer.ip(), upstream, context.support.clone());
            relay.run(&mut client).await?;
            Ok(())
        }
        ProxyIntent::RegisterFake(real) => {
            let hash = context.fake_endpoints().register(&real);
            debug!(%peer, hash, %real, "fake endpoint registered by upstream node");
            client.write_all(&Handshake::registration_reply(true)).await?;
            client.flush().await?;
            Ok(())
        }
    }
}

async fn connect_and_relay(
    context: &ServerContext,
    mut client: BoxStream,
    peer: SocketAddr,
    destination: UnresolvedEndpoint,
    pending: &[u8],
) -> Result<()> {
    let stats = Arc::clone(&context.stats);
    stats.tunnel_started();
    let _active = scopeguard::guard(Arc::clone(&stats), |stats| stats.tunnel_closed());

    let router = &context.router;
    let upstream = match context.selector.connect(&destination, || router.route(&destination)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // The client already holds a success reply; closing is the answer.
            warn!(%peer, %destination, error = %e, "upstream connect failed");
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    context.tracer.link(peer, upstream.local_addr, upstream.peer_addr);
    info!(
        %peer,
        %destination,
        upstream = %upstream.peer_addr,
        origin = %context.tracer.head(upstream.local_addr),
        "tunnel established"
    );

    let mut remote = upstream.stream;
    if !pending.is_empty() {
        remote.write_all(pending).await?;
        remote.flush().await?;
    }

    let relayed = relay(client, remote).await;
    let pending_len = pending.len() as u64;
    match relayed {
        Ok(totals) => {
            stats.record_bytes(totals.b_to_a, totals.a_to_b + pending_len);
            debug!(%peer, %destination, up = totals.a_to_b + pending_len, down = totals.b_to_a, "tunnel closed");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
