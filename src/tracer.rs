//! Endpoint Tracer: links each outbound hop back to the client that caused
//! it, so a relay chain can be attributed to its originating address.
//! Bookkeeping only; routing never consults it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

use crate::cache::CacheRegistry;

pub struct EndpointTracer {
    links: Arc<CacheRegistry<SocketAddr, SocketAddr>>,
    ttl: Duration,
}

impl EndpointTracer {
    pub fn new(links: Arc<CacheRegistry<SocketAddr, SocketAddr>>) -> Self {
        let ttl = links.policy().default_ttl;
        Self { links, ttl }
    }

    /// Record that the connection `outbound_local -> outbound_remote` was
    /// opened on behalf of `inbound_remote`. Both outbound addresses become
    /// keys so the next hop (which sees `outbound_local` as its peer) and
    /// this hop can both resolve the head.
    pub fn link(
        &self,
        inbound_remote: SocketAddr,
        outbound_local: SocketAddr,
        outbound_remote: SocketAddr,
    ) {
        let head = self.head(inbound_remote);
        trace!(%head, %outbound_local, %outbound_remote, "linking relay hop");
        self.links.put(outbound_local, head, self.ttl);
        self.links.put(outbound_remote, head, self.ttl);
    }

    pub fn link_streams(&self, inbound: &TcpStream, outbound: &TcpStream) -> std::io::Result<()> {
        self.link(inbound.peer_addr()?, outbound.local_addr()?, outbound.peer_addr()?);
        Ok(())
    }

    /// The originating client for a connection whose peer is `remote`;
    /// `remote` itself when nothing was linked.
    pub fn head(&self, remote: SocketAddr) -> SocketAddr {
        self.links.get(&remote).unwrap_or(remote)
    }

    pub fn head_of(&self, channel: &TcpStream) -> std::io::Result<SocketAddr> {
        Ok(self.head(channel.peer_addr()?))
    }
}
