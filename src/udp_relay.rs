//! UDP ASSOCIATE relay.
//!
//! Datagrams from the associated client carry a SOCKS5 UDP header. In direct
//! mode the payload goes straight to its destination and replies come back
//! wrapped in a header naming their source. In backend mode the whole
//! `ATYP ADDR PORT DATA` tail is sealed as one datagram for the UDP backend.
//! The association lives as long as its controlling TCP connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::cipher::{CipherPair, CipherProvider};
use crate::config::UdpBackendConfig;
use crate::error::{Result, TunnelError};
use crate::socks5::{decode_udp_packet, encode_udp_packet, SocksAddr};
use crate::upstream::SocksSupport;

const MAX_DATAGRAM: usize = 65_535;

pub enum UdpUpstream {
    Direct,
    Backend { addr: SocketAddr, cipher: CipherPair },
}

impl UdpUpstream {
    pub async fn from_config(config: Option<&UdpBackendConfig>) -> Result<Self> {
        let Some(config) = config else {
            return Ok(UdpUpstream::Direct);
        };
        let endpoint = &config.endpoint;
        let addr = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
            .await?
            .next()
            .ok_or_else(|| TunnelError::config(format!("udp backend {endpoint} does not resolve")))?;
        let cipher = CipherProvider::get(&config.cipher.name, &config.cipher.secret, true)?;
        Ok(UdpUpstream::Backend { addr, cipher })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpRelayStats {
    pub to_remote: u64,
    pub to_client: u64,
    pub dropped: u64,
}

pub struct UdpRelay {
    socket: UdpSocket,
    client_ip: IpAddr,
    client: Option<SocketAddr>,
    upstream: UdpUpstream,
    support: Option<Arc<dyn SocksSupport>>,
    stats: UdpRelayStats,
}

impl UdpRelay {
    pub fn new(
        socket: UdpSocket,
        client_ip: IpAddr,
        upstream: UdpUpstream,
        support: Option<Arc<dyn SocksSupport>>,
    ) -> Self {
        Self {
            socket,
            client_ip,
            client: None,
            upstream,
            support,
            stats: UdpRelayStats::default(),
        }
    }

    /// Relays until `control` reaches EOF or fails.
    pub async fn run<C>(mut self, control: &mut C) -> Result<UdpRelayStats>
    where
        C: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                read = control.read(&mut scratch) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    if let Err(e) = self.on_datagram(&buf[..n], from).await {
                        self.stats.dropped += 1;
                        debug!(%from, error = %e, "datagram dropped");
                    }
                }
            }
        }
        debug!(client = ?self.client, stats = ?self.stats, "udp association closed");
        Ok(self.stats)
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Result<()> {
        if self.is_from_client(from) {
            self.client = Some(from);
            return self.forward_request(datagram).await;
        }
        let Some(client) = self.client else {
            trace!(%from, "datagram before any client packet");
            return Ok(());
        };
        let packet = match &mut self.upstream {
            UdpUpstream::Direct => encode_udp_packet(&SocksAddr::Ip(from), datagram)?,
            UdpUpstream::Backend { addr, cipher } => {
                if from != *addr {
                    trace!(%from, "datagram from unexpected peer");
                    return Ok(());
                }
                let tail = cipher.decryptor.update(datagram)?;
                // Validate before handing it back.
                SocksAddr::parse(&tail)?.ok_or(crate::socks5::SocksError::UdpPacketTooShort)?;
                let mut packet = vec![0u8, 0, 0];
                packet.extend_from_slice(&tail);
                packet
            }
        };
        self.socket.send_to(&packet, client).await?;
        self.stats.to_client += 1;
        Ok(())
    }

    fn is_from_client(&self, from: SocketAddr) -> bool {
        match self.client {
            Some(client) => client == from,
            None => from.ip() == self.client_ip,
        }
    }

    async fn forward_request(&mut self, datagram: &[u8]) -> Result<()> {
        let (destination, payload) = decode_udp_packet(datagram)?;
        match &mut self.upstream {
            UdpUpstream::Direct => {
                let target = resolve(&destination, self.support.as_deref()).await?;
                self.socket.send_to(payload, target).await?;
            }
            UdpUpstream::Backend { addr, cipher } => {
                let sealed = cipher.encryptor.update(&datagram[3..])?;
                let addr = *addr;
                self.socket.send_to(&sealed, addr).await?;
            }
        }
        self.stats.to_remote += 1;
        Ok(())
    }
}

async fn resolve(destination: &SocksAddr, support: Option<&dyn SocksSupport>) -> Result<SocketAddr> {
    match destination {
        SocksAddr::Ip(addr) => Ok(*addr),
        SocksAddr::Domain(host, port) => {
            let ip = match support {
                Some(support) => support.resolve_host(host).await?.into_iter().next(),
                None => tokio::net::lookup_host((host.as_str(), *port)).await?.next().map(|a| a.ip()),
            };
            match ip {
                Some(ip) => Ok(SocketAddr::new(ip, *port)),
                None => {
                    warn!(%host, "udp destination does not resolve");
                    Err(TunnelError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses for {host}"),
                    )))
                }
            }
        }
    }
}
