//! Client-facing SOCKS5 state machine.
//!
//! `AwaitGreeting -> [AwaitAuth ->] AwaitCommand -> Established`, with
//! `Closed` reached on any protocol error. The machine is fed raw bytes and
//! never touches I/O itself; [`negotiate`] drives it over a stream.

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{atype, command, encode_reply, method, reply, SocksAddr, SocksError, AUTH_VERSION, VERSION};
use crate::endpoint::{Credentials, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitGreeting,
    AwaitAuth,
    AwaitCommand,
    Established,
    Closed,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::AwaitGreeting => "AwaitGreeting",
            HandshakeState::AwaitAuth => "AwaitAuth",
            HandshakeState::AwaitCommand => "AwaitCommand",
            HandshakeState::Established => "Established",
            HandshakeState::Closed => "Closed",
        }
    }
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyIntent {
    Connect(UnresolvedEndpoint),
    /// Local address of the relay socket handed to the client.
    UdpAssociate(SocketAddr),
    /// A previous hop hands over the real endpoint behind one of its fake
    /// hosts. Not yet answered; see [`Handshake::registration_reply`].
    RegisterFake(UnresolvedEndpoint),
}

/// Outcome of feeding bytes to the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    NeedMore,
    /// Write these bytes back and keep feeding.
    Reply(Vec<u8>),
    /// CONNECT accepted; `reply` is the synthetic success to send.
    Connect {
        reply: Vec<u8>,
        destination: UnresolvedEndpoint,
    },
    /// UDP ASSOCIATE accepted; the caller binds a socket and answers with
    /// [`Handshake::udp_associate_reply`].
    UdpAssociate { client_hint: SocksAddr },
    /// Fake-endpoint registration accepted for storing; answer after it is
    /// stored.
    RegisterFake { real: UnresolvedEndpoint },
    /// Write `reply` (if any) and close.
    Reject {
        reply: Option<Vec<u8>>,
        error: SocksError,
    },
}

pub struct Handshake {
    state: HandshakeState,
    credentials: Option<Credentials>,
    trusted_peer: bool,
    authenticated: bool,
    accept_registrations: bool,
}

impl Handshake {
    /// `credentials` enables username/password auth for untrusted peers.
    pub fn new(credentials: Option<Credentials>, trusted_peer: bool) -> Self {
        Self {
            state: HandshakeState::AwaitGreeting,
            credentials,
            trusted_peer,
            authenticated: false,
            accept_registrations: false,
        }
    }

    /// Also accept the fake-endpoint registration command from peers.
    pub fn with_registrations(mut self, accept: bool) -> Self {
        self.accept_registrations = accept;
        self
    }

    pub fn no_auth() -> Self {
        Self::new(None, false)
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the client passed username/password authentication.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn requires_auth(&self) -> bool {
        self.credentials.is_some() && !self.trusted_peer
    }

    fn close(&mut self, error: SocksError) -> std::result::Result<Step, SocksError> {
        self.state = HandshakeState::Closed;
        Err(error)
    }

    fn reject(&mut self, reply: Option<Vec<u8>>, error: SocksError) -> std::result::Result<Step, SocksError> {
        self.state = HandshakeState::Closed;
        Ok(Step::Reject { reply, error })
    }

    /// Consumes one message from `buf` if a complete one is present.
    /// `Err` means close without replying.
    pub fn advance(&mut self, buf: &mut BytesMut) -> std::result::Result<Step, SocksError> {
        match self.state {
            HandshakeState::AwaitGreeting => self.on_greeting(buf),
            HandshakeState::AwaitAuth => self.on_auth(buf),
            HandshakeState::AwaitCommand => self.on_command(buf),
            HandshakeState::Established | HandshakeState::Closed => {
                let state = self.state.name();
                self.close(SocksError::UnexpectedMessage { state })
            }
        }
    }

    fn on_greeting(&mut self, buf: &mut BytesMut) -> std::result::Result<Step, SocksError> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }
        if buf[0] != VERSION {
            return self.close(SocksError::InvalidVersion {
                expected: VERSION,
                got: buf[0],
            });
        }
        if buf.len() < 2 {
            return Ok(Step::NeedMore);
        }
        let n = buf[1] as usize;
        if n == 0 {
            return self.close(SocksError::NoAcceptableMethods);
        }
        if buf.len() < 2 + n {
            return Ok(Step::NeedMore);
        }
        let methods = buf.split_to(2 + n);
        let offered = &methods[2..];

        let (wanted, next) = if self.requires_auth() {
            (method::USER_PASS, HandshakeState::AwaitAuth)
        } else {
            (method::NO_AUTH, HandshakeState::AwaitCommand)
        };
        if !offered.contains(&wanted) {
            return self.reject(
                Some(vec![VERSION, method::NO_ACCEPTABLE]),
                SocksError::NoAcceptableMethods,
            );
        }
        trace!(method = wanted, "greeting accepted");
        self.state = next;
        Ok(Step::Reply(vec![VERSION, wanted]))
    }

    fn on_auth(&mut self, buf: &mut BytesMut) -> std::result::Result<Step, SocksError> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }
        if buf[0] != AUTH_VERSION {
            return self.close(SocksError::InvalidVersion {
                expected: AUTH_VERSION,
                got: buf[0],
            });
        }
        let Some(&ulen) = buf.get(1) else {
            return Ok(Step::NeedMore);
        };
        let ulen = ulen as usize;
        let Some(&plen) = buf.get(2 + ulen) else {
            return Ok(Step::NeedMore);
        };
        let plen = plen as usize;
        if buf.len() < 3 + ulen + plen {
            return Ok(Step::NeedMore);
        }
        let msg = buf.split_to(3 + ulen + plen);
        let username = std::str::from_utf8(&msg[2..2 + ulen])
            .map_err(|_| SocksError::InvalidUtf8Encoding { field: "username" })?;
        let password = std::str::from_utf8(&msg[3 + ulen..])
            .map_err(|_| SocksError::InvalidUtf8Encoding { field: "password" })?;

        let accepted = self
            .credentials
            .as_ref()
            .map(|c| c.username == username && c.password == password)
            .unwrap_or(false);
        if !accepted {
            let username = username.to_string();
            return self.reject(Some(vec![AUTH_VERSION, 0x01]), SocksError::AuthFailed { username });
        }
        self.authenticated = true;
        self.state = HandshakeState::AwaitCommand;
        Ok(Step::Reply(vec![AUTH_VERSION, 0x00]))
    }

    fn on_command(&mut self, buf: &mut BytesMut) -> std::result::Result<Step, SocksError> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }
        if buf[0] != VERSION {
            return self.close(SocksError::InvalidVersion {
                expected: VERSION,
                got: buf[0],
            });
        }
        if buf.len() < 4 {
            return Ok(Step::NeedMore);
        }
        let cmd = buf[1];
        let atyp = buf[3];
        let (addr, used) = match SocksAddr::parse(&buf[3..]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(Step::NeedMore),
            Err(error @ SocksError::AddrTypeNotSupported { .. }) => {
                let reply = encode_reply(reply::ADDR_TYPE_NOT_SUPPORTED, &SocksAddr::unspecified_v4());
                return self.reject(Some(reply), error);
            }
            Err(error) => return self.close(error),
        };
        buf.advance(3 + used);

        match cmd {
            command::CONNECT => {
                self.state = HandshakeState::Established;
                // The upstream is not connected yet, so there is no real bind
                // address to report.
                let bound = match atyp {
                    atype::IPV6 => SocksAddr::unspecified_v6(),
                    _ => SocksAddr::unspecified_v4(),
                };
                Ok(Step::Connect {
                    reply: encode_reply(reply::SUCCEEDED, &bound),
                    destination: addr.into(),
                })
            }
            command::UDP_ASSOCIATE => {
                self.state = HandshakeState::Established;
                Ok(Step::UdpAssociate { client_hint: addr })
            }
            command::REGISTER_FAKE if self.accept_registrations => {
                self.state = HandshakeState::Established;
                Ok(Step::RegisterFake { real: addr.into() })
            }
            other => self.reject(
                Some(encode_reply(reply::COMMAND_NOT_SUPPORTED, &SocksAddr::zeroed(atyp))),
                SocksError::CommandNotSupported { code: other },
            ),
        }
    }

    pub fn udp_associate_reply(bound: SocketAddr) -> Vec<u8> {
        encode_reply(reply::SUCCEEDED, &SocksAddr::Ip(bound))
    }

    pub fn registration_reply(stored: bool) -> Vec<u8> {
        let code = if stored { reply::SUCCEEDED } else { reply::GENERAL_FAILURE };
        encode_reply(code, &SocksAddr::unspecified_v4())
    }
}

/// Result of a completed front-end negotiation.
#[derive(Debug)]
pub struct Negotiated {
    pub intent: ProxyIntent,
    /// Bytes the client sent after its request, to be relayed first.
    pub pending: BytesMut,
    pub udp_socket: Option<UdpSocket>,
    pub authenticated: bool,
}

/// Runs the state machine over `stream` until the client's intent is known.
///
/// UDP relay sockets are bound on `local_ip`, the address the client reached
/// us on.
pub async fn negotiate<S>(stream: &mut S, mut handshake: Handshake, local_ip: IpAddr) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    loop {
        match handshake.advance(&mut buf)? {
            Step::NeedMore => {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(TunnelError::protocol(format!(
                        "client closed during {}",
                        handshake.state().name()
                    )));
                }
            }
            Step::Reply(bytes) => {
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
            Step::Connect { reply, destination } => {
                stream.write_all(&reply).await?;
                stream.flush().await?;
                debug!(%destination, "CONNECT accepted");
                return Ok(Negotiated {
                    intent: ProxyIntent::Connect(destination),
                    pending: buf,
                    udp_socket: None,
                    authenticated: handshake.authenticated(),
                });
            }
            Step::UdpAssociate { client_hint } => {
                let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
                let bound = socket.local_addr()?;
                stream.write_all(&Handshake::udp_associate_reply(bound)).await?;
                stream.flush().await?;
                debug!(%bound, %client_hint, "UDP ASSOCIATE accepted");
                return Ok(Negotiated {
                    intent: ProxyIntent::UdpAssociate(bound),
                    pending: buf,
                    udp_socket: Some(socket),
                    authenticated: handshake.authenticated(),
                });
            }
            Step::RegisterFake { real } => {
                debug!(%real, "fake endpoint registration received");
                return Ok(Negotiated {
                    intent: ProxyIntent::RegisterFake(real),
                    pending: buf,
                    udp_socket: None,
                    authenticated: handshake.authenticated(),
                });
            }
            Step::Reject { reply, error } => {
                if let Some(reply) = reply {
                    stream.write_all(&reply).await?;
                    stream.flush().await?;
                }
                return Err(error.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(hs: &mut Handshake, bytes: &[u8]) -> std::result::Result<Step, SocksError> {
        let mut buf = BytesMut::from(bytes);
        hs.advance(&mut buf)
    }

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![VERSION, command::CONNECT, 0x00, atype::DOMAIN_NAME, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    #[test]
    fn test_no_auth_greeting_then_connect() {
        let mut hs = Handshake::no_auth();
        assert_eq!(feed(&mut hs, &[5, 1, 0]).unwrap(), Step::Reply(vec![5, 0]));
        assert_eq!(hs.state(), HandshakeState::AwaitCommand);

        match feed(&mut hs, &connect_request("example.test", 80)).unwrap() {
            Step::Connect { reply, destination } => {
                assert_eq!(reply, vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
                assert_eq!(destination, UnresolvedEndpoint::new("example.test", 80));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(hs.state(), HandshakeState::Established);

        // A second command is out of state.
        assert!(feed(&mut hs, &connect_request("example.test", 80)).is_err());
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_partial_greeting_waits() {
        let mut hs = Handshake::no_auth();
        let mut buf = BytesMut::from(&[5u8, 2][..]);
        assert_eq!(hs.advance(&mut buf).unwrap(), Step::NeedMore);
        buf.extend_from_slice(&[2, 0]);
        assert_eq!(hs.advance(&mut buf).unwrap(), Step::Reply(vec![5, 0]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wrong_version_closes() {
        let mut hs = Handshake::no_auth();
        let err = feed(&mut hs, &[4, 1, 0]).unwrap_err();
        assert_eq!(err, SocksError::InvalidVersion { expected: 5, got: 4 });
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_empty_method_list_closes() {
        let mut hs = Handshake::no_auth();
        assert_eq!(feed(&mut hs, &[5, 0]).unwrap_err(), SocksError::NoAcceptableMethods);
    }

    #[test]
    fn test_unsupported_command_echoes_address_type() {
        let mut hs = Handshake::no_auth();
        feed(&mut hs, &[5, 1, 0]).unwrap();
        let mut bind = vec![VERSION, command::BIND, 0x00, atype::IPV6];
        bind.extend_from_slice(&[0u8; 18]);
        match feed(&mut hs, &bind).unwrap() {
            Step::Reject { reply: Some(reply), error } => {
                assert_eq!(reply[1], reply::COMMAND_NOT_SUPPORTED);
                assert_eq!(reply[3], atype::IPV6);
                assert_eq!(error, SocksError::CommandNotSupported { code: command::BIND });
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_registration_command_is_opt_in() {
        let mut register = vec![VERSION, command::REGISTER_FAKE, 0x00, atype::DOMAIN_NAME, 12];
        register.extend_from_slice(b"example.test");
        register.extend_from_slice(&80u16.to_be_bytes());

        let mut hs = Handshake::no_auth();
        feed(&mut hs, &[5, 1, 0]).unwrap();
        match feed(&mut hs, &register).unwrap() {
            Step::Reject { reply: Some(reply), error } => {
                assert_eq!(reply[1], reply::COMMAND_NOT_SUPPORTED);
                assert_eq!(error, SocksError::CommandNotSupported { code: command::REGISTER_FAKE });
            }
            other => panic!("unexpected step {other:?}"),
        }

        let mut hs = Handshake::no_auth().with_registrations(true);
        feed(&mut hs, &[5, 1, 0]).unwrap();
        assert_eq!(
            feed(&mut hs, &register).unwrap(),
            Step::RegisterFake {
                real: UnresolvedEndpoint::new("example.test", 80)
            }
        );
        assert_eq!(hs.state(), HandshakeState::Established);
    }

    #[test]
    fn test_password_auth() {
        let creds = Credentials::new("alice", "pw");
        let mut hs = Handshake::new(Some(creds.clone()), false);
        assert_eq!(feed(&mut hs, &[5, 2, 0, 2]).unwrap(), Step::Reply(vec![5, 2]));
        assert_eq!(hs.state(), HandshakeState::AwaitAuth);
        let ok = [1, 5, b'a', b'l', b'i', b'c', b'e', 2, b'p', b'w'];
        assert!(!hs.authenticated());
        assert_eq!(feed(&mut hs, &ok).unwrap(), Step::Reply(vec![1, 0]));
        assert_eq!(hs.state(), HandshakeState::AwaitCommand);
        assert!(hs.authenticated());

        let mut hs = Handshake::new(Some(creds), false);
        feed(&mut hs, &[5, 1, 2]).unwrap();
        let bad = [1, 5, b'a', b'l', b'i', b'c', b'e', 2, b'n', b'o'];
        match feed(&mut hs, &bad).unwrap() {
            Step::Reject { reply, .. } => assert_eq!(reply, Some(vec![1, 1])),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_auth_required_but_not_offered() {
        let mut hs = Handshake::new(Some(Credentials::new("u", "p")), false);
        match feed(&mut hs, &[5, 1, 0]).unwrap() {
            Step::Reject { reply, error } => {
                assert_eq!(reply, Some(vec![5, 0xFF]));
                assert_eq!(error, SocksError::NoAcceptableMethods);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_trusted_peer_skips_auth() {
        let mut hs = Handshake::new(Some(Credentials::new("u", "p")), true);
        assert_eq!(feed(&mut hs, &[5, 1, 0]).unwrap(), Step::Reply(vec![5, 0]));
    }

    #[tokio::test]
    async fn test_negotiate_keeps_pipelined_bytes() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut script = vec![5, 1, 0];
        script.extend_from_slice(&connect_request("example.test", 80));
        script.extend_from_slice(b"GET / HTTP/1.1\r\n");
        client.write_all(&script).await.unwrap();

        let negotiated = negotiate(&mut server, Handshake::no_auth(), "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            negotiated.intent,
            ProxyIntent::Connect(UnresolvedEndpoint::new("example.test", 80))
        );
        assert_eq!(&negotiated.pending[..], b"GET / HTTP/1.1\r\n");

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies, [5, 0, 5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_negotiate_udp_associate_binds_socket() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(&[5, 1, 0, 5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let negotiated = negotiate(&mut server, Handshake::no_auth(), "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let socket = negotiated.udp_socket.expect("socket bound");
        let bound = socket.local_addr().unwrap();
        assert_eq!(negotiated.intent, ProxyIntent::UdpAssociate(bound));

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[2..6], &[5, 0, 0, atype::IPV4]);
        assert_eq!(u16::from_be_bytes([replies[10], replies[11]]), bound.port());
    }
}
