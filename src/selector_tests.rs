use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cache::{CacheRegistry, RegistryPolicy};
use crate::cipher::{CipherProvider, CipherStream};
use crate::config::{CipherConfig, FakeEndpointPolicy};
use crate::endpoint::{AuthenticEndpoint, Credentials, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};
use crate::socks5::{negotiate, Handshake, ProxyIntent};
use crate::upstream::{endpoint_hash, FakeEndpoints, SocksSupport, Upstream, UpstreamSelector, UpstreamSupport};

#[derive(Default)]
struct RecordingSupport {
    registered: parking_lot::Mutex<Vec<(u64, String)>>,
    calls: AtomicUsize,
}

#[async_trait]
impl SocksSupport for RecordingSupport {
    async fn fake_endpoint(&self, hash: u64, real_endpoint: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().push((hash, real_endpoint.to_string()));
        Ok(())
    }

    async fn resolve_host(&self, _host: &str) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    async fn add_white_list(&self, _addr: IpAddr) -> Result<()> {
        Ok(())
    }
}

fn fake_endpoints() -> Arc<FakeEndpoints> {
    Arc::new(FakeEndpoints::new(
        &FakeEndpointPolicy::default(),
        Arc::new(CacheRegistry::new("fake", RegistryPolicy::default())),
    ))
}

fn selector(cipher: Option<CipherConfig>) -> UpstreamSelector {
    UpstreamSelector::new(Duration::from_secs(5), cipher, fake_endpoints())
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A one-shot backend that negotiates like a real node and reports the
/// destination it was asked for, then echoes.
async fn recording_backend(
    cipher: Option<CipherConfig>,
    credentials: Option<Credentials>,
) -> (SocketAddr, tokio::task::JoinHandle<UnresolvedEndpoint>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream: crate::relay::BoxStream = match cipher {
            Some(c) => Box::new(CipherStream::new(tcp, CipherProvider::get(&c.name, &c.secret, false).unwrap())),
            None => Box::new(tcp),
        };
        let negotiated = negotiate(&mut stream, Handshake::new(credentials, false), "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let ProxyIntent::Connect(destination) = negotiated.intent else {
            panic!("expected CONNECT");
        };
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
        stream.flush().await.unwrap();
        destination
    });
    (addr, task)
}

fn via(backend: SocketAddr, credentials: Option<Credentials>, support: Option<Arc<dyn SocksSupport>>) -> Upstream {
    Upstream::Proxy(UpstreamSupport {
        endpoint: AuthenticEndpoint::new(backend.into(), credentials),
        support,
    })
}

async fn ping(stream: &mut crate::relay::BoxStream) -> Vec<u8> {
    stream.write_all(b"ping").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    buf.to_vec()
}

#[tokio::test]
async fn test_direct_connect_reaches_destination() {
    let echo = echo_server().await;
    let selector = selector(None);
    let dest = UnresolvedEndpoint::from(echo);

    let mut channel = selector.connect(&dest, || Some(Upstream::Direct)).await.unwrap();
    assert_eq!(channel.peer_addr, echo);
    assert_eq!(channel.requested, dest);
    assert!(channel.registration.is_none());
    assert_eq!(ping(&mut channel.stream).await, b"ping");
}

#[tokio::test]
async fn test_backend_connect_with_cipher_and_auth() {
    let cipher = CipherConfig::new("chacha20-ietf-poly1305", "between nodes");
    let creds = Credentials::new("node", "secret");
    let (backend, recorded) = recording_backend(Some(cipher.clone()), Some(creds.clone())).await;

    let selector = selector(Some(cipher));
    let dest = UnresolvedEndpoint::new("10.20.30.40", 8080);
    let mut channel = selector
        .connect(&dest, || Some(via(backend, Some(creds), None)))
        .await
        .unwrap();
    assert_eq!(channel.peer_addr, backend);
    assert_eq!(ping(&mut channel.stream).await, b"ping");

    // No collaborator means no substitution.
    assert_eq!(recorded.await.unwrap(), dest);
}

#[tokio::test]
async fn test_hostname_is_substituted_for_backend() {
    let (backend, recorded) = recording_backend(None, None).await;
    let support = Arc::new(RecordingSupport::default());
    let selector = selector(None);
    let dest = UnresolvedEndpoint::new("example.test", 80);

    let support_dyn: Arc<dyn SocksSupport> = support.clone();
    let mut channel = selector
        .connect(&dest, || Some(via(backend, None, Some(support_dyn))))
        .await
        .unwrap();
    assert_eq!(ping(&mut channel.stream).await, b"ping");

    let hash = endpoint_hash("example.test:80");
    let requested = recorded.await.unwrap();
    assert_eq!(requested.host(), format!("{hash}.fake.internal"));
    assert!([443, 3306].contains(&requested.port()));
    assert_eq!(channel.requested, requested);

    channel.registration.take().expect("first use registers").await.unwrap();
    assert_eq!(support.registered.lock().as_slice(), &[(hash, "example.test:80".to_string())]);
    assert_eq!(
        selector.fake_endpoints().registry().get(&hash).as_deref(),
        Some("example.test:80")
    );
}

#[tokio::test]
async fn test_ip_literal_is_not_substituted() {
    let (backend, recorded) = recording_backend(None, None).await;
    let support: Arc<dyn SocksSupport> = Arc::new(RecordingSupport::default());
    let selector = selector(None);
    let dest = UnresolvedEndpoint::new("192.0.2.10", 443);

    let mut channel = selector
        .connect(&dest, || Some(via(backend, None, Some(support))))
        .await
        .unwrap();
    ping(&mut channel.stream).await;
    assert_eq!(recorded.await.unwrap(), dest);
    assert!(channel.registration.is_none());
}

#[tokio::test]
async fn test_no_route_fails_attempt() {
    let selector = selector(None);
    let err = selector
        .connect(&UnresolvedEndpoint::new("example.test", 80), || None)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::NoUpstream(_)));
    assert!(err.is_upstream());
}

#[tokio::test]
async fn test_refused_backend_is_io_error() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let selector = selector(None);
    let err = selector
        .connect(&UnresolvedEndpoint::new("192.0.2.1", 80), || Some(via(closed, None, None)))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Io(_)));
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let held: tokio::task::JoinHandle<TcpStream> = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let selector = UpstreamSelector::new(Duration::from_millis(200), None, fake_endpoints());
    let err = selector
        .connect(&UnresolvedEndpoint::new("192.0.2.1", 80), || Some(via(backend, None, None)))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::ConnectTimeout { timeout_ms: 200, .. }));
    drop(held);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let (backend, _recorded) = recording_backend(None, Some(Credentials::new("node", "right"))).await;
    let selector = selector(None);
    let err = selector
        .connect(&UnresolvedEndpoint::new("192.0.2.1", 80), || {
            Some(via(backend, Some(Credentials::new("node", "wrong")), None))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AuthRejected(_)));
}
