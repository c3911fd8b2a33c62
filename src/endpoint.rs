use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// A destination as named by the client, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnresolvedEndpoint {
    host: String,
    port: u16,
}

impl UnresolvedEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP literal, if it is one. Bracketed IPv6 is accepted.
    pub fn ip(&self) -> Option<IpAddr> {
        let host = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);
        host.parse().ok()
    }

    pub fn is_ip_literal(&self) -> bool {
        self.ip().is_some()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for UnresolvedEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Canonical `host:port`, with IPv6 literals bracketed.
impl fmt::Display for UnresolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for UnresolvedEndpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::config(format!("endpoint `{s}` has no port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::config(format!("endpoint `{s}` has an invalid port")))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(TunnelError::config(format!("endpoint `{s}` has no host")));
        }
        Ok(Self::new(host, port))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A backend proxy address plus optional credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticEndpoint {
    #[serde(flatten)]
    pub endpoint: UnresolvedEndpoint,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl AuthenticEndpoint {
    pub fn new(endpoint: UnresolvedEndpoint, credentials: Option<Credentials>) -> Self {
        Self {
            endpoint,
            credentials,
        }
    }
}

impl fmt::Display for AuthenticEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_host_and_port() {
        let a = UnresolvedEndpoint::new("example.test", 80);
        assert_eq!(a, UnresolvedEndpoint::new("example.test", 80));
        assert_ne!(a, UnresolvedEndpoint::new("example.test", 81));
    }

    #[test]
    fn test_ip_literal_detection() {
        assert!(UnresolvedEndpoint::new("10.1.2.3", 80).is_ip_literal());
        assert!(UnresolvedEndpoint::new("::1", 80).is_ip_literal());
        assert!(UnresolvedEndpoint::new("[::1]", 80).is_ip_literal());
        assert!(!UnresolvedEndpoint::new("example.test", 80).is_ip_literal());
        assert!(!UnresolvedEndpoint::new("10.1.2", 80).is_ip_literal());
    }

    #[test]
    fn test_display_and_parse() {
        let ep: UnresolvedEndpoint = "example.test:8080".parse().unwrap();
        assert_eq!(ep.host(), "example.test");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "example.test:8080");

        let v6: UnresolvedEndpoint = "[::1]:53".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:53");

        assert!("no-port".parse::<UnresolvedEndpoint>().is_err());
        assert!("host:99999".parse::<UnresolvedEndpoint>().is_err());
        assert!(":80".parse::<UnresolvedEndpoint>().is_err());
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let creds = Credentials::new("alice", "s3cret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_authentic_endpoint_deserializes_flat() {
        let json = r#"{"host":"relay.test","port":1080,"credentials":{"username":"u","password":"p"}}"#;
        let ep: AuthenticEndpoint = serde_json::from_str(json).unwrap();
        assert_eq!(ep.endpoint, UnresolvedEndpoint::new("relay.test", 1080));
        assert_eq!(ep.credentials, Some(Credentials::new("u", "p")));
    }
}
