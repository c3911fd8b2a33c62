use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::RegistryPolicy;
use crate::cipher::CipherProvider;
use crate::endpoint::{AuthenticEndpoint, Credentials, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};
use crate::logging::LogLevel;

/// Top-level tunnel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub proxy_policy: ProxyPolicy,
    pub upstream: UpstreamConfig,
    pub fake_endpoint: FakeEndpointPolicy,
    pub cache: CachePolicy,
    pub log_level: LogLevel,
}

impl TunnelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: TunnelConfig =
            serde_json::from_str(raw).map_err(|e| TunnelError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would only fail later, per connection.
    pub fn validate(&self) -> Result<()> {
        for cipher in [&self.proxy_policy.cipher, &self.upstream.cipher]
            .into_iter()
            .flatten()
            .chain(self.upstream.udp_backend.as_ref().map(|b| &b.cipher))
        {
            if !CipherProvider::is_supported(&cipher.name) {
                return Err(TunnelError::UnsupportedCipher(cipher.name.clone()));
            }
        }
        if self.fake_endpoint.obfuscation_ports.is_empty() {
            return Err(TunnelError::config("fake_endpoint.obfuscation_ports must not be empty"));
        }
        if self.fake_endpoint.host_suffix.is_empty() {
            return Err(TunnelError::config("fake_endpoint.host_suffix must not be empty"));
        }
        if self.upstream.connect_timeout_ms == 0 {
            return Err(TunnelError::config("upstream.connect_timeout_ms must be positive"));
        }
        if self.cache.hot_capacity == 0 {
            return Err(TunnelError::config("cache.hot_capacity must be positive"));
        }
        Ok(())
    }
}

/// Client-facing listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPolicy {
    pub bind_address: String,
    pub bind_port: u16,
    /// Username/password required from clients that are not white-listed
    pub authentication: Option<Credentials>,
    /// Set when this node is itself the encrypted backend of another node
    pub cipher: Option<CipherConfig>,
    /// Accept fake-endpoint registrations pushed by an upstream node
    pub accept_fake_registration: bool,
    pub white_list_ttl_secs: u64,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 1080,
            authentication: None,
            cipher: None,
            accept_fake_registration: true,
            white_list_ttl_secs: 300,
        }
    }
}

impl ProxyPolicy {
    pub fn bind_addr(&self) -> String {
        UnresolvedEndpoint::new(self.bind_address.clone(), self.bind_port).to_string()
    }

    pub fn white_list_ttl(&self) -> Duration {
        Duration::from_secs(self.white_list_ttl_secs)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherConfig {
    pub name: String,
    pub secret: String,
}

impl CipherConfig {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherConfig")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    #[default]
    Direct,
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub route_mode: RouteMode,
    /// Chosen round-robin in `backend` mode
    pub backends: Vec<AuthenticEndpoint>,
    /// Wraps every backend connection
    pub cipher: Option<CipherConfig>,
    pub connect_timeout_ms: u64,
    pub udp_backend: Option<UdpBackendConfig>,
    /// Push fake-endpoint mappings to the chosen backend. Off means hostname
    /// destinations travel to backends unsubstituted.
    pub propagate_fake_endpoints: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            route_mode: RouteMode::Direct,
            backends: Vec::new(),
            cipher: None,
            connect_timeout_ms: 10_000,
            udp_backend: None,
            propagate_fake_endpoints: true,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Encrypted datagram relay for UDP ASSOCIATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpBackendConfig {
    pub endpoint: UnresolvedEndpoint,
    pub cipher: CipherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeEndpointPolicy {
    pub host_suffix: String,
    pub fake_ips: HashSet<IpAddr>,
    pub fake_ports: HashSet<u16>,
    pub obfuscation_ports: Vec<u16>,
    pub registration_timeout_ms: u64,
    pub ttl_secs: u64,
}

impl Default for FakeEndpointPolicy {
    fn default() -> Self {
        Self {
            host_suffix: ".fake.internal".to_string(),
            fake_ips: HashSet::new(),
            fake_ports: HashSet::new(),
            obfuscation_ports: vec![443, 3306],
            registration_timeout_ms: 5_000,
            ttl_secs: 600,
        }
    }
}

impl FakeEndpointPolicy {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub hot_capacity: usize,
    pub ttl_secs: u64,
    /// Cold tier for fake-endpoint hashes; `None` keeps only the hot tier
    pub cold_capacity: Option<usize>,
    pub cold_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            hot_capacity: 4096,
            ttl_secs: 120,
            cold_capacity: Some(65_536),
            cold_ttl_secs: 3600,
            sweep_interval_secs: 30,
        }
    }
}

impl CachePolicy {
    /// Policy for the fake-endpoint registry.
    pub fn fake_registry(&self, fake: &FakeEndpointPolicy) -> RegistryPolicy {
        RegistryPolicy {
            hot_capacity: self.hot_capacity,
            default_ttl: fake.ttl(),
            cold_capacity: self.cold_capacity,
            cold_ttl: Duration::from_secs(self.cold_ttl_secs),
        }
    }

    /// Policy for the endpoint-link registry. Links live only as long as
    /// the hot tier keeps them.
    pub fn link_registry(&self) -> RegistryPolicy {
        RegistryPolicy {
            hot_capacity: self.hot_capacity,
            default_ttl: Duration::from_secs(self.ttl_secs),
            cold_capacity: None,
            cold_ttl: Duration::from_secs(self.cold_ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TunnelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fake_endpoint.obfuscation_ports, vec![443, 3306]);
        assert_eq!(config.fake_endpoint.host_suffix, ".fake.internal");
        assert_eq!(config.proxy_policy.bind_addr(), "127.0.0.1:1080");
        assert!(config.proxy_policy.accept_fake_registration);
        assert_eq!(config.proxy_policy.white_list_ttl(), Duration::from_secs(300));
        assert!(config.upstream.propagate_fake_endpoints);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = TunnelConfig::from_json(
            r#"{
                "proxy_policy": {"bind_port": 9050},
                "upstream": {
                    "route_mode": "backend",
                    "backends": [{"host": "relay.test", "port": 1080}],
                    "cipher": {"name": "aes-256-gcm", "secret": "s"}
                },
                "log_level": "debug"
            }"#,
        )
        .unwrap();
        assert_eq!(config.proxy_policy.bind_port, 9050);
        assert_eq!(config.proxy_policy.bind_address, "127.0.0.1");
        assert_eq!(config.upstream.route_mode, RouteMode::Backend);
        assert_eq!(config.upstream.backends.len(), 1);
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_unsupported_cipher_is_rejected() {
        let err = TunnelConfig::from_json(r#"{"upstream": {"cipher": {"name": "rot13", "secret": "s"}}}"#)
            .unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedCipher(ref n) if n == "rot13"));
    }

    #[test]
    fn test_empty_obfuscation_ports_are_rejected() {
        let err = TunnelConfig::from_json(r#"{"fake_endpoint": {"obfuscation_ports": []}}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"proxy_policy": {{"bind_address": "0.0.0.0", "bind_port": 1081}}}}"#).unwrap();
        let config = TunnelConfig::load(file.path()).unwrap();
        assert_eq!(config.proxy_policy.bind_addr(), "0.0.0.0:1081");

        assert!(TunnelConfig::load("/definitely/not/here.json").is_err());
    }

    #[test]
    fn test_secret_is_redacted() {
        let rendered = format!("{:?}", CipherConfig::new("aes-128-gcm", "topsecret"));
        assert!(!rendered.contains("topsecret"));
    }
}
