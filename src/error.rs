//! Error taxonomy for the tunnel core.
//!
//! Protocol and cipher errors are fatal to the connection that raised them.
//! Upstream errors are fatal to one connect attempt. Registration errors are
//! logged by the caller and never reach the data path.

use thiserror::Error;

use crate::socks5::SocksError;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed or out-of-state message from a peer
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("socks5: {0}")]
    Socks(#[from] SocksError),

    /// Router produced no upstream for the destination
    #[error("no upstream available for {0}")]
    NoUpstream(String),

    #[error("connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    /// Backend answered the CONNECT with a non-success reply code
    #[error("upstream {endpoint} rejected request with reply 0x{code:02x}")]
    UpstreamRejected { endpoint: String, code: u8 },

    #[error("backend {0} rejected credentials")]
    AuthRejected(String),

    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Integrity or key-schedule failure
    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fake endpoint registration failed: {0}")]
    Registration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TunnelError::Protocol(msg.into())
    }

    pub fn cipher(msg: impl Into<String>) -> Self {
        TunnelError::Cipher(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, TunnelError::Protocol(_) | TunnelError::Socks(_))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            TunnelError::NoUpstream(_)
                | TunnelError::ConnectTimeout { .. }
                | TunnelError::UpstreamRejected { .. }
                | TunnelError::AuthRejected(_)
        )
    }

    /// Cipher failures, including integrity failures surfaced through the
    /// stream codec as `InvalidData`.
    pub fn is_cipher(&self) -> bool {
        match self {
            TunnelError::Cipher(_) | TunnelError::UnsupportedCipher(_) => true,
            TunnelError::Io(e) => e.kind() == std::io::ErrorKind::InvalidData,
            _ => false,
        }
    }
}

impl From<TunnelError> for std::io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::Cipher(msg) => std::io::Error::new(std::io::ErrorKind::InvalidData, msg),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
