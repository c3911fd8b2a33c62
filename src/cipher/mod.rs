//! Cipher Provider: maps a cipher name and shared secret to a pair of
//! per-connection sessions, one per direction.
//!
//! The supported set is closed. Adding a cipher means adding a
//! [`CipherKind`] variant and wiring its sessions below.

mod aead;
mod codec;
mod kdf;
#[cfg(feature = "stream-ciphers")]
mod stream;

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

pub use codec::CipherStream;
pub use kdf::evp_bytes_to_key;

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
    #[cfg(feature = "stream-ciphers")]
    Rc4Md5,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => CipherKind::Aes128Gcm,
            "aes-192-gcm" => CipherKind::Aes192Gcm,
            "aes-256-gcm" => CipherKind::Aes256Gcm,
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => CipherKind::ChaCha20IetfPoly1305,
            #[cfg(feature = "stream-ciphers")]
            "rc4-md5" => CipherKind::Rc4Md5,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
            #[cfg(feature = "stream-ciphers")]
            CipherKind::Rc4Md5 => "rc4-md5",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305 => 32,
            #[cfg(feature = "stream-ciphers")]
            CipherKind::Rc4Md5 => 16,
        }
    }

    /// Salt length for AEAD kinds, IV length for stream kinds.
    pub fn salt_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305 => 32,
            #[cfg(feature = "stream-ciphers")]
            CipherKind::Rc4Md5 => stream::IV_LEN,
        }
    }

    pub fn is_aead(&self) -> bool {
        match self {
            #[cfg(feature = "stream-ciphers")]
            CipherKind::Rc4Md5 => false,
            _ => true,
        }
    }

    pub fn all() -> &'static [CipherKind] {
        &[
            CipherKind::Aes128Gcm,
            CipherKind::Aes192Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20IetfPoly1305,
            #[cfg(feature = "stream-ciphers")]
            CipherKind::Rc4Md5,
        ]
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        CipherKind::from_name(s).ok_or_else(|| TunnelError::UnsupportedCipher(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

enum SessionState {
    AeadEncrypt(aead::AeadEncryptor),
    AeadDecrypt(aead::AeadDecryptor),
    #[cfg(feature = "stream-ciphers")]
    Rc4Encrypt(stream::Rc4Md5Encryptor),
    #[cfg(feature = "stream-ciphers")]
    Rc4Decrypt(stream::Rc4Md5Decryptor),
    /// Datagram sessions hold no running state.
    Packet,
}

/// One direction of one connection. Never shared across connections.
pub struct CipherSession {
    kind: CipherKind,
    key: Vec<u8>,
    direction: Direction,
    udp_mode: bool,
    state: SessionState,
    failed: bool,
}

impl fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSession")
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("udp_mode", &self.udp_mode)
            .finish_non_exhaustive()
    }
}

impl CipherSession {
    fn new(kind: CipherKind, key: Vec<u8>, direction: Direction, udp_mode: bool) -> Self {
        let state = if udp_mode {
            SessionState::Packet
        } else {
            match (kind.is_aead(), direction) {
                (true, Direction::Encrypt) => {
                    SessionState::AeadEncrypt(aead::AeadEncryptor::new(kind, key.clone()))
                }
                (true, Direction::Decrypt) => {
                    SessionState::AeadDecrypt(aead::AeadDecryptor::new(kind, key.clone()))
                }
                #[cfg(feature = "stream-ciphers")]
                (false, Direction::Encrypt) => {
                    SessionState::Rc4Encrypt(stream::Rc4Md5Encryptor::new(key.clone()))
                }
                #[cfg(feature = "stream-ciphers")]
                (false, Direction::Decrypt) => {
                    SessionState::Rc4Decrypt(stream::Rc4Md5Decryptor::new(key.clone()))
                }
                #[allow(unreachable_patterns)]
                _ => SessionState::Packet,
            }
        };
        Self {
            kind,
            key,
            direction,
            udp_mode,
            state,
            failed: false,
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_udp(&self) -> bool {
        self.udp_mode
    }

    /// Transforms `input` according to this session's direction.
    ///
    /// In stream mode the output may be shorter than a frame's worth of input
    /// (the decryptor keeps partial frames until the rest arrives). In UDP mode
    /// `input` is exactly one datagram. After an integrity failure the session
    /// refuses all further input.
    pub fn update(&mut self, input: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(input.len() + 64);
        self.update_into(input, &mut out)?;
        Ok(out.freeze())
    }

    pub fn update_into(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        if self.failed {
            return Err(TunnelError::cipher("session closed after integrity failure"));
        }
        let result = self.apply(input, out);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn apply(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match &mut self.state {
            SessionState::AeadEncrypt(enc) => enc.encrypt(input, out),
            SessionState::AeadDecrypt(dec) => dec.decrypt(input, out),
            #[cfg(feature = "stream-ciphers")]
            SessionState::Rc4Encrypt(enc) => enc.encrypt(input, out),
            #[cfg(feature = "stream-ciphers")]
            SessionState::Rc4Decrypt(dec) => dec.decrypt(input, out),
            SessionState::Packet => {
                let packet = self.transform_packet(input)?;
                out.extend_from_slice(&packet);
                Ok(())
            }
        }
    }

    fn transform_packet(&self, input: &[u8]) -> Result<Vec<u8>> {
        match (self.kind.is_aead(), self.direction) {
            (true, Direction::Encrypt) => aead::seal_packet(self.kind, &self.key, input),
            (true, Direction::Decrypt) => aead::open_packet(self.kind, &self.key, input),
            #[cfg(feature = "stream-ciphers")]
            (false, Direction::Encrypt) => stream::seal_packet(&self.key, input),
            #[cfg(feature = "stream-ciphers")]
            (false, Direction::Decrypt) => stream::open_packet(&self.key, input),
            #[allow(unreachable_patterns)]
            _ => Err(TunnelError::UnsupportedCipher(self.kind.name().to_string())),
        }
    }

    /// True when the decryptor holds bytes of an unfinished frame.
    pub fn has_partial_input(&self) -> bool {
        match &self.state {
            SessionState::AeadDecrypt(dec) => dec.has_partial_input(),
            #[cfg(feature = "stream-ciphers")]
            SessionState::Rc4Decrypt(dec) => dec.has_partial_input(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct CipherPair {
    pub encryptor: CipherSession,
    pub decryptor: CipherSession,
}

/// Stateless factory for cipher sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CipherProvider;

impl CipherProvider {
    pub fn get(name: &str, secret: &str, for_udp: bool) -> Result<CipherPair> {
        let kind: CipherKind = name.parse()?;
        Ok(Self::for_kind(kind, secret, for_udp))
    }

    pub fn for_kind(kind: CipherKind, secret: &str, for_udp: bool) -> CipherPair {
        let master = evp_bytes_to_key(secret.as_bytes(), kind.key_len());
        CipherPair {
            encryptor: CipherSession::new(kind, master.clone(), Direction::Encrypt, for_udp),
            decryptor: CipherSession::new(kind, master, Direction::Decrypt, for_udp),
        }
    }

    pub fn is_supported(name: &str) -> bool {
        CipherKind::from_name(name).is_some()
    }
}
