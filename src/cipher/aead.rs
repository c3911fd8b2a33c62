//! AEAD sessions (AES-GCM family, ChaCha20-Poly1305).
//!
//! Stream framing: `salt ‖ ( seal(len:u16be) ‖ seal(payload) )*`, payload at
//! most `MAX_PAYLOAD` bytes, nonce a 12-byte little-endian counter bumped
//! after every seal/open. Datagram framing: `salt ‖ seal(payload)` with a
//! zero nonce, the salt giving each datagram its own subkey.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;

use super::kdf::{derive_subkey, random_bytes};
use super::CipherKind;
use crate::error::{Result, TunnelError};

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const MAX_PAYLOAD: usize = 0x3FFF;

type Aes192Gcm = AesGcm<Aes192, U12>;

#[allow(clippy::large_enum_variant)]
enum AeadInner {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
    ChaCha20(ChaCha20Poly1305),
}

/// Keyed AEAD with a running nonce.
struct AeadCore {
    inner: AeadInner,
    nonce: [u8; NONCE_LEN],
}

impl AeadCore {
    fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        let bad_key = |_| TunnelError::cipher(format!("invalid key length for {}", kind.name()));
        let inner = match kind {
            CipherKind::Aes128Gcm => AeadInner::Aes128(Aes128Gcm::new_from_slice(key).map_err(bad_key)?),
            CipherKind::Aes192Gcm => AeadInner::Aes192(Aes192Gcm::new_from_slice(key).map_err(bad_key)?),
            CipherKind::Aes256Gcm => AeadInner::Aes256(Aes256Gcm::new_from_slice(key).map_err(bad_key)?),
            CipherKind::ChaCha20IetfPoly1305 => {
                AeadInner::ChaCha20(ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?)
            }
            #[allow(unreachable_patterns)]
            other => return Err(TunnelError::cipher(format!("{} is not an AEAD cipher", other.name()))),
        };
        Ok(Self {
            inner,
            nonce: [0u8; NONCE_LEN],
        })
    }

    fn bump_nonce(&mut self) {
        for byte in self.nonce.iter_mut() {
            let (next, carry) = byte.overflowing_add(1);
            *byte = next;
            if !carry {
                break;
            }
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let sealed = match &self.inner {
            AeadInner::Aes128(c) => c.encrypt(nonce, plaintext),
            AeadInner::Aes192(c) => c.encrypt(nonce, plaintext),
            AeadInner::Aes256(c) => c.encrypt(nonce, plaintext),
            AeadInner::ChaCha20(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| TunnelError::cipher("AEAD seal failed"))?;
        self.bump_nonce();
        Ok(sealed)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(TunnelError::cipher("ciphertext shorter than tag"));
        }
        let nonce = GenericArray::from_slice(&self.nonce);
        let opened = match &self.inner {
            AeadInner::Aes128(c) => c.decrypt(nonce, ciphertext),
            AeadInner::Aes192(c) => c.decrypt(nonce, ciphertext),
            AeadInner::Aes256(c) => c.decrypt(nonce, ciphertext),
            AeadInner::ChaCha20(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| TunnelError::cipher("authentication tag mismatch"))?;
        self.bump_nonce();
        Ok(opened)
    }
}

pub(crate) struct AeadEncryptor {
    kind: CipherKind,
    master: Vec<u8>,
    core: Option<AeadCore>,
}

impl AeadEncryptor {
    pub(crate) fn new(kind: CipherKind, master: Vec<u8>) -> Self {
        Self {
            kind,
            master,
            core: None,
        }
    }

    pub(crate) fn encrypt(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        let core = match self.core.as_mut() {
            Some(core) => core,
            None => {
                let salt = random_bytes(self.kind.salt_len());
                let subkey = derive_subkey(&self.master, &salt)?;
                out.extend_from_slice(&salt);
                self.core.insert(AeadCore::new(self.kind, &subkey)?)
            }
        };

        while !input.is_empty() {
            let take = input.len().min(MAX_PAYLOAD);
            let (chunk, rest) = input.split_at(take);
            out.extend_from_slice(&core.seal(&(take as u16).to_be_bytes())?);
            out.extend_from_slice(&core.seal(chunk)?);
            input = rest;
        }
        Ok(())
    }
}

pub(crate) struct AeadDecryptor {
    kind: CipherKind,
    master: Vec<u8>,
    core: Option<AeadCore>,
    buf: BytesMut,
    payload_len: Option<usize>,
}

impl AeadDecryptor {
    pub(crate) fn new(kind: CipherKind, master: Vec<u8>) -> Self {
        Self {
            kind,
            master,
            core: None,
            buf: BytesMut::new(),
            payload_len: None,
        }
    }

    pub(crate) fn has_partial_input(&self) -> bool {
        !self.buf.is_empty() || self.payload_len.is_some()
    }

    /// Appends whatever complete frames `input` finishes to `out`; partial
    /// frames wait in the internal buffer.
    pub(crate) fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        self.buf.extend_from_slice(input);

        if self.core.is_none() {
            let salt_len = self.kind.salt_len();
            if self.buf.len() < salt_len {
                return Ok(());
            }
            let salt = self.buf.split_to(salt_len);
            let subkey = derive_subkey(&self.master, &salt)?;
            self.core = Some(AeadCore::new(self.kind, &subkey)?);
        }
        let Some(core) = self.core.as_mut() else {
            return Ok(());
        };

        loop {
            match self.payload_len {
                None => {
                    if self.buf.len() < 2 + TAG_LEN {
                        return Ok(());
                    }
                    let len = core.open(&self.buf[..2 + TAG_LEN])?;
                    self.buf.advance(2 + TAG_LEN);
                    let len = u16::from_be_bytes([len[0], len[1]]) as usize & MAX_PAYLOAD;
                    self.payload_len = Some(len);
                }
                Some(len) => {
                    if self.buf.len() < len + TAG_LEN {
                        return Ok(());
                    }
                    let plain = core.open(&self.buf[..len + TAG_LEN])?;
                    self.buf.advance(len + TAG_LEN);
                    self.payload_len = None;
                    out.extend_from_slice(&plain);
                }
            }
        }
    }
}

pub(crate) fn seal_packet(kind: CipherKind, master: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let salt = random_bytes(kind.salt_len());
    let subkey = derive_subkey(master, &salt)?;
    let mut core = AeadCore::new(kind, &subkey)?;
    let mut packet = salt;
    packet.extend_from_slice(&core.seal(payload)?);
    Ok(packet)
}

pub(crate) fn open_packet(kind: CipherKind, master: &[u8], packet: &[u8]) -> Result<Vec<u8>> {
    let salt_len = kind.salt_len();
    if packet.len() < salt_len + TAG_LEN {
        return Err(TunnelError::cipher("datagram too short"));
    }
    let (salt, sealed) = packet.split_at(salt_len);
    let subkey = derive_subkey(master, salt)?;
    AeadCore::new(kind, &subkey)?.open(sealed)
}
