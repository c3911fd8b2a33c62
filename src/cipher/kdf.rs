//! Key schedule helpers.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::error::{Result, TunnelError};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// OpenSSL `EVP_BytesToKey` with MD5 and one iteration, no salt.
pub fn evp_bytes_to_key(secret: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(secret);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// Per-connection AEAD subkey: HKDF-SHA1(salt, master).
pub fn derive_subkey(master: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    let mut okm = vec![0u8; master.len()];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| TunnelError::cipher("HKDF expansion failed"))?;
    Ok(okm)
}

/// MD5(master ‖ iv), the RC4-MD5 session key.
pub fn md5_session_key(master: &[u8], iv: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(master);
    hasher.update(iv);
    hasher.finalize().into()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}
