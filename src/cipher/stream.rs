//! RC4-MD5 keystream sessions: `iv(16) ‖ RC4(MD5(master ‖ iv), data)`.

use bytes::BytesMut;
use rc4::consts::U16;
use rc4::{KeyInit, Rc4, StreamCipher};

use super::kdf::{md5_session_key, random_bytes};
use crate::error::{Result, TunnelError};

pub const IV_LEN: usize = 16;

fn keystream(master: &[u8], iv: &[u8]) -> Result<Rc4<U16>> {
    let key = md5_session_key(master, iv);
    Rc4::<U16>::new_from_slice(&key).map_err(|_| TunnelError::cipher("invalid rc4 key length"))
}

pub(crate) struct Rc4Md5Encryptor {
    master: Vec<u8>,
    rc4: Option<Rc4<U16>>,
}

impl Rc4Md5Encryptor {
    pub(crate) fn new(master: Vec<u8>) -> Self {
        Self { master, rc4: None }
    }

    pub(crate) fn encrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        let rc4 = match self.rc4.as_mut() {
            Some(rc4) => rc4,
            None => {
                let iv = random_bytes(IV_LEN);
                out.extend_from_slice(&iv);
                self.rc4.insert(keystream(&self.master, &iv)?)
            }
        };
        let start = out.len();
        out.extend_from_slice(input);
        rc4.apply_keystream(&mut out[start..]);
        Ok(())
    }
}

pub(crate) struct Rc4Md5Decryptor {
    master: Vec<u8>,
    iv: Vec<u8>,
    rc4: Option<Rc4<U16>>,
}

impl Rc4Md5Decryptor {
    pub(crate) fn new(master: Vec<u8>) -> Self {
        Self {
            master,
            iv: Vec::with_capacity(IV_LEN),
            rc4: None,
        }
    }

    pub(crate) fn has_partial_input(&self) -> bool {
        self.rc4.is_none() && !self.iv.is_empty()
    }

    pub(crate) fn decrypt(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        if self.rc4.is_none() {
            let need = IV_LEN - self.iv.len();
            let take = need.min(input.len());
            self.iv.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.iv.len() < IV_LEN {
                return Ok(());
            }
            self.rc4 = Some(keystream(&self.master, &self.iv)?);
        }
        if let Some(rc4) = self.rc4.as_mut() {
            let start = out.len();
            out.extend_from_slice(input);
            rc4.apply_keystream(&mut out[start..]);
        }
        Ok(())
    }
}

pub(crate) fn seal_packet(master: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let iv = random_bytes(IV_LEN);
    let mut rc4 = keystream(master, &iv)?;
    let mut packet = iv;
    let start = packet.len();
    packet.extend_from_slice(payload);
    rc4.apply_keystream(&mut packet[start..]);
    Ok(packet)
}

pub(crate) fn open_packet(master: &[u8], packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < IV_LEN {
        return Err(TunnelError::cipher("datagram shorter than iv"));
    }
    let (iv, body) = packet.split_at(IV_LEN);
    let mut rc4 = keystream(master, iv)?;
    let mut plain = body.to_vec();
    rc4.apply_keystream(&mut plain);
    Ok(plain)
}
