//! `CipherStream`: an `AsyncRead + AsyncWrite` adapter that encrypts what is
//! written and decrypts what is read, so handshakes and the relay run
//! unchanged over an encrypted hop.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::CipherPair;

const READ_CHUNK: usize = 16 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

pub struct CipherStream<S> {
    inner: S,
    pair: CipherPair,
    read_buf: Vec<u8>,
    /// Decrypted bytes not yet handed to the reader.
    plain: BytesMut,
    /// Encrypted bytes not yet accepted by `inner`.
    sealed: BytesMut,
    read_eof: bool,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, pair: CipherPair) -> Self {
        Self {
            inner,
            pair,
            read_buf: vec![0u8; READ_CHUNK],
            plain: BytesMut::new(),
            sealed: BytesMut::new(),
            read_eof: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.sealed.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.sealed))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.sealed.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                if this.pair.decryptor.has_partial_input() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encrypted frame",
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.read_buf);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            if raw.filled().is_empty() {
                this.read_eof = true;
                continue;
            }
            this.pair
                .decryptor
                .update_into(raw.filled(), &mut this.plain)
                .map_err(io::Error::from)?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(WRITE_CHUNK);
        this.pair
            .encryptor
            .update_into(&buf[..take], &mut this.sealed)
            .map_err(io::Error::from)?;

        // The input is consumed either way; whatever `inner` does not take now
        // goes out on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
