//! Bidirectional byte relay between two established channels.
//!
//! Each direction is a [`pipe`]. A side becomes inactive once a write to it
//! fails because its peer is gone; data still arriving for it is read and
//! dropped. End of input on one side flushes and then shuts down the write
//! half of the other. Any other I/O error ends the relay, which drops (and so
//! closes) both channels.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const BUFFER_SIZE: usize = 65536; // 64KB

/// Any stream the relay can carry: plain TCP, a cipher-wrapped stream, or an
/// in-memory duplex in tests.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxStream = Box<dyn ProxyStream>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes delivered from `a` to `b`.
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Bytes read but dropped because their destination was inactive.
    pub discarded: u64,
}

/// Liveness of one relay side, shared between the two directions.
#[derive(Debug)]
pub struct Side {
    label: &'static str,
    active: AtomicBool,
}

impl Side {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

fn peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}

/// Forwards everything readable from `from` into `to` until `from` ends.
/// Returns the number of bytes delivered.
pub async fn pipe<R, W>(mut from: R, mut to: W, target: &Side, discarded: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut delivered = 0u64;
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            if target.is_active() {
                // Close on flushed: pending writes complete before shutdown.
                to.flush().await?;
                let _ = to.shutdown().await;
            }
            return Ok(delivered);
        }

        if !target.is_active() {
            discarded.fetch_add(n as u64, Ordering::Relaxed);
            trace!(side = target.label, bytes = n, "dropping data for inactive side");
            continue;
        }

        let written = match to.write_all(&buf[..n]).await {
            Ok(()) => to.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => delivered += n as u64,
            Err(e) if peer_gone(&e) => {
                debug!(side = target.label, error = %e, "side went inactive");
                target.deactivate();
                discarded.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Relays between `a` and `b` until both directions finish or one fails.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let side_a = Side::new("a");
    let side_b = Side::new("b");
    let discarded = AtomicU64::new(0);

    let (a_to_b, b_to_a) = tokio::try_join!(
        pipe(a_read, b_write, &side_b, &discarded),
        pipe(b_read, a_write, &side_a, &discarded),
    )?;

    Ok(RelayStats {
        a_to_b,
        b_to_a,
        discarded: discarded.into_inner(),
    })
}
