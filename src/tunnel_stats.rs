use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::TunnelError;

#[derive(Debug, Default)]
pub struct TunnelStats {
    pub active_tunnels: AtomicU32,
    pub total_tunnels: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub cipher_errors: AtomicU64,
    pub io_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_tunnels: u32,
    pub total_tunnels: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub protocol_errors: u64,
    pub upstream_errors: u64,
    pub cipher_errors: u64,
    pub io_errors: u64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tunnel_started(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
        self.total_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    /// `bytes_in` flows from the upstream to the client.
    pub fn record_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &TunnelError) {
        let counter = if err.is_cipher() {
            &self.cipher_errors
        } else if err.is_protocol() {
            &self.protocol_errors
        } else if err.is_upstream() {
            &self.upstream_errors
        } else {
            &self.io_errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_tunnels: self.active_tunnels.load(Ordering::Relaxed),
            total_tunnels: self.total_tunnels.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            cipher_errors: self.cipher_errors.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let s = self.snapshot();
        info!(
            active = s.active_tunnels,
            total = s.total_tunnels,
            bytes_in_mb = s.bytes_in as f64 / 1_048_576.0,
            bytes_out_mb = s.bytes_out as f64 / 1_048_576.0,
            protocol_errors = s.protocol_errors,
            upstream_errors = s.upstream_errors,
            cipher_errors = s.cipher_errors,
            io_errors = s.io_errors,
            "tunnel stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_lifecycle_counters() {
        let stats = TunnelStats::new();
        stats.tunnel_started();
        stats.tunnel_started();
        stats.tunnel_closed();
        stats.record_bytes(100, 40);

        let s = stats.snapshot();
        assert_eq!(s.active_tunnels, 1);
        assert_eq!(s.total_tunnels, 2);
        assert_eq!(s.bytes_in, 100);
        assert_eq!(s.bytes_out, 40);
    }

    #[test]
    fn test_errors_are_counted_by_class() {
        let stats = TunnelStats::new();
        stats.record_error(&TunnelError::protocol("bad version"));
        stats.record_error(&TunnelError::NoUpstream("x:1".into()));
        stats.record_error(&TunnelError::cipher("tag"));
        stats.record_error(&TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "tag mismatch",
        )));
        stats.record_error(&TunnelError::Io(std::io::ErrorKind::ConnectionReset.into()));

        let s = stats.snapshot();
        assert_eq!(s.protocol_errors, 1);
        assert_eq!(s.upstream_errors, 1);
        assert_eq!(s.cipher_errors, 2);
        assert_eq!(s.io_errors, 1);
    }
}
