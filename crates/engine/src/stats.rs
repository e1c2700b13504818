//! Per-connection and process-wide stream statistics.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;

use serde::Serialize;

use crate::clock;

/// One slot of the receiver's jitter buffer, and the unit handed to the
/// status sink on every rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JitterFrameEntry {
    pub sequence_number: i64,
    /// 0 means the slot is free / the frame was lost.
    pub bytes_received: u32,
    pub sender_qpc: i64,
    pub sender_qpf: i64,
    pub receiver_qpc: i64,
    pub receiver_qpf: i64,
    pub estimated_time_in_flight_ms: f64,
}

/// Counters for one connection. Mutated under the owning pattern's lock.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub bits_received: i64,
    pub successful_frames: u64,
    pub dropped_frames: u64,
    pub duplicate_frames: u64,
    pub error_frames: u64,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bits_received: 0,
            successful_frames: 0,
            dropped_frames: 0,
            duplicate_frames: 0,
            error_frames: 0,
            start_ms: clock::now_ms(),
            end_ms: 0,
        }
    }

    /// End the statistics window. Later calls are no-ops so the first
    /// terminal event wins.
    pub fn end_statistics(&mut self) {
        if self.end_ms == 0 {
            self.end_ms = clock::now_ms();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let end = if self.end_ms != 0 {
            self.end_ms
        } else {
            clock::now_ms()
        };
        StatsSnapshot {
            bits_received: self.bits_received,
            successful_frames: self.successful_frames,
            dropped_frames: self.dropped_frames,
            duplicate_frames: self.duplicate_frames,
            error_frames: self.error_frames,
            duration_ms: end - self.start_ms,
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copyable view of a connection's counters for summary lines and JSON
/// status output.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub bits_received: i64,
    pub successful_frames: u64,
    pub dropped_frames: u64,
    pub duplicate_frames: u64,
    pub error_frames: u64,
    pub duration_ms: i64,
}

/// Process-wide datagram accounting, shared by every connection.
#[derive(Debug, Default)]
pub struct UdpTotals {
    bits_received: AtomicI64,
    successful_frames: AtomicI64,
    dropped_frames: AtomicI64,
    duplicate_frames: AtomicI64,
    error_frames: AtomicI64,
}

impl UdpTotals {
    pub fn add_bits_received(&self, bits: i64) {
        self.bits_received.fetch_add(bits, Relaxed);
    }

    pub fn increment_successful(&self) {
        self.successful_frames.fetch_add(1, Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.dropped_frames.fetch_add(1, Relaxed);
    }

    pub fn add_dropped(&self, frames: i64) {
        self.dropped_frames.fetch_add(frames, Relaxed);
    }

    pub fn increment_duplicate(&self) {
        self.duplicate_frames.fetch_add(1, Relaxed);
    }

    pub fn increment_error(&self) {
        self.error_frames.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            bits_received: self.bits_received.load(Relaxed),
            successful_frames: self.successful_frames.load(Relaxed),
            dropped_frames: self.dropped_frames.load(Relaxed),
            duplicate_frames: self.duplicate_frames.load(Relaxed),
            error_frames: self.error_frames.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TotalsSnapshot {
    pub bits_received: i64,
    pub successful_frames: i64,
    pub dropped_frames: i64,
    pub duplicate_frames: i64,
    pub error_frames: i64,
}
