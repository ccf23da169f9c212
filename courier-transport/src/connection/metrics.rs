//! Per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counter set. Updated from the send path and the read loop.
#[derive(Debug, Default)]
pub(crate) struct ConnectionMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_timed_out: AtomicU64,
}

impl ConnectionMetrics {
    pub(crate) fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Frames written to the wire.
    pub frames_sent: u64,
    /// Frames read from the wire.
    pub frames_received: u64,
    /// Bytes written, frame headers included.
    pub bytes_sent: u64,
    /// Bytes read, frame headers included.
    pub bytes_received: u64,
    /// Requests entered into the correlator.
    pub requests_started: u64,
    /// Requests that received their response.
    pub requests_completed: u64,
    /// Requests abandoned on deadline.
    pub requests_timed_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ConnectionMetrics::default();
        metrics.record_frame_sent(100);
        metrics.record_frame_sent(50);
        metrics.record_frame_received(200);
        metrics.record_request_started();
        metrics.record_request_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.bytes_received, 200);
        assert_eq!(snapshot.requests_started, 1);
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.requests_timed_out, 0);
    }
}
