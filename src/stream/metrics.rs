//! Client counters for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub connect_attempts: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub decode_failures: AtomicU64,
    pub unknown_envelopes: AtomicU64,
    pub subscribe_rejections: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connects_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_envelope(&self) {
        self.unknown_envelopes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscribe_rejection(&self) {
        self.subscribe_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} sent={} received={} decode_failures={} unknown={} rejected_subs={}",
            self.connects_succeeded.load(Ordering::Relaxed),
            self.connect_attempts.load(Ordering::Relaxed),
            self.reconnects_scheduled.load(Ordering::Relaxed),
            self.frames_sent.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.decode_failures.load(Ordering::Relaxed),
            self.unknown_envelopes.load(Ordering::Relaxed),
            self.subscribe_rejections.load(Ordering::Relaxed),
        )
    }
}
