//! Reference-counted subscription registry.
//!
//! Single point of truth for which topics the server must keep pushing.
//! Any number of consumers may subscribe to the same key; only the first
//! produces a wire frame and only the last release tears it down.
//!
//! The registry never touches the socket itself. Callers pass a `send`
//! closure so the decision and the frame happen under one lock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::topic::SubscriptionKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub key: SubscriptionKey,
    pub ref_count: u32,
    /// False once the connection that carried the subscribe frame is gone
    pub attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First reference, subscribe frame sent
    Created,
    /// Existing entry, no frame
    Shared { ref_count: u32 },
    /// Existing but detached entry, subscribe frame re-sent
    Reattached { ref_count: u32 },
    NotConnected,
    RateLimited { retry_in: Duration },
    SendFailed,
}

impl SubscribeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Shared { .. } | Self::Reattached { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Nothing to release
    NotSubscribed,
    /// Other consumers still hold the key
    Released { ref_count: u32 },
    /// Last reference gone, entry dropped
    Removed { frame_sent: bool },
    /// Entry dropped locally, the unsubscribe frame could not be written
    FrameLost,
}

pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, SubscriptionEntry>,
    /// When a subscribe frame was last written per key, kept after removal
    last_sent: HashMap<SubscriptionKey, Instant>,
    rate_limit: Duration,
}

impl SubscriptionRegistry {
    pub fn new(rate_limit: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(64),
            last_sent: HashMap::with_capacity(64),
            rate_limit,
        }
    }

    pub fn subscribe<F>(
        &mut self,
        key: &SubscriptionKey,
        now: Instant,
        connected: bool,
        send: F,
    ) -> SubscribeOutcome
    where
        F: FnOnce(&SubscriptionKey) -> bool,
    {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.ref_count += 1;
            if entry.attached || !connected {
                return SubscribeOutcome::Shared {
                    ref_count: entry.ref_count,
                };
            }
            // The server forgot this topic when the previous connection dropped
            if send(key) {
                entry.attached = true;
                self.last_sent.insert(key.clone(), now);
                debug!(subscription = %key, ref_count = entry.ref_count, "subscription reattached");
                return SubscribeOutcome::Reattached {
                    ref_count: entry.ref_count,
                };
            }
            warn!(subscription = %key, "failed to reattach subscription");
            return SubscribeOutcome::Shared {
                ref_count: entry.ref_count,
            };
        }

        if !connected {
            return SubscribeOutcome::NotConnected;
        }

        let window = self.rate_limit;
        self.last_sent
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < window);
        if let Some(sent_at) = self.last_sent.get(key) {
            let elapsed = now.saturating_duration_since(*sent_at);
            return SubscribeOutcome::RateLimited {
                retry_in: window.saturating_sub(elapsed),
            };
        }

        self.entries.insert(
            key.clone(),
            SubscriptionEntry {
                key: key.clone(),
                ref_count: 1,
                attached: true,
            },
        );

        if !send(key) {
            self.entries.remove(key);
            return SubscribeOutcome::SendFailed;
        }

        self.last_sent.insert(key.clone(), now);
        SubscribeOutcome::Created
    }

    pub fn unsubscribe<F>(
        &mut self,
        key: &SubscriptionKey,
        connected: bool,
        send: F,
    ) -> UnsubscribeOutcome
    where
        F: FnOnce(&SubscriptionKey) -> bool,
    {
        let Some(entry) = self.entries.get_mut(key) else {
            return UnsubscribeOutcome::NotSubscribed;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return UnsubscribeOutcome::Released {
                ref_count: entry.ref_count,
            };
        }

        self.entries.remove(key);
        if !connected {
            return UnsubscribeOutcome::Removed { frame_sent: false };
        }
        if send(key) {
            UnsubscribeOutcome::Removed { frame_sent: true }
        } else {
            UnsubscribeOutcome::FrameLost
        }
    }

    /// Mark every entry as unknown to the server. Returns how many were attached.
    pub fn detach_all(&mut self) -> usize {
        let mut detached = 0;
        for entry in self.entries.values_mut() {
            if entry.attached {
                entry.attached = false;
                detached += 1;
            }
        }
        detached
    }

    /// Re-send every detached entry. Returns how many were re-attached.
    pub fn replay<F>(&mut self, now: Instant, mut send: F) -> usize
    where
        F: FnMut(&SubscriptionKey) -> bool,
    {
        let mut replayed = 0;
        for entry in self.entries.values_mut().filter(|e| !e.attached) {
            if send(&entry.key) {
                entry.attached = true;
                self.last_sent.insert(entry.key.clone(), now);
                replayed += 1;
            }
        }
        replayed
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> u32 {
        self.entries.get(key).map(|e| e.ref_count).unwrap_or(0)
    }

    pub fn entry(&self, key: &SubscriptionKey) -> Option<&SubscriptionEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop all bookkeeping (client shutdown)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_sent.clear();
    }
}
