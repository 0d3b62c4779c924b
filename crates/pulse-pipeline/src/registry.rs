//! # Subscription Registry
//!
//! Maps packet-ids to priority-ordered subscriber callbacks and fans
//! packets out to them. Registration and removal take the writer lock;
//! distribution holds the reader lock for its whole pass, so concurrent
//! distributes on different packets proceed in parallel.
//!
//! A subscriber callback MUST NOT call back into subscribe/unsubscribe on
//! the same registry — the writer intent would deadlock against the held
//! read lock. Defer such changes to another thread.

use pulse_wire::clock::TimestampClock;
use pulse_wire::packet::{PacketId, PacketRef};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Strictly increasing, never reused. 0 is never a valid id.
pub type SubscriberId = u64;

/// Delivery callback. Must not panic (panics are caught and accounted) and
/// must return promptly; slow subscribers stall one router worker.
pub type PacketCallback = Arc<dyn Fn(&PacketRef) + Send + Sync>;

// ─── Subscription ───────────────────────────────────────────────────────────

pub struct Subscription {
    pub id: SubscriberId,
    pub name: String,
    pub packet_id: PacketId,
    /// Lower value = earlier delivery; 0 is highest.
    pub priority: u32,
    enabled: AtomicBool,
    callback: PacketCallback,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub last_delivery_ns: AtomicU64,
}

impl Subscription {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("packet_id", &self.packet_id)
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub packets_distributed: AtomicU64,
    pub delivery_failures: AtomicU64,
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    by_id: HashMap<SubscriberId, Arc<Subscription>>,
    by_packet: HashMap<PacketId, Vec<Arc<Subscription>>>,
}

/// Thread-safe subscriber registry with priority-ordered delivery.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    stats: RegistryStats,
    clock: TimestampClock,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            stats: RegistryStats::default(),
            clock: TimestampClock::new(),
        }
    }

    /// Register a callback for `packet_id`. The per-packet vector stays
    /// sorted by priority; the sort is stable, so equal priorities deliver
    /// in registration order.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        packet_id: PacketId,
        callback: PacketCallback,
        priority: u32,
    ) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            name: name.into(),
            packet_id,
            priority,
            enabled: AtomicBool::new(true),
            callback,
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_delivery_ns: AtomicU64::new(0),
        });

        let mut inner = self.write();
        inner.by_id.insert(id, Arc::clone(&subscription));
        let subs = inner.by_packet.entry(packet_id).or_default();
        subs.push(subscription);
        subs.sort_by_key(|s| s.priority);

        info!(id, packet_id, priority, "subscriber registered");
        id
    }

    /// Remove a subscription. Returns false (with no side effect) if the
    /// id is unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.write();
        let Some(subscription) = inner.by_id.remove(&id) else {
            warn!(id, "unsubscribe: unknown subscriber id");
            return false;
        };

        if let Some(subs) = inner.by_packet.get_mut(&subscription.packet_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                inner.by_packet.remove(&subscription.packet_id);
            }
        }
        info!(id, packet_id = subscription.packet_id, name = %subscription.name, "subscriber removed");
        true
    }

    /// Enable or disable delivery without removing the subscription.
    pub fn set_enabled(&self, id: SubscriberId, enabled: bool) -> bool {
        let inner = self.read();
        match inner.by_id.get(&id) {
            Some(subscription) => {
                subscription.enabled.store(enabled, Ordering::Relaxed);
                debug!(id, enabled, "subscription toggled");
                true
            }
            None => false,
        }
    }

    /// Fan one packet out to its subscribers in ascending priority order.
    /// A panicking subscriber is accounted (its drop counter plus the
    /// global failure counter) and delivery continues with the rest.
    /// Returns the number of successful deliveries.
    pub fn distribute(&self, packet: &PacketRef) -> usize {
        if !packet.is_valid() {
            self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let inner = self.read();
        let Some(subs) = inner.by_packet.get(&packet.id()) else {
            return 0;
        };

        let mut delivered = 0;
        for subscription in subs {
            if !subscription.is_enabled() {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(packet)));
            match outcome {
                Ok(()) => {
                    subscription.received.fetch_add(1, Ordering::Relaxed);
                    subscription
                        .last_delivery_ns
                        .store(self.clock.now_ns(), Ordering::Relaxed);
                    delivered += 1;
                }
                Err(_) => {
                    error!(
                        subscriber = %subscription.name,
                        packet_id = packet.id(),
                        "subscriber panicked during delivery"
                    );
                    subscription.dropped.fetch_add(1, Ordering::Relaxed);
                    self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats
            .packets_distributed
            .fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn subscription(&self, id: SubscriberId) -> Option<Arc<Subscription>> {
        self.read().by_id.get(&id).cloned()
    }

    /// Subscriptions for one packet-id, in delivery order.
    pub fn subscribers_for(&self, packet_id: PacketId) -> Vec<Arc<Subscription>> {
        self.read()
            .by_packet
            .get(&packet_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, packet_id: PacketId) -> usize {
        self.read()
            .by_packet
            .get(&packet_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        let count = inner.by_id.len();
        inner.by_id.clear();
        inner.by_packet.clear();
        info!(count, "cleared all subscriptions");
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
