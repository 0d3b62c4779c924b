//! # Packet Dispatcher
//!
//! Top-level orchestrator: owns the subscription registry, the priority
//! router, and the set of registered sources. An ingest thread drains the
//! shared source channel, applies back-pressure against the router's
//! aggregate queue depth, and routes everything else by header flags.
//!
//! External components observe lifecycle and pressure through registered
//! event observers (explicit callbacks, invoked on the ingest thread).

use crate::config::{DispatcherConfig, RouterConfig};
use crate::registry::{PacketCallback, SubscriberId, SubscriptionRegistry};
use crate::router::{PacketRouter, RouterSnapshot};
use crate::source::{PacketSource, SourceEvent, SourceSink};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use pulse_wire::packet::{PacketId, PacketRef};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Emit a statistics-updated event every this many received packets.
const STATS_EVENT_INTERVAL: u64 = 1_000;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Lifecycle and pressure notifications for external observers.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    Started,
    Stopped,
    SourceRegistered { name: String },
    SourceRemoved { name: String },
    SourceError { source: String, message: String },
    /// Emitted once per threshold crossing, not per dropped packet.
    BackPressure { queue_depth: usize },
    StatisticsUpdated(DispatcherSnapshot),
}

pub type EventObserver = Arc<dyn Fn(&DispatcherEvent) + Send + Sync>;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("a source named `{0}` is already registered")]
    DuplicateSource(String),
    #[error("source limit of {0} reached")]
    TooManySources(usize),
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub received: AtomicU64,
    pub routed: AtomicU64,
    pub dropped: AtomicU64,
    pub back_pressure_events: AtomicU64,
}

/// Serializable dispatcher counters plus the router's view.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub received: u64,
    pub routed: u64,
    pub dropped: u64,
    pub back_pressure_events: u64,
    pub source_count: usize,
    pub subscriber_count: usize,
    pub router: RouterSnapshot,
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

struct SourceRegistration {
    name: String,
    source: Box<dyn PacketSource>,
    enabled: bool,
}

/// Central coordinator for sources, routing, and subscriptions.
pub struct PacketDispatcher {
    config: DispatcherConfig,
    registry: Arc<SubscriptionRegistry>,
    router: Arc<PacketRouter>,
    sources: Arc<Mutex<Vec<SourceRegistration>>>,
    ingest_tx: Sender<SourceEvent>,
    ingest_rx: Receiver<SourceEvent>,
    ingest_handle: Mutex<Option<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stats: Arc<DispatcherStats>,
    observers: Arc<RwLock<Vec<EventObserver>>>,
    back_pressure_engaged: Arc<AtomicBool>,
}

impl PacketDispatcher {
    pub fn new(config: DispatcherConfig, router_config: RouterConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let router = Arc::new(PacketRouter::new(router_config, Arc::clone(&registry)));
        let (ingest_tx, ingest_rx) = bounded(config.ingest_capacity);

        PacketDispatcher {
            config,
            registry,
            router,
            sources: Arc::new(Mutex::new(Vec::new())),
            ingest_tx,
            ingest_rx,
            ingest_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(DispatcherStats::default()),
            observers: Arc::new(RwLock::new(Vec::new())),
            back_pressure_engaged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<PacketRouter> {
        &self.router
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register an observer for lifecycle/pressure events.
    pub fn add_observer(&self, observer: EventObserver) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    // ── Sources ─────────────────────────────────────────────────────────

    /// Register a source. Fails on duplicate name or source-count limit.
    /// If the dispatcher is already running the source starts immediately.
    pub fn register_source(&self, mut source: Box<dyn PacketSource>) -> Result<(), DispatcherError> {
        let name = source.name().to_owned();
        let mut sources = self.lock_sources();

        if sources.iter().any(|r| r.name == name) {
            warn!(source = %name, "duplicate source registration rejected");
            return Err(DispatcherError::DuplicateSource(name));
        }
        if sources.len() >= self.config.max_sources {
            return Err(DispatcherError::TooManySources(self.config.max_sources));
        }

        if self.is_running() {
            if let Err(err) = source.start(self.sink_for(&name)) {
                warn!(source = %name, %err, "source failed to start");
            }
        }

        sources.push(SourceRegistration {
            name: name.clone(),
            source,
            enabled: true,
        });
        drop(sources);

        info!(source = %name, "source registered");
        self.emit(&DispatcherEvent::SourceRegistered { name });
        Ok(())
    }

    /// Stop and remove a source by name.
    pub fn remove_source(&self, name: &str) -> bool {
        let mut sources = self.lock_sources();
        let Some(index) = sources.iter().position(|r| r.name == name) else {
            return false;
        };
        let mut registration = sources.swap_remove(index);
        drop(sources);

        registration.source.stop();
        info!(source = %name, "source removed");
        self.emit(&DispatcherEvent::SourceRemoved { name: name.to_owned() });
        true
    }

    /// Enable or disable a source; a disabled source is stopped while the
    /// dispatcher runs and skipped on start.
    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut sources = self.lock_sources();
        let Some(registration) = sources.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        registration.enabled = enabled;
        if self.is_running() {
            if enabled {
                let sink = SourceSink::new(registration.name.clone(), self.ingest_tx.clone());
                if let Err(err) = registration.source.start(sink) {
                    warn!(source = %name, %err, "source failed to start");
                }
            } else {
                registration.source.stop();
            }
        }
        true
    }

    pub fn source_count(&self) -> usize {
        self.lock_sources().len()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.lock_sources().iter().map(|r| r.name.clone()).collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start router, ingest thread, then every enabled source. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("starting packet dispatcher");
        self.router.start();

        let ctx = IngestContext {
            rx: self.ingest_rx.clone(),
            router: Arc::clone(&self.router),
            stats: Arc::clone(&self.stats),
            observers: Arc::clone(&self.observers),
            running: Arc::clone(&self.running),
            back_pressure_engaged: Arc::clone(&self.back_pressure_engaged),
            back_pressure_enabled: self.config.back_pressure_enabled,
            back_pressure_threshold: self.config.back_pressure_threshold,
            registry: Arc::clone(&self.registry),
            sources: Arc::clone(&self.sources),
        };
        let handle = thread::Builder::new()
            .name("pulse-ingest".into())
            .spawn(move || ingest_loop(ctx))
            .expect("failed to spawn ingest thread");
        *self
            .ingest_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let mut sources = self.lock_sources();
        for registration in sources.iter_mut().filter(|r| r.enabled) {
            let sink = SourceSink::new(registration.name.clone(), self.ingest_tx.clone());
            if let Err(err) = registration.source.start(sink) {
                warn!(source = %registration.name, %err, "source failed to start");
            }
        }
        drop(sources);

        self.emit(&DispatcherEvent::Started);
    }

    /// Stop sources, the ingest thread, then the router. Idempotent;
    /// in-flight subscriber callbacks finish.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping packet dispatcher");

        let mut sources = self.lock_sources();
        for registration in sources.iter_mut() {
            registration.source.stop();
        }
        drop(sources);

        if let Some(handle) = self
            .ingest_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        // Release packets stranded in the ingest channel.
        while self.ingest_rx.try_recv().is_ok() {}

        self.router.stop();
        self.emit(&DispatcherEvent::Stopped);
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn subscribe(
        &self,
        name: impl Into<String>,
        packet_id: PacketId,
        callback: PacketCallback,
        priority: u32,
    ) -> SubscriberId {
        self.registry.subscribe(name, packet_id, callback, priority)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.total_subscribers()
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn snapshot(&self) -> DispatcherSnapshot {
        snapshot_from(
            &self.stats,
            self.source_count(),
            self.registry.total_subscribers(),
            self.router.snapshot(),
        )
    }

    fn sink_for(&self, name: &str) -> SourceSink {
        SourceSink::new(name.to_owned(), self.ingest_tx.clone())
    }

    fn emit(&self, event: &DispatcherEvent) {
        emit_event(&self.observers, event);
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, Vec<SourceRegistration>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PacketDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot_from(
    stats: &DispatcherStats,
    source_count: usize,
    subscriber_count: usize,
    router: RouterSnapshot,
) -> DispatcherSnapshot {
    DispatcherSnapshot {
        received: stats.received.load(Ordering::Relaxed),
        routed: stats.routed.load(Ordering::Relaxed),
        dropped: stats.dropped.load(Ordering::Relaxed),
        back_pressure_events: stats.back_pressure_events.load(Ordering::Relaxed),
        source_count,
        subscriber_count,
        router,
    }
}

fn emit_event(observers: &RwLock<Vec<EventObserver>>, event: &DispatcherEvent) {
    let observers = observers.read().unwrap_or_else(|e| e.into_inner());
    for observer in observers.iter() {
        if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
            error!("dispatcher observer panicked");
        }
    }
}

// ─── Ingest thread ──────────────────────────────────────────────────────────

struct IngestContext {
    rx: Receiver<SourceEvent>,
    router: Arc<PacketRouter>,
    stats: Arc<DispatcherStats>,
    observers: Arc<RwLock<Vec<EventObserver>>>,
    running: Arc<AtomicBool>,
    back_pressure_engaged: Arc<AtomicBool>,
    back_pressure_enabled: bool,
    back_pressure_threshold: usize,
    registry: Arc<SubscriptionRegistry>,
    sources: Arc<Mutex<Vec<SourceRegistration>>>,
}

fn ingest_loop(ctx: IngestContext) {
    while ctx.running.load(Ordering::Acquire) {
        match ctx.rx.recv_timeout(Duration::from_millis(100)) {
            Ok(SourceEvent::Packet(packet)) => handle_packet(&ctx, packet),
            Ok(SourceEvent::Error { source, message }) => {
                error!(source = %source, message = %message, "source transport error");
                emit_event(
                    &ctx.observers,
                    &DispatcherEvent::SourceError { source, message },
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn handle_packet(ctx: &IngestContext, packet: PacketRef) {
    let received = ctx.stats.received.fetch_add(1, Ordering::Relaxed) + 1;

    if !packet.is_valid() {
        ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if ctx.back_pressure_enabled {
        let depth = ctx.router.total_queue_depth();
        // Inclusive comparison: with N-slot queues and one entry in flight
        // the backlog tops out at exactly N+1, and a threshold equal to
        // that must still shed.
        if depth >= ctx.back_pressure_threshold {
            ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .back_pressure_events
                .fetch_add(1, Ordering::Relaxed);
            // Signal once per crossing; re-armed when depth recovers.
            if !ctx.back_pressure_engaged.swap(true, Ordering::AcqRel) {
                warn!(depth, "back-pressure engaged, dropping at ingest");
                emit_event(
                    &ctx.observers,
                    &DispatcherEvent::BackPressure { queue_depth: depth },
                );
            }
            return;
        }
        ctx.back_pressure_engaged.store(false, Ordering::Release);
    }

    match ctx.router.route_auto(packet) {
        Ok(()) => {
            ctx.stats.routed.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    if received % STATS_EVENT_INTERVAL == 0 {
        let source_count = ctx.sources.lock().unwrap_or_else(|e| e.into_inner()).len();
        let snapshot = snapshot_from(
            &ctx.stats,
            source_count,
            ctx.registry.total_subscribers(),
            ctx.router.snapshot(),
        );
        emit_event(
            &ctx.observers,
            &DispatcherEvent::StatisticsUpdated(snapshot),
        );
    }
}
