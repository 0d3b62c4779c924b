//! # Packet Sources
//!
//! Uniform interface between transports and the dispatcher. A source is
//! handed a [`SourceSink`] on start and pushes packets (and transport
//! errors) through it; it never touches the router or the registry. Pushes
//! are non-blocking — a saturated ingest channel surfaces as
//! [`SinkError::Full`] and the source drops and counts.
//!
//! Concrete network transports (UDP/TCP/file replay) live outside this
//! crate; [`SimulationSource`] is included for load generation and tests.

use crossbeam_channel::{Sender, TrySendError};
use pulse_wire::clock::TimestampClock;
use pulse_wire::packet::{Packet, PacketId, PacketRef};
use pulse_wire::pool::BufferPool;
use pulse_wire::wire::Flags;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Events a source emits toward its owning dispatcher.
pub enum SourceEvent {
    Packet(PacketRef),
    Error { source: String, message: String },
}

/// Error returned when an event cannot be handed to the dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub enum SinkError {
    Full,
    Disconnected,
}

/// Non-blocking handle into the dispatcher's ingest channel.
#[derive(Clone)]
pub struct SourceSink {
    source_name: String,
    tx: Sender<SourceEvent>,
}

impl SourceSink {
    pub(crate) fn new(source_name: String, tx: Sender<SourceEvent>) -> Self {
        SourceSink { source_name, tx }
    }

    /// Hand one packet to the dispatcher. Returns immediately.
    pub fn push(&self, packet: PacketRef) -> Result<(), SinkError> {
        match self.tx.try_send(SourceEvent::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Disconnected),
        }
    }

    /// Report a transport-level failure.
    pub fn error(&self, message: impl Into<String>) -> Result<(), SinkError> {
        let event = SourceEvent::Error {
            source: self.source_name.clone(),
            message: message.into(),
        };
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Disconnected),
        }
    }
}

// ─── Source trait ───────────────────────────────────────────────────────────

/// A packet producer managed by the dispatcher.
///
/// Lifecycle: `start` receives the sink and begins producing (usually on a
/// thread the source owns); `pause`/`resume` gate production without
/// tearing the transport down; `stop` halts and releases resources. All
/// transitions are expected to be idempotent.
pub trait PacketSource: Send {
    /// Unique name within a dispatcher.
    fn name(&self) -> &str;

    fn start(&mut self, sink: SourceSink) -> anyhow::Result<()>;

    fn stop(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    fn is_running(&self) -> bool;
}

// ─── Simulation source ──────────────────────────────────────────────────────

/// Configuration for the synthetic packet generator.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Packet-ids to emit, round-robin per tick.
    pub packet_ids: Vec<PacketId>,
    /// Payload bytes per packet.
    pub payload_size: usize,
    /// Delay between generation ticks.
    pub interval: Duration,
    /// Flags stamped on every generated packet.
    pub flags: Flags,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            packet_ids: vec![1],
            payload_size: 64,
            interval: Duration::from_millis(1),
            flags: Flags::SIMULATION,
        }
    }
}

/// Generates random-payload packets on its own thread. One sequence stream
/// per packet-id; pool exhaustion and sink overflow drop and count.
pub struct SimulationSource {
    name: String,
    config: SimulationConfig,
    pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SimulationSource {
    pub fn new(name: impl Into<String>, config: SimulationConfig, pool: Arc<BufferPool>) -> Self {
        SimulationSource {
            name: name.into(),
            config,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            generated: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PacketSource for SimulationSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, sink: SourceSink) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.paused.store(false, Ordering::Release);

        let config = self.config.clone();
        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);
        let paused = Arc::clone(&self.paused);
        let generated = Arc::clone(&self.generated);
        let dropped = Arc::clone(&self.dropped);

        let handle = thread::Builder::new()
            .name(format!("pulse-sim-{}", self.name))
            .spawn(move || {
                generator_loop(config, pool, sink, running, paused, generated, dropped)
            })?;
        self.handle = Some(handle);
        debug!(source = %self.name, "simulation source started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!(source = %self.name, "simulation source stopped");
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SimulationSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn generator_loop(
    config: SimulationConfig,
    pool: Arc<BufferPool>,
    sink: SourceSink,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) {
    let clock = TimestampClock::new();
    let mut sequences: HashMap<PacketId, u32> = HashMap::new();
    let mut rng = rand::rng();
    let mut payload = vec![0u8; config.payload_size];

    while running.load(Ordering::Acquire) {
        if paused.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        for &packet_id in &config.packet_ids {
            let sequence = sequences.entry(packet_id).or_insert(0);
            rng.fill(payload.as_mut_slice());

            let packet = match Packet::compose(
                &pool,
                packet_id,
                *sequence,
                clock.now_ns(),
                config.flags,
                &payload,
            ) {
                Ok(packet) => packet,
                Err(err) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(packet_id, %err, "simulation packet dropped at allocation");
                    continue;
                }
            };
            *sequence = sequence.wrapping_add(1);

            match sink.push(packet.into_shared()) {
                Ok(()) => {
                    generated.fetch_add(1, Ordering::Relaxed);
                }
                Err(SinkError::Full) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(SinkError::Disconnected) => {
                    running.store(false, Ordering::Release);
                    return;
                }
            }
        }

        thread::sleep(config.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn sink_pair(capacity: usize) -> (SourceSink, crossbeam_channel::Receiver<SourceEvent>) {
        let (tx, rx) = bounded(capacity);
        (SourceSink::new("test".into(), tx), rx)
    }

    #[test]
    fn generates_packets_with_increasing_sequences() {
        let (sink, rx) = sink_pair(1024);
        let pool = BufferPool::with_defaults();
        let mut source = SimulationSource::new(
            "sim",
            SimulationConfig {
                packet_ids: vec![7],
                payload_size: 16,
                interval: Duration::from_micros(100),
                flags: Flags::SIMULATION,
            },
            pool,
        );

        source.start(sink).unwrap();
        thread::sleep(Duration::from_millis(20));
        source.stop();

        let mut sequences = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Packet(p) = event {
                assert_eq!(p.id(), 7);
                assert_eq!(p.payload_size(), 16);
                assert!(p.has_flag(Flags::SIMULATION));
                sequences.push(p.sequence());
            }
        }
        assert!(!sequences.is_empty());
        for window in sequences.windows(2) {
            assert_eq!(window[1], window[0] + 1);
        }
    }

    #[test]
    fn pause_halts_generation() {
        let (sink, rx) = sink_pair(4096);
        let pool = BufferPool::with_defaults();
        let mut source = SimulationSource::new("sim", SimulationConfig::default(), pool);

        source.start(sink).unwrap();
        thread::sleep(Duration::from_millis(10));
        source.pause();
        thread::sleep(Duration::from_millis(5));
        let after_pause = rx.len();
        thread::sleep(Duration::from_millis(20));
        assert!(rx.len() <= after_pause + 1, "generation continued while paused");

        source.resume();
        thread::sleep(Duration::from_millis(10));
        assert!(rx.len() > after_pause, "generation did not resume");
        source.stop();
    }

    #[test]
    fn sink_overflow_counts_drops() {
        let (sink, _rx) = sink_pair(1);
        let pool = BufferPool::with_defaults();
        let mut source = SimulationSource::new(
            "sim",
            SimulationConfig {
                interval: Duration::from_micros(10),
                ..SimulationConfig::default()
            },
            pool,
        );

        source.start(sink).unwrap();
        thread::sleep(Duration::from_millis(20));
        source.stop();

        assert!(source.dropped() > 0, "expected drops against a 1-slot sink");
        assert_eq!(source.generated(), 1, "only one push fits the sink");
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (sink, _rx) = sink_pair(16);
        let pool = BufferPool::with_defaults();
        let mut source = SimulationSource::new("sim", SimulationConfig::default(), pool);

        source.start(sink.clone()).unwrap();
        source.start(sink).unwrap();
        assert!(source.is_running());
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn sink_error_event_carries_source_name() {
        let (sink, rx) = sink_pair(4);
        sink.error("socket reset").unwrap();
        match rx.try_recv().unwrap() {
            SourceEvent::Error { source, message } => {
                assert_eq!(source, "test");
                assert_eq!(message, "socket reset");
            }
            _ => panic!("expected error event"),
        }
    }
}
