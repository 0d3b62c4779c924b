//! # Packet
//!
//! Thin view over one pool buffer: header + payload, with typed header
//! accessors and a zero-copy payload slice. A packet is movable but not
//! copyable; fan-out to many subscribers shares a [`PacketRef`]
//! (`Arc<Packet>`), which also makes the packet immutable after dispatch —
//! header mutation requires `&mut self` and is only possible while the
//! producing source still owns it exclusively.

use crate::pool::{BufferPool, PoolError, PooledBuffer};
use crate::wire::{Flags, PacketHeader, HEADER_SIZE, PACKET_MAGIC};
use bytes::BytesMut;
use std::sync::Arc;
use thiserror::Error;

/// Structural packet type identifier.
pub type PacketId = u32;

/// Per-id monotonically increasing counter, wrap-aware.
pub type SequenceNumber = u32;

/// Shared packet handle for multi-subscriber fan-out.
pub type PacketRef = Arc<Packet>;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("buffer of {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    TooShort { len: usize },
    #[error("bad header magic 0x{found:08x}")]
    BadMagic { found: u32 },
    #[error("declared payload of {declared} bytes disagrees with {actual} buffered bytes")]
    SizeMismatch { declared: usize, actual: usize },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// One telemetry packet backed by a pooled buffer.
pub struct Packet {
    buf: PooledBuffer,
}

impl Packet {
    /// Build a packet from scratch: acquires a pool buffer sized for
    /// header + payload and writes both.
    pub fn compose(
        pool: &Arc<BufferPool>,
        packet_id: PacketId,
        sequence: SequenceNumber,
        timestamp_ns: u64,
        flags: Flags,
        payload: &[u8],
    ) -> Result<Packet, PacketError> {
        let total = HEADER_SIZE + payload.len();
        let mut buf = pool.acquire(total)?;

        let header = PacketHeader::new(packet_id, sequence, timestamp_ns, payload.len() as u32)
            .with_flags(flags);
        // PooledBuffer derefs to BytesMut; encode appends in place.
        let bytes: &mut BytesMut = &mut buf;
        header.encode(bytes);
        bytes.extend_from_slice(payload);

        Ok(Packet { buf })
    }

    /// Wrap a buffer already holding wire bytes (e.g. a received datagram).
    /// Validates magic, length, and the declared payload size.
    pub fn from_buffer(buf: PooledBuffer) -> Result<Packet, PacketError> {
        let packet = Packet { buf };
        packet.validate()?;
        Ok(packet)
    }

    /// Re-check the packet invariants.
    pub fn validate(&self) -> Result<(), PacketError> {
        let len = self.buf.len();
        if len < HEADER_SIZE {
            return Err(PacketError::TooShort { len });
        }
        let magic = self.read_u32(0);
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic { found: magic });
        }
        let declared = self.payload_size() as usize;
        let actual = len - HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::SizeMismatch { declared, actual });
        }
        Ok(())
    }

    /// Cheap validity probe for drop-or-deliver decisions.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    // ── Header accessors ────────────────────────────────────────────────

    pub fn id(&self) -> PacketId {
        self.read_u32(4)
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.read_u32(8)
    }

    pub fn timestamp_ns(&self) -> u64 {
        let raw: [u8; 8] = self.buf[12..20].try_into().expect("header slice");
        u64::from_le_bytes(raw)
    }

    pub fn payload_size(&self) -> u32 {
        self.read_u32(20)
    }

    pub fn flags(&self) -> Flags {
        let raw: [u8; 2] = self.buf[24..26].try_into().expect("header slice");
        Flags::from_bits(u16::from_le_bytes(raw))
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags().contains(flag)
    }

    /// Decode the full header as an owned value.
    pub fn header(&self) -> PacketHeader {
        PacketHeader::new(
            self.id(),
            self.sequence(),
            self.timestamp_ns(),
            self.payload_size(),
        )
        .with_flags(self.flags())
    }

    // ── Data access ─────────────────────────────────────────────────────

    /// Payload bytes, immediately after the header. Zero-copy.
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Complete wire bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn total_size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    // ── Pre-dispatch mutation ───────────────────────────────────────────
    //
    // All mutators take `&mut self`: once shared as a PacketRef the header
    // is frozen.

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.write_u32(8, sequence);
    }

    pub fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.buf[12..20].copy_from_slice(&timestamp_ns.to_le_bytes());
    }

    pub fn set_flag(&mut self, flag: Flags) {
        let mut flags = self.flags();
        flags.insert(flag);
        self.buf[24..26].copy_from_slice(&flags.bits().to_le_bytes());
    }

    pub fn clear_flag(&mut self, flag: Flags) {
        let mut flags = self.flags();
        flags.remove(flag);
        self.buf[24..26].copy_from_slice(&flags.bits().to_le_bytes());
    }

    /// Freeze into a shared handle for fan-out.
    pub fn into_shared(self) -> PacketRef {
        Arc::new(self)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let raw: [u8; 4] = self.buf[offset..offset + 4].try_into().expect("header slice");
        u32::from_le_bytes(raw)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id())
            .field("sequence", &self.sequence())
            .field("timestamp_ns", &self.timestamp_ns())
            .field("payload_size", &self.payload_size())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(&[(64, 8), (256, 8)])
    }

    #[test]
    fn compose_and_read_back() {
        let pool = pool();
        let packet = Packet::compose(
            &pool,
            42,
            7,
            1_000_000,
            Flags::PRIORITY,
            &[0x01, 0x02, 0x03, 0x04],
        )
        .unwrap();

        assert_eq!(packet.id(), 42);
        assert_eq!(packet.sequence(), 7);
        assert_eq!(packet.timestamp_ns(), 1_000_000);
        assert_eq!(packet.payload_size(), 4);
        assert!(packet.has_flag(Flags::PRIORITY));
        assert_eq!(packet.payload(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packet.total_size(), HEADER_SIZE + 4);
        assert!(packet.is_valid());
    }

    #[test]
    fn wire_roundtrip_through_raw_buffer() {
        let pool = pool();
        let original = Packet::compose(&pool, 9, 3, 555, Flags::TEST_DATA, b"abcdef").unwrap();

        // Re-ingest the exact wire bytes as if received from a transport.
        let mut raw = pool.acquire(original.total_size()).unwrap();
        raw.extend_from_slice(original.bytes());
        let reparsed = Packet::from_buffer(raw).unwrap();

        assert_eq!(reparsed.header(), original.header());
        assert_eq!(reparsed.payload(), original.payload());
    }

    #[test]
    fn from_buffer_rejects_garbage() {
        let pool = pool();
        let mut raw = pool.acquire(HEADER_SIZE).unwrap();
        raw.extend_from_slice(&[0xABu8; HEADER_SIZE]);
        assert!(matches!(
            Packet::from_buffer(raw),
            Err(PacketError::BadMagic { .. })
        ));

        let mut short = pool.acquire(4).unwrap();
        short.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            Packet::from_buffer(short),
            Err(PacketError::TooShort { len: 3 })
        ));
    }

    #[test]
    fn from_buffer_rejects_truncated_payload() {
        let pool = pool();
        let full = Packet::compose(&pool, 1, 1, 0, Flags::empty(), b"0123456789").unwrap();

        let mut truncated = pool.acquire(full.total_size()).unwrap();
        truncated.extend_from_slice(&full.bytes()[..full.total_size() - 3]);
        assert!(matches!(
            Packet::from_buffer(truncated),
            Err(PacketError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn mutation_before_sharing() {
        let pool = pool();
        let mut packet = Packet::compose(&pool, 1, 0, 0, Flags::empty(), b"x").unwrap();
        packet.set_sequence(99);
        packet.set_timestamp_ns(123_456);
        packet.set_flag(Flags::SIMULATION);
        packet.clear_flag(Flags::PRIORITY);

        let shared = packet.into_shared();
        assert_eq!(shared.sequence(), 99);
        assert_eq!(shared.timestamp_ns(), 123_456);
        assert!(shared.has_flag(Flags::SIMULATION));
        assert!(shared.is_valid());
    }

    #[test]
    fn buffer_returns_to_pool_when_last_ref_drops() {
        let pool = BufferPool::new(&[(64, 1)]);
        let shared = Packet::compose(&pool, 1, 0, 0, Flags::empty(), b"x")
            .unwrap()
            .into_shared();
        let second = Arc::clone(&shared);

        assert!(pool.acquire(8).is_err(), "slot held by live packet");
        drop(shared);
        assert!(pool.acquire(8).is_err(), "slot held by remaining ref");
        drop(second);
        assert!(pool.acquire(8).is_ok(), "slot released by last ref");
    }

    #[test]
    fn payload_never_overflows_buffer() {
        let pool = pool();
        let packet = Packet::compose(&pool, 1, 0, 0, Flags::empty(), &[7u8; 100]).unwrap();
        assert!(packet.payload_size() as usize + HEADER_SIZE <= packet.buffer_capacity());
    }
}
