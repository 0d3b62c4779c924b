//! # Pulse Wire Format
//!
//! Fixed-layout telemetry packet header — binary-identical on every packet
//! and on every capture this system produces.
//!
//! ```text
//! offset  size  field
//! 0       4     magic          (constant "PULS", little-endian u32)
//! 4       4     packet_id      (little-endian u32)
//! 8       4     sequence       (little-endian u32)
//! 12      8     timestamp_ns   (little-endian u64, monotonic epoch)
//! 20      4     payload_size   (little-endian u32)
//! 24      2     flags          (bit 0 Priority .. bit 4 Last)
//! 26      2     reserved       (zero)
//! 28      n     payload        (structure-defined bytes)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header magic: the bytes `PULS` when written as a little-endian u32.
pub const PACKET_MAGIC: u32 = 0x534C_5550;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 28;

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Header flag word. Bits 5..16 are reserved and must be zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    /// High-priority routing hint.
    pub const PRIORITY: Flags = Flags(1 << 0);
    /// Packet originates from a test harness.
    pub const TEST_DATA: Flags = Flags(1 << 1);
    /// Packet originates from a simulation source.
    pub const SIMULATION: Flags = Flags(1 << 2);
    /// Part of a fragmented payload.
    pub const FRAGMENTED: Flags = Flags(1 << 3);
    /// Last fragment of a fragmented payload.
    pub const LAST: Flags = Flags(1 << 4);

    const KNOWN: u16 = 0b1_1111;

    /// Empty flag word.
    #[inline]
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Construct from a raw wire value, dropping reserved bits.
    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits & Self::KNOWN)
    }

    /// Raw wire value.
    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Union of two flag words.
    #[inline]
    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::PRIORITY, "Priority"),
            (Flags::TEST_DATA, "TestData"),
            (Flags::SIMULATION, "Simulation"),
            (Flags::FRAGMENTED, "Fragmented"),
            (Flags::LAST, "Last"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded packet header — present at the start of every Pulse packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Structural packet type identifier.
    pub packet_id: u32,
    /// Per-id monotonically increasing counter, wrap-aware.
    pub sequence: u32,
    /// Nanoseconds since the producing source's monotonic epoch.
    pub timestamp_ns: u64,
    /// Payload length in bytes (after the header).
    pub payload_size: u32,
    /// Flag word.
    pub flags: Flags,
}

impl PacketHeader {
    /// Create a header with empty flags.
    pub fn new(packet_id: u32, sequence: u32, timestamp_ns: u64, payload_size: u32) -> Self {
        PacketHeader {
            packet_id,
            sequence,
            timestamp_ns,
            payload_size,
            flags: Flags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the header into a buffer. Always writes exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PACKET_MAGIC);
        buf.put_u32_le(self.packet_id);
        buf.put_u32_le(self.sequence);
        buf.put_u64_le(self.timestamp_ns);
        buf.put_u32_le(self.payload_size);
        buf.put_u16_le(self.flags.bits());
        buf.put_u16_le(0); // reserved
    }

    /// Decode a header from a buffer. Returns `None` on short input or bad magic.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        let magic = buf.get_u32_le();
        if magic != PACKET_MAGIC {
            return None;
        }
        let packet_id = buf.get_u32_le();
        let sequence = buf.get_u32_le();
        let timestamp_ns = buf.get_u64_le();
        let payload_size = buf.get_u32_le();
        let flags = Flags::from_bits(buf.get_u16_le());
        let _reserved = buf.get_u16_le();

        Some(PacketHeader {
            packet_id,
            sequence,
            timestamp_ns,
            payload_size,
            flags,
        })
    }

    /// Encoded size. The header layout is fixed.
    pub const fn encoded_len(&self) -> usize {
        HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flags_strategy() -> impl Strategy<Value = Flags> {
        (0u16..=Flags::KNOWN).prop_map(Flags::from_bits)
    }

    proptest! {
        #[test]
        fn proptest_header_roundtrip(
            packet_id in any::<u32>(),
            sequence in any::<u32>(),
            timestamp_ns in any::<u64>(),
            payload_size in any::<u32>(),
            flags in flags_strategy(),
        ) {
            let hdr = PacketHeader::new(packet_id, sequence, timestamp_ns, payload_size)
                .with_flags(flags);
            let mut buf = BytesMut::new();
            hdr.encode(&mut buf);
            prop_assert_eq!(buf.len(), HEADER_SIZE);
            let decoded = PacketHeader::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, hdr);
        }

        #[test]
        fn proptest_reserved_bits_dropped(bits in any::<u16>()) {
            let flags = Flags::from_bits(bits);
            prop_assert_eq!(flags.bits() & !Flags::KNOWN, 0);
        }
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let hdr = PacketHeader::new(0x1122_3344, 7, 0x0102_0304_0506_0708, 16)
            .with_flags(Flags::PRIORITY.union(Flags::LAST));
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);

        assert_eq!(&buf[0..4], b"PULS");
        assert_eq!(&buf[4..8], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
        assert_eq!(&buf[12..20], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&buf[20..24], &16u32.to_le_bytes());
        assert_eq!(&buf[24..26], &0b1_0001u16.to_le_bytes());
        assert_eq!(&buf[26..28], &[0, 0]);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let hdr = PacketHeader::new(1, 1, 0, 0);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        buf[0] ^= 0xFF;
        assert!(PacketHeader::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let mut buf = BytesMut::new();
        PacketHeader::new(1, 1, 0, 0).encode(&mut buf);
        let mut short = buf.freeze();
        short.truncate(HEADER_SIZE - 1);
        assert!(PacketHeader::decode(&mut short).is_none());
    }

    #[test]
    fn flags_insert_remove() {
        let mut flags = Flags::empty();
        flags.insert(Flags::TEST_DATA);
        flags.insert(Flags::SIMULATION);
        assert!(flags.contains(Flags::TEST_DATA));
        assert!(flags.contains(Flags::SIMULATION));
        assert!(!flags.contains(Flags::PRIORITY));

        flags.remove(Flags::TEST_DATA);
        assert!(!flags.contains(Flags::TEST_DATA));
        assert!(flags.contains(Flags::SIMULATION));
    }

    #[test]
    fn flags_display() {
        let flags = Flags::PRIORITY.union(Flags::FRAGMENTED);
        assert_eq!(flags.to_string(), "Priority|Fragmented");
        assert_eq!(Flags::empty().to_string(), "-");
    }
}
