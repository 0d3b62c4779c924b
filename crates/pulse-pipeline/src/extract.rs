//! # Field Extraction
//!
//! Offset-indexed field access into packet payloads. A structure
//! declaration (produced by the external layout parser) is compiled once
//! into a [`FieldMap`] of flat descriptors — dot-joined paths for nested
//! structures, absolute byte offsets, bit ranges for bit-fields. Extraction
//! then resolves a descriptor by index and byte-copies the field out, with
//! no per-call allocation beyond the result container.
//!
//! Field maps are bound per packet-id and read from many threads; the
//! binding table lives behind an `ArcSwap`, so the hot extraction path is
//! lock-free.

use crate::value::FieldValue;
use arc_swap::ArcSwap;
use pulse_wire::packet::{Packet, PacketId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

// ─── Field Types ────────────────────────────────────────────────────────────

/// Semantic type tag of a leaf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Fixed-length byte array.
    ByteArray,
    /// Char array; decodes to a string, honoring null termination.
    CharArray,
    /// Unsigned bit range within a containing storage unit.
    BitField,
    /// Unrecognized declaration; decoded as raw bytes.
    Unknown,
}

impl FieldType {
    /// Wire size of a scalar tag. `None` for arrays, bit-fields, unknown.
    pub fn scalar_size(self) -> Option<usize> {
        match self {
            FieldType::Bool | FieldType::I8 | FieldType::U8 => Some(1),
            FieldType::I16 | FieldType::U16 => Some(2),
            FieldType::I32 | FieldType::U32 | FieldType::F32 => Some(4),
            FieldType::I64 | FieldType::U64 | FieldType::F64 => Some(8),
            _ => None,
        }
    }
}

// ─── Structure Declarations (parser output contract) ────────────────────────

/// Structure declaration as delivered by the external parser/layout
/// calculator: every leaf carries its resolved offset and size within the
/// parent, nested structures carry their own field lists.
#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    /// Total payload size of the structure.
    pub size: usize,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    /// Byte offset relative to the enclosing structure.
    pub offset: usize,
    pub size: usize,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(FieldType),
    BitField { bit_offset: u8, bit_width: u8 },
    Array {
        elem: FieldType,
        count: usize,
        null_terminated: bool,
    },
    Struct(StructDecl),
}

impl StructDecl {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        StructDecl {
            name: name.into(),
            size,
            fields: Vec::new(),
        }
    }

    pub fn scalar(mut self, name: impl Into<String>, offset: usize, ty: FieldType) -> Self {
        let size = ty.scalar_size().expect("scalar field type");
        self.fields.push(FieldDecl {
            name: name.into(),
            offset,
            size,
            kind: FieldKind::Scalar(ty),
        });
        self
    }

    pub fn bit_field(
        mut self,
        name: impl Into<String>,
        offset: usize,
        storage_size: usize,
        bit_offset: u8,
        bit_width: u8,
    ) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            offset,
            size: storage_size,
            kind: FieldKind::BitField {
                bit_offset,
                bit_width,
            },
        });
        self
    }

    pub fn array(
        mut self,
        name: impl Into<String>,
        offset: usize,
        elem: FieldType,
        count: usize,
        null_terminated: bool,
    ) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            offset,
            size: count * elem.scalar_size().unwrap_or(1),
            kind: FieldKind::Array {
                elem,
                count,
                null_terminated,
            },
        });
        self
    }

    pub fn nested(mut self, name: impl Into<String>, offset: usize, inner: StructDecl) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            offset,
            size: inner.size,
            kind: FieldKind::Struct(inner),
        });
        self
    }
}

// ─── Descriptors ────────────────────────────────────────────────────────────

/// Immutable locator of one leaf field within a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Dot-joined path, e.g. `velocity.x`.
    pub path: String,
    /// Byte offset from payload start.
    pub offset: usize,
    /// Field size in bytes (storage-unit size for bit-fields).
    pub size: usize,
    pub ty: FieldType,
    /// Bit offset within the storage unit (bit-fields only).
    pub bit_offset: u8,
    /// Bit width in [1, 64] (bit-fields only).
    pub bit_width: u8,
    /// Element count (arrays only).
    pub elem_count: usize,
    /// Whether a char array terminates at the first null.
    pub null_terminated: bool,
}

impl FieldDescriptor {
    pub fn is_valid(&self) -> bool {
        self.size > 0
            && match self.ty {
                FieldType::BitField => (1..=64).contains(&self.bit_width),
                _ => true,
            }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("field `{path}` not found")]
    NotFound { path: String },
    #[error("field `{path}` at {offset}+{size} is out of bounds for a {payload}-byte payload")]
    OutOfBounds {
        path: String,
        offset: usize,
        size: usize,
        payload: usize,
    },
    #[error("no field map bound for packet id {0}")]
    UnboundPacket(PacketId),
    #[error("invalid packet")]
    InvalidPacket,
    #[error("invalid descriptor for `{path}`")]
    InvalidDescriptor { path: String },
}

/// Per-path extraction results; failed fields carry their error in place.
pub type ExtractionMap = HashMap<String, Result<FieldValue, ExtractError>>;

// ─── Field Map ──────────────────────────────────────────────────────────────

/// Ordered descriptors for one packet-id with a name→index lookup.
/// Built once, read-only thereafter.
#[derive(Debug)]
pub struct FieldMap {
    pub packet_id: PacketId,
    pub structure: String,
    descriptors: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
    pub payload_size: usize,
}

impl FieldMap {
    pub fn build(packet_id: PacketId, decl: &StructDecl) -> FieldMap {
        let mut descriptors = Vec::new();
        Self::collect(decl, "", 0, &mut descriptors);

        let index = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.path.clone(), i))
            .collect();

        FieldMap {
            packet_id,
            structure: decl.name.clone(),
            descriptors,
            index,
            payload_size: decl.size,
        }
    }

    fn collect(decl: &StructDecl, prefix: &str, base: usize, out: &mut Vec<FieldDescriptor>) {
        for field in &decl.fields {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix}.{}", field.name)
            };
            let offset = base + field.offset;

            match &field.kind {
                FieldKind::Scalar(ty) => out.push(FieldDescriptor {
                    path,
                    offset,
                    size: field.size,
                    ty: *ty,
                    bit_offset: 0,
                    bit_width: 0,
                    elem_count: 0,
                    null_terminated: false,
                }),
                FieldKind::BitField {
                    bit_offset,
                    bit_width,
                } => out.push(FieldDescriptor {
                    path,
                    offset,
                    size: field.size,
                    ty: FieldType::BitField,
                    bit_offset: *bit_offset,
                    bit_width: *bit_width,
                    elem_count: 0,
                    null_terminated: false,
                }),
                FieldKind::Array {
                    elem,
                    count,
                    null_terminated,
                } => {
                    let ty = match elem {
                        FieldType::CharArray | FieldType::I8 | FieldType::U8
                            if *null_terminated =>
                        {
                            FieldType::CharArray
                        }
                        FieldType::CharArray => FieldType::CharArray,
                        _ => FieldType::ByteArray,
                    };
                    out.push(FieldDescriptor {
                        path,
                        offset,
                        size: field.size,
                        ty,
                        bit_offset: 0,
                        bit_width: 0,
                        elem_count: *count,
                        null_terminated: *null_terminated,
                    });
                }
                FieldKind::Struct(inner) => Self::collect(inner, &path, offset, out),
            }
        }
    }

    pub fn descriptors(&self) -> &[FieldDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, path: &str) -> Option<&FieldDescriptor> {
        self.index.get(path).map(|&i| &self.descriptors[i])
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ─── Extractor ──────────────────────────────────────────────────────────────

/// Binds field maps to packet-ids and extracts typed values.
pub struct FieldExtractor {
    maps: ArcSwap<HashMap<PacketId, Arc<FieldMap>>>,
}

impl FieldExtractor {
    pub fn new() -> Self {
        FieldExtractor {
            maps: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Compile `decl` and bind it to `packet_id`, replacing any previous
    /// binding. Readers pick up the new table on their next load.
    pub fn bind(&self, packet_id: PacketId, decl: &StructDecl) -> Arc<FieldMap> {
        let map = Arc::new(FieldMap::build(packet_id, decl));
        info!(
            packet_id,
            structure = %map.structure,
            fields = map.len(),
            payload_size = map.payload_size,
            "bound field map"
        );
        let inserted = Arc::clone(&map);
        self.maps.rcu(move |current| {
            let mut next = HashMap::clone(current.as_ref());
            next.insert(packet_id, Arc::clone(&inserted));
            next
        });
        map
    }

    pub fn unbind(&self, packet_id: PacketId) -> bool {
        let mut removed = false;
        self.maps.rcu(|current| {
            let mut next = HashMap::clone(current.as_ref());
            removed = next.remove(&packet_id).is_some();
            next
        });
        if removed {
            debug!(packet_id, "unbound field map");
        }
        removed
    }

    pub fn map_for(&self, packet_id: PacketId) -> Option<Arc<FieldMap>> {
        self.maps.load().get(&packet_id).cloned()
    }

    pub fn has_map(&self, packet_id: PacketId) -> bool {
        self.maps.load().contains_key(&packet_id)
    }

    /// Extract one field by descriptor. Pure: identical inputs produce
    /// identical results.
    pub fn extract(
        &self,
        packet: &Packet,
        descriptor: &FieldDescriptor,
    ) -> Result<FieldValue, ExtractError> {
        if !packet.is_valid() {
            return Err(ExtractError::InvalidPacket);
        }
        decode_field(packet.payload(), descriptor)
    }

    /// Extract one field by path.
    pub fn extract_path(&self, packet: &Packet, path: &str) -> Result<FieldValue, ExtractError> {
        if !packet.is_valid() {
            return Err(ExtractError::InvalidPacket);
        }
        let map = self
            .map_for(packet.id())
            .ok_or(ExtractError::UnboundPacket(packet.id()))?;
        let descriptor = map.descriptor(path).ok_or_else(|| ExtractError::NotFound {
            path: path.to_owned(),
        })?;
        decode_field(packet.payload(), descriptor)
    }

    /// Extract a batch of named fields. Unknown names yield `NotFound`
    /// entries; the batch never aborts.
    pub fn extract_many(&self, packet: &Packet, paths: &[String]) -> ExtractionMap {
        let mut results = ExtractionMap::with_capacity(paths.len());

        if !packet.is_valid() {
            for path in paths {
                results.insert(path.clone(), Err(ExtractError::InvalidPacket));
            }
            return results;
        }

        let map = match self.map_for(packet.id()) {
            Some(map) => map,
            None => {
                for path in paths {
                    results.insert(path.clone(), Err(ExtractError::UnboundPacket(packet.id())));
                }
                return results;
            }
        };

        let payload = packet.payload();
        for path in paths {
            let result = match map.descriptor(path) {
                Some(descriptor) => decode_field(payload, descriptor),
                None => Err(ExtractError::NotFound { path: path.clone() }),
            };
            results.insert(path.clone(), result);
        }
        results
    }

    /// Extract every field in the packet-id's map.
    pub fn extract_all(&self, packet: &Packet) -> ExtractionMap {
        if !packet.is_valid() {
            return ExtractionMap::new();
        }
        let map = match self.map_for(packet.id()) {
            Some(map) => map,
            None => return ExtractionMap::new(),
        };

        let payload = packet.payload();
        let mut results = ExtractionMap::with_capacity(map.len());
        for descriptor in map.descriptors() {
            results.insert(descriptor.path.clone(), decode_field(payload, descriptor));
        }
        results
    }
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Decoding ───────────────────────────────────────────────────────────────

fn decode_field(payload: &[u8], d: &FieldDescriptor) -> Result<FieldValue, ExtractError> {
    if !d.is_valid() {
        return Err(ExtractError::InvalidDescriptor {
            path: d.path.clone(),
        });
    }
    if d.offset + d.size > payload.len() {
        return Err(ExtractError::OutOfBounds {
            path: d.path.clone(),
            offset: d.offset,
            size: d.size,
            payload: payload.len(),
        });
    }

    let data = &payload[d.offset..d.offset + d.size];
    let value = match d.ty {
        FieldType::Bool => FieldValue::Bool(data[0] != 0),
        FieldType::I8 => FieldValue::I8(data[0] as i8),
        FieldType::U8 => FieldValue::U8(data[0]),
        FieldType::I16 => FieldValue::I16(i16::from_le_bytes(data.try_into().unwrap())),
        FieldType::U16 => FieldValue::U16(u16::from_le_bytes(data.try_into().unwrap())),
        FieldType::I32 => FieldValue::I32(i32::from_le_bytes(data.try_into().unwrap())),
        FieldType::U32 => FieldValue::U32(u32::from_le_bytes(data.try_into().unwrap())),
        FieldType::I64 => FieldValue::I64(i64::from_le_bytes(data.try_into().unwrap())),
        FieldType::U64 => FieldValue::U64(u64::from_le_bytes(data.try_into().unwrap())),
        FieldType::F32 => FieldValue::F32(f32::from_le_bytes(data.try_into().unwrap())),
        FieldType::F64 => FieldValue::F64(f64::from_le_bytes(data.try_into().unwrap())),
        FieldType::BitField => decode_bit_field(data, d.bit_offset, d.bit_width),
        FieldType::CharArray => decode_char_array(data, d.null_terminated),
        FieldType::ByteArray | FieldType::Unknown => FieldValue::Bytes(data.to_vec()),
    };
    Ok(value)
}

/// Read the containing storage unit, shift out the bit range, and return
/// the narrowest unsigned type that holds it (width 1 → bool).
fn decode_bit_field(data: &[u8], bit_offset: u8, bit_width: u8) -> FieldValue {
    let mut raw = [0u8; 8];
    let n = data.len().min(8);
    raw[..n].copy_from_slice(&data[..n]);
    let word = u64::from_le_bytes(raw);

    let mask = if bit_width >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_width) - 1
    };
    let bits = (word >> bit_offset) & mask;

    match bit_width {
        1 => FieldValue::Bool(bits != 0),
        2..=8 => FieldValue::U8(bits as u8),
        9..=16 => FieldValue::U16(bits as u16),
        17..=32 => FieldValue::U32(bits as u32),
        _ => FieldValue::U64(bits),
    }
}

fn decode_char_array(data: &[u8], null_terminated: bool) -> FieldValue {
    let slice = if null_terminated {
        match data.iter().position(|&b| b == 0) {
            Some(end) => &data[..end],
            None => data,
        }
    } else {
        data
    };
    FieldValue::Str(String::from_utf8_lossy(slice).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_wire::pool::BufferPool;
    use pulse_wire::wire::Flags;

    fn make_packet(pool: &Arc<BufferPool>, id: PacketId, payload: &[u8]) -> Packet {
        Packet::compose(pool, id, 1, 0, Flags::empty(), payload).unwrap()
    }

    fn telemetry_decl() -> StructDecl {
        // struct Telemetry {
        //   u32 status;           // 0..4
        //   struct { f32 x; f32 y; } velocity;  // 4..12
        //   u8 mode_bits;         // 12 (bits 3..7 = mode)
        //   char label[8];        // 13..21, null-terminated
        // }
        StructDecl::new("Telemetry", 21)
            .scalar("status", 0, FieldType::U32)
            .nested(
                "velocity",
                4,
                StructDecl::new("Vec2", 8)
                    .scalar("x", 0, FieldType::F32)
                    .scalar("y", 4, FieldType::F32),
            )
            .bit_field("mode", 12, 1, 3, 4)
            .array("label", 13, FieldType::CharArray, 8, true)
    }

    fn telemetry_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        payload.extend_from_slice(&(-2.0f32).to_le_bytes());
        payload.push(0b1011_0100);
        payload.extend_from_slice(b"veh-1\0\0\0");
        payload
    }

    #[test]
    fn field_map_flattens_nested_paths() {
        let map = FieldMap::build(10, &telemetry_decl());
        let paths: Vec<&str> = map.descriptors().iter().map(|d| d.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["status", "velocity.x", "velocity.y", "mode", "label"]
        );
        assert_eq!(map.descriptor("velocity.y").unwrap().offset, 8);
        assert_eq!(map.payload_size, 21);
    }

    #[test]
    fn extract_scalars_and_nested() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        assert_eq!(
            extractor.extract_path(&packet, "status").unwrap(),
            FieldValue::U32(7)
        );
        assert_eq!(
            extractor.extract_path(&packet, "velocity.x").unwrap(),
            FieldValue::F32(1.5)
        );
        assert_eq!(
            extractor.extract_path(&packet, "velocity.y").unwrap(),
            FieldValue::F32(-2.0)
        );
    }

    #[test]
    fn extract_bit_field() {
        // Payload byte 0b10110100, bits [3..7) → 0b0110 == 6.
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        assert_eq!(
            extractor.extract_path(&packet, "mode").unwrap(),
            FieldValue::U8(6)
        );
    }

    #[test]
    fn single_bit_decodes_to_bool() {
        let decl = StructDecl::new("Bits", 1).bit_field("armed", 0, 1, 2, 1);
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(11, &decl);

        let armed = make_packet(&pool, 11, &[0b0000_0100]);
        assert_eq!(
            extractor.extract_path(&armed, "armed").unwrap(),
            FieldValue::Bool(true)
        );
        let disarmed = make_packet(&pool, 11, &[0b0000_0000]);
        assert_eq!(
            extractor.extract_path(&disarmed, "armed").unwrap(),
            FieldValue::Bool(false)
        );
    }

    #[test]
    fn char_array_truncates_at_null() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        assert_eq!(
            extractor.extract_path(&packet, "label").unwrap(),
            FieldValue::Str("veh-1".into())
        );
    }

    #[test]
    fn byte_array_keeps_declared_length() {
        let decl = StructDecl::new("Raw", 4).array("blob", 0, FieldType::U8, 4, false);
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(12, &decl);
        let packet = make_packet(&pool, 12, &[1, 2, 3, 4]);

        assert_eq!(
            extractor.extract_path(&packet, "blob").unwrap(),
            FieldValue::Bytes(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn out_of_bounds_is_an_error_not_a_panic() {
        let decl = StructDecl::new("Wide", 16).scalar("tail", 12, FieldType::U64);
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(13, &decl);

        // Only 8 bytes of payload, but `tail` needs 12..20.
        let packet = make_packet(&pool, 13, &[0u8; 8]);
        assert!(matches!(
            extractor.extract_path(&packet, "tail"),
            Err(ExtractError::OutOfBounds { offset: 12, size: 8, .. })
        ));
    }

    #[test]
    fn extract_many_reports_missing_without_aborting() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        let paths = vec!["status".to_string(), "nope".to_string()];
        let results = extractor.extract_many(&packet, &paths);
        assert_eq!(results["status"], Ok(FieldValue::U32(7)));
        assert_eq!(
            results["nope"],
            Err(ExtractError::NotFound {
                path: "nope".into()
            })
        );
    }

    #[test]
    fn extract_all_covers_every_descriptor() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        let results = extractor.extract_all(&packet);
        assert_eq!(results.len(), 5);
        assert!(results.values().all(|r| r.is_ok()));
    }

    #[test]
    fn extraction_is_idempotent() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        let map = extractor.bind(10, &telemetry_decl());
        let packet = make_packet(&pool, 10, &telemetry_payload());

        let d = map.descriptor("velocity.x").unwrap();
        let first = extractor.extract(&packet, d);
        let second = extractor.extract(&packet, d);
        assert_eq!(first, second);
    }

    #[test]
    fn unbound_packet_id_reported() {
        let pool = BufferPool::with_defaults();
        let extractor = FieldExtractor::new();
        let packet = make_packet(&pool, 77, &[0u8; 4]);

        assert!(matches!(
            extractor.extract_path(&packet, "anything"),
            Err(ExtractError::UnboundPacket(77))
        ));
        assert!(extractor.extract_all(&packet).is_empty());
    }

    #[test]
    fn rebind_replaces_and_unbind_removes() {
        let extractor = FieldExtractor::new();
        extractor.bind(10, &telemetry_decl());
        assert_eq!(extractor.map_for(10).unwrap().len(), 5);

        let smaller = StructDecl::new("Mini", 1).scalar("only", 0, FieldType::U8);
        extractor.bind(10, &smaller);
        assert_eq!(extractor.map_for(10).unwrap().len(), 1);

        assert!(extractor.unbind(10));
        assert!(!extractor.has_map(10));
        assert!(!extractor.unbind(10));
    }
}
