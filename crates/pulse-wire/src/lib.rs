//! # pulse-wire
//!
//! Wire-level building blocks for the Pulse telemetry pipeline.
//!
//! Fixed 28-byte packet framing, a capacity-class buffer pool with scoped
//! handles, and the shared [`packet::Packet`] view that fans out to
//! subscribers without copying.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header serialization, flag word
//! - [`pool`] — Capacity-class buffer pool with freelist slots
//! - [`packet`] — Header + payload view over a pooled buffer
//! - [`clock`] — Monotonic timestamps and sequence numbering
//! - [`stats`] — EWMA smoothing primitive

pub mod clock;
pub mod packet;
pub mod pool;
pub mod stats;
pub mod wire;
