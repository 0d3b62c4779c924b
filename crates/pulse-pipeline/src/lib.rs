//! # pulse-pipeline
//!
//! The Pulse processing layer: everything between a transport handing over
//! raw telemetry packets and typed field updates reaching their consumers.
//!
//! ## Crate structure
//!
//! - [`value`] — Tagged field value union
//! - [`extract`] — Field maps and offset-indexed extraction
//! - [`transform`] — Per-field transformation chains
//! - [`stats`] — Incremental and windowed field statistics
//! - [`registry`] — Subscription registry with priority-ordered fan-out
//! - [`router`] — Bounded priority queues and the worker pool
//! - [`source`] — Source adapter interface, simulation source
//! - [`dispatcher`] — Source/router/registry orchestration, back-pressure
//! - [`processor`] — Extraction→transform→statistics pipeline
//! - [`workers`] — Job pool for parallel processing
//! - [`config`] — TOML configuration surface
//! - [`metrics`] — Prometheus text rendering

pub mod config;
pub mod dispatcher;
pub mod extract;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod router;
pub mod source;
pub mod stats;
pub mod transform;
pub mod value;
pub mod workers;
