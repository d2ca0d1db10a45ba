//! `cospace-engine` – the pose-synchronization pipeline and the top-level
//! session engine.
//!
//! Per remote entity, [`EntitySync`] turns noisy, last-write-wins network
//! pose samples into a stable, continuously interpolated local pose:
//! ingest-with-change-detection, lazy cached frame transform, fixed-fraction
//! slerp/lerp toward the cached target. [`SyncEngine`] wires the hub, the
//! frame registry, and the per-entity pipelines into the single tick-driven
//! surface that rendering and UI consume.

pub mod engine;
pub mod entity;

pub use engine::SyncEngine;
pub use entity::{EntitySync, Smoothing};
