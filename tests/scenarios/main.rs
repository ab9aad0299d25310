//! End-to-end scenarios over both storage layers
//!
//! The record contract is the same for a physical stream and an overlay
//! stream, so every scenario here is written once against `RecordStream`
//! and run on each layer.
//!
//! - `contract`: the worked scenarios (read-after-write, version refusal,
//!   full logs, reservation conservation, delete behind in-flight reads)
//! - `properties`: property-based checks of the overlay against a model

#[path = "../common/mod.rs"]
mod common;

mod contract;
mod properties;
