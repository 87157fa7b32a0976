//! Platform-agnostic types and wire codec for CGM sensor links.
//!
//! This crate contains the pieces of the sensor link that do not depend on
//! any Bluetooth stack:
//!
//! - **Wire codec**: total decoders for the sensor's binary frame formats
//!   ([`codec`])
//! - **Domain types**: algorithm state, trend bucketing, typed readings
//!   ([`types`])
//! - **UUID profile**: the fixed service and characteristic identifiers
//!   ([`uuid`])
//!
//! The BLE link engine built on top of these lives in `glucolink-core`.

pub mod codec;
pub mod types;
pub mod uuid;

pub use codec::{AuthResponse, BackfillMessage, GlucoseMessage, opcode};
pub use types::{AlgorithmState, GlucoseReading, SensorLifecycleState, TrendDirection};
