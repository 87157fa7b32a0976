//! BLE sensor link engine for CGM sensors.
//!
//! This crate maintains a direct Bluetooth Low Energy link to a wearable
//! glucose sensor, authenticates it, and turns the sensor's proprietary
//! binary notifications into typed glucose readings.
//!
//! # Architecture
//!
//! - [`central::CentralCoordinator`] owns the radio's central-role
//!   lifecycle: power tracking, the retrieve-then-scan acquisition policy,
//!   disconnect classification and delayed rescans.
//! - [`session::PeripheralSession`] owns one peripheral connection and
//!   makes the radio's callback-driven operations look synchronous through
//!   its pending-command machinery.
//! - The protocol engine drives authenticate → enable-control →
//!   enable-backfill, anchors the session's activation date, and flushes
//!   backfilled history into reading batches.
//! - [`radio`] defines the abstract radio contract; [`platform::BtleRadio`]
//!   implements it over btleplug and [`mock::MockRadio`] implements it
//!   in-memory for tests.
//!
//! The link never gives up: errors are surfaced as events and scanning
//! resumes after a short delay, since a sensor can be briefly out of range.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use glucolink_core::{BtleRadio, CentralCoordinator, LinkConfig, SensorLinkDelegate};
//! use glucolink_types::GlucoseReading;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl SensorLinkDelegate for Printer {
//!     async fn sensor_read(&self, reading: GlucoseReading) {
//!         println!("{reading}");
//!     }
//!     async fn sensor_discovered_new(&self, name: &str, _at: time::OffsetDateTime) -> bool {
//!         println!("adopting sensor {name}");
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BtleRadio::new().await?);
//!     let link = CentralCoordinator::start(
//!         radio,
//!         Arc::new(Printer),
//!         LinkConfig::default(),
//!         None,
//!     )
//!     .await?;
//!     tokio::signal::ctrl_c().await?;
//!     link.stop();
//!     Ok(())
//! }
//! ```

pub mod cell;
pub mod central;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod mock;
pub mod platform;
pub mod radio;
pub mod session;

// Core exports
pub use cell::SyncCell;
pub use central::{CentralCoordinator, LinkStatus, SignalQuality};
pub use config::{LinkConfig, PeripheralConfiguration, ServiceConfiguration};
pub use engine::{Acceptance, SensorIdentity, classify_discovery};
pub use error::{Error, RadioError, Result};
pub use events::{EventDispatcher, LinkEvent, SensorLinkDelegate};
pub use mock::{MockPeripheral, MockRadio};
pub use platform::BtleRadio;
pub use radio::{
    Advertisement, CentralRadio, DiscoveredService, PeripheralId, PeripheralLink, PowerState,
    RadioEvent,
};
pub use session::{ConnectionState, PendingCommand, PeripheralSession, SessionNotification};

// Re-export the wire types crate for convenience.
pub use glucolink_types as types;
