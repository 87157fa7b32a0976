//! Bluetooth UUIDs for the glucose sensor link.
//!
//! One primary service plus four characteristics, fixed for a given sensor
//! hardware generation. The sensor advertises a separate 16-bit service
//! while it is connectable.

use uuid::{Uuid, uuid};

// --- Service UUIDs ---

/// Service UUID carried in the sensor's advertisement while connectable.
pub const ADVERTISEMENT_SERVICE: Uuid = uuid!("0000febc-0000-1000-8000-00805f9b34fb");

/// Primary sensor service containing all link characteristics.
pub const SENSOR_SERVICE: Uuid = uuid!("f8083532-849e-531c-c594-30f1f86a4ea5");

// --- Characteristic UUIDs ---

/// Communication characteristic, notifying for the life of the connection.
pub const COMMUNICATION: Uuid = uuid!("f8083533-849e-531c-c594-30f1f86a4ea5");

/// Control characteristic carrying glucose and session-control opcodes.
pub const CONTROL: Uuid = uuid!("f8083534-849e-531c-c594-30f1f86a4ea5");

/// Authentication characteristic (challenge/response handshake).
pub const AUTHENTICATION: Uuid = uuid!("f8083535-849e-531c-c594-30f1f86a4ea5");

/// Backfill characteristic streaming buffered historical records.
pub const BACKFILL: Uuid = uuid!("f8083536-849e-531c-c594-30f1f86a4ea5");

/// Advertised-name prefix shared by supported sensors. The two trailing
/// characters of the full name carry the per-sensor serial suffix.
pub const SENSOR_NAME_PREFIX: &str = "DXCM";
