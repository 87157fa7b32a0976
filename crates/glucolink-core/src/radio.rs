//! Abstract radio contract.
//!
//! The link engine consumes a callback-driven central-role radio: methods
//! on [`CentralRadio`] and [`PeripheralLink`] *initiate* operations, and
//! completion arrives later on the radio's event stream as a
//! [`RadioEvent`]. This mirrors how platform BLE stacks actually behave and
//! is what the session's pending-command machinery synchronizes over.
//!
//! Two implementations ship with the crate: [`crate::platform::BtleRadio`]
//! backed by btleplug, and [`crate::mock::MockRadio`] for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RadioError;

/// Opaque stable identifier for a physical peripheral, independent of any
/// single connection instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a backend identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Power state of the central radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// State not yet reported.
    Unknown,
    /// Radio resetting; transient.
    Resetting,
    /// BLE central role unsupported on this host.
    Unsupported,
    /// Application not authorized to use the radio.
    Unauthorized,
    /// Radio off.
    PoweredOff,
    /// Radio on and usable.
    PoweredOn,
}

impl PowerState {
    /// Whether the radio can take commands.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, PowerState::PoweredOn)
    }
}

/// Advertisement data seen during discovery.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Advertised local name, if present.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength at discovery time.
    pub rssi: Option<i16>,
}

/// A service and the characteristics discovered under it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// The service UUID.
    pub uuid: Uuid,
    /// Characteristics discovered under this service.
    pub characteristics: Vec<Uuid>,
}

/// Callback stream delivered by a radio backend.
///
/// Completion events carry `error: Option<RadioError>` — `None` means the
/// operation succeeded.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// The central radio's power state changed.
    PowerStateChanged(PowerState),
    /// A peripheral was discovered during scanning.
    Discovered {
        peripheral: Arc<dyn PeripheralLink>,
        advertisement: Advertisement,
    },
    /// A connection attempt completed.
    Connected { id: PeripheralId },
    /// A connection attempt failed before being established.
    ConnectFailed { id: PeripheralId, error: RadioError },
    /// An established connection ended. `error` is `None` for a deliberate
    /// local disconnect; a remote-initiated disconnect is reported as
    /// [`RadioError::PeripheralDisconnected`].
    Disconnected {
        id: PeripheralId,
        error: Option<RadioError>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        id: PeripheralId,
        error: Option<RadioError>,
    },
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        error: Option<RadioError>,
    },
    /// A notification subscription change completed.
    NotificationStateChanged {
        id: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
        error: Option<RadioError>,
    },
    /// A characteristic write completed.
    ValueWritten {
        id: PeripheralId,
        characteristic: Uuid,
        error: Option<RadioError>,
    },
    /// A characteristic value arrived, solicited or not.
    ValueUpdated {
        id: PeripheralId,
        characteristic: Uuid,
        value: Bytes,
        error: Option<RadioError>,
    },
    /// An RSSI read completed.
    RssiRead {
        id: PeripheralId,
        rssi: i16,
        error: Option<RadioError>,
    },
    /// The peripheral's advertised name changed.
    NameUpdated { id: PeripheralId, name: String },
    /// The OS relaunched the process and handed back previously-connected
    /// peripherals.
    StateRestored {
        peripherals: Vec<Arc<dyn PeripheralLink>>,
    },
}

/// Whether a disconnect was initiated by the peripheral itself.
pub fn is_remote_disconnect(error: &Option<RadioError>) -> bool {
    matches!(error, Some(RadioError::PeripheralDisconnected))
}

/// Central-role operations of a radio backend.
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Begin delivering callbacks into `events`. Called once by the
    /// coordinator before any other operation; the backend reports its
    /// current power state as the first event.
    async fn attach(
        &self,
        events: mpsc::UnboundedSender<RadioEvent>,
    ) -> std::result::Result<(), RadioError>;

    /// Start scanning for peripherals advertising any of `services`.
    async fn start_scan(&self, services: &[Uuid]) -> std::result::Result<(), RadioError>;

    /// Stop an active scan. A no-op when not scanning.
    async fn stop_scan(&self) -> std::result::Result<(), RadioError>;

    /// Retrieve a previously-bonded peripheral by stored identity, without
    /// scanning.
    async fn known_peripheral(&self, id: &PeripheralId) -> Option<Arc<dyn PeripheralLink>>;

    /// Peripherals already connected at the system level that expose any of
    /// `services`.
    async fn connected_peripherals(&self, services: &[Uuid]) -> Vec<Arc<dyn PeripheralLink>>;

    /// Initiate a connection; completion arrives as
    /// [`RadioEvent::Connected`] or [`RadioEvent::ConnectFailed`].
    async fn connect(
        &self,
        peripheral: &Arc<dyn PeripheralLink>,
    ) -> std::result::Result<(), RadioError>;

    /// Initiate a deliberate disconnect; completion arrives as
    /// [`RadioEvent::Disconnected`] with `error: None`.
    async fn disconnect(
        &self,
        peripheral: &Arc<dyn PeripheralLink>,
    ) -> std::result::Result<(), RadioError>;

    /// Last reported power state.
    fn power_state(&self) -> PowerState;
}

/// Operations on one peripheral connection.
///
/// Methods initiate radio calls; completion arrives on the radio's event
/// stream. State accessors reflect what confirmed callbacks have reported
/// so far.
#[async_trait]
pub trait PeripheralLink: Send + Sync + fmt::Debug {
    /// Stable identity of the physical device.
    fn id(&self) -> PeripheralId;

    /// Advertised or GAP name, if known.
    fn name(&self) -> Option<String>;

    /// Services, with their characteristics, discovered so far.
    fn known_services(&self) -> Vec<DiscoveredService>;

    /// Whether a notification subscription is active on `characteristic`.
    fn is_notifying(&self, characteristic: Uuid) -> bool;

    /// Initiate discovery of `services`; completion arrives as
    /// [`RadioEvent::ServicesDiscovered`].
    async fn discover_services(&self, services: &[Uuid]) -> std::result::Result<(), RadioError>;

    /// Initiate characteristic discovery under `service`; completion
    /// arrives as [`RadioEvent::CharacteristicsDiscovered`].
    async fn discover_characteristics(
        &self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> std::result::Result<(), RadioError>;

    /// Initiate a notification subscription change; completion arrives as
    /// [`RadioEvent::NotificationStateChanged`].
    async fn set_notify(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> std::result::Result<(), RadioError>;

    /// Initiate a characteristic write; completion arrives as
    /// [`RadioEvent::ValueWritten`].
    async fn write_value(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> std::result::Result<(), RadioError>;

    /// Initiate an RSSI read; completion arrives as
    /// [`RadioEvent::RssiRead`].
    async fn read_rssi(&self) -> std::result::Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_disconnect_classification() {
        assert!(is_remote_disconnect(&Some(
            RadioError::PeripheralDisconnected
        )));
        assert!(!is_remote_disconnect(&None));
        assert!(!is_remote_disconnect(&Some(RadioError::Backend(
            "connection timed out".into()
        ))));
    }

    #[test]
    fn test_power_state() {
        assert!(PowerState::PoweredOn.is_powered_on());
        for state in [
            PowerState::Unknown,
            PowerState::Resetting,
            PowerState::Unsupported,
            PowerState::Unauthorized,
            PowerState::PoweredOff,
        ] {
            assert!(!state.is_powered_on());
        }
    }

    #[test]
    fn test_peripheral_id_round_trip() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        let json = serde_json::to_string(&id).unwrap();
        let back: PeripheralId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
