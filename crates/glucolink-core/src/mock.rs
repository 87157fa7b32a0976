//! Mock radio implementation for testing.
//!
//! [`MockRadio`] and [`MockPeripheral`] implement the radio contract
//! in-memory so the session, coordinator and engine can be exercised
//! without BLE hardware. Tests script the peripheral's behavior: which
//! services it exposes, whether operations complete, and which frames it
//! pushes as notifications.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use glucolink_types::uuid::{AUTHENTICATION, BACKFILL, COMMUNICATION, CONTROL, SENSOR_SERVICE};

use crate::error::RadioError;
use crate::radio::{
    Advertisement, CentralRadio, DiscoveredService, PeripheralId, PeripheralLink, PowerState,
    RadioEvent,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scriptable in-memory peripheral.
///
/// Radio operations record themselves in a command log (for assertions),
/// mutate the peripheral's state, and emit the matching completion event —
/// unless the peripheral was built [`silent`](MockPeripheralBuilder::silent),
/// in which case completions never arrive and commands run into their
/// timeouts.
#[derive(Debug)]
pub struct MockPeripheral {
    id: PeripheralId,
    name: Mutex<Option<String>>,
    /// Full GATT database of the simulated device.
    profile: Vec<DiscoveredService>,
    /// What discovery has revealed so far.
    discovered: Mutex<Vec<DiscoveredService>>,
    notifying: Mutex<HashSet<Uuid>>,
    connected: AtomicBool,
    silent: bool,
    rssi: i16,
    commands: Mutex<Vec<String>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    events: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
}

/// Builder for [`MockPeripheral`].
pub struct MockPeripheralBuilder {
    id: PeripheralId,
    name: Option<String>,
    profile: Vec<DiscoveredService>,
    silent: bool,
    rssi: i16,
}

impl MockPeripheralBuilder {
    /// Set the advertised name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Expose the standard sensor service with all four link
    /// characteristics.
    #[must_use]
    pub fn sensor_profile(mut self) -> Self {
        self.profile = vec![DiscoveredService {
            uuid: SENSOR_SERVICE,
            characteristics: vec![COMMUNICATION, CONTROL, AUTHENTICATION, BACKFILL],
        }];
        self
    }

    /// Expose a custom service.
    #[must_use]
    pub fn service(mut self, uuid: Uuid, characteristics: &[Uuid]) -> Self {
        self.profile.push(DiscoveredService {
            uuid,
            characteristics: characteristics.to_vec(),
        });
        self
    }

    /// Never emit completion events; every command runs into its timeout.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Set the RSSI reported by reads.
    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Build the peripheral.
    pub fn build(self) -> Arc<MockPeripheral> {
        Arc::new(MockPeripheral {
            id: self.id,
            name: Mutex::new(self.name),
            profile: self.profile,
            discovered: Mutex::new(Vec::new()),
            notifying: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            silent: self.silent,
            rssi: self.rssi,
            commands: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }
}

impl MockPeripheral {
    /// Start building a peripheral with the given identity.
    pub fn builder(id: impl Into<String>) -> MockPeripheralBuilder {
        MockPeripheralBuilder {
            id: PeripheralId::new(id),
            name: None,
            profile: Vec::new(),
            silent: false,
            rssi: -60,
        }
    }

    /// Push a notification frame, as the sensor would.
    pub fn notify_value(&self, characteristic: Uuid, value: impl Into<Bytes>) {
        self.emit(RadioEvent::ValueUpdated {
            id: self.id.clone(),
            characteristic,
            value: value.into(),
            error: None,
        });
    }

    /// Radio calls issued against this peripheral, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Number of radio calls issued against this peripheral.
    pub fn command_count(&self) -> usize {
        lock(&self.commands).len()
    }

    /// Values written to characteristics, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Whether the simulated device considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn record(&self, command: String) {
        lock(&self.commands).push(command);
    }

    fn emit(&self, event: RadioEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            let _ = sender.send(event);
        }
    }

    fn attach_events(&self, sender: mpsc::UnboundedSender<RadioEvent>) {
        *lock(&self.events) = Some(sender);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeripheralLink for MockPeripheral {
    fn id(&self) -> PeripheralId {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    fn known_services(&self) -> Vec<DiscoveredService> {
        lock(&self.discovered).clone()
    }

    fn is_notifying(&self, characteristic: Uuid) -> bool {
        lock(&self.notifying).contains(&characteristic)
    }

    async fn discover_services(&self, services: &[Uuid]) -> Result<(), RadioError> {
        self.record(format!("discover_services({})", services.len()));
        if self.silent {
            return Ok(());
        }
        {
            let mut discovered = lock(&self.discovered);
            for service in &self.profile {
                let requested = services.contains(&service.uuid);
                let known = discovered.iter().any(|s| s.uuid == service.uuid);
                if requested && !known {
                    // Service discovery reveals the service only;
                    // characteristics come from their own discovery step.
                    discovered.push(DiscoveredService {
                        uuid: service.uuid,
                        characteristics: Vec::new(),
                    });
                }
            }
        }
        self.emit(RadioEvent::ServicesDiscovered {
            id: self.id.clone(),
            error: None,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), RadioError> {
        self.record(format!("discover_characteristics({service})"));
        if self.silent {
            return Ok(());
        }
        {
            let mut discovered = lock(&self.discovered);
            if let (Some(actual), Some(view)) = (
                self.profile.iter().find(|s| s.uuid == service),
                discovered.iter_mut().find(|s| s.uuid == service),
            ) {
                for characteristic in characteristics {
                    if actual.characteristics.contains(characteristic)
                        && !view.characteristics.contains(characteristic)
                    {
                        view.characteristics.push(*characteristic);
                    }
                }
            }
        }
        self.emit(RadioEvent::CharacteristicsDiscovered {
            id: self.id.clone(),
            service,
            error: None,
        });
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), RadioError> {
        self.record(format!("set_notify({characteristic}, {enabled})"));
        if self.silent {
            return Ok(());
        }
        if enabled {
            lock(&self.notifying).insert(characteristic);
        } else {
            lock(&self.notifying).remove(&characteristic);
        }
        self.emit(RadioEvent::NotificationStateChanged {
            id: self.id.clone(),
            characteristic,
            enabled,
            error: None,
        });
        Ok(())
    }

    async fn write_value(&self, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError> {
        self.record(format!("write_value({characteristic})"));
        lock(&self.writes).push((characteristic, value.to_vec()));
        if self.silent {
            return Ok(());
        }
        self.emit(RadioEvent::ValueWritten {
            id: self.id.clone(),
            characteristic,
            error: None,
        });
        Ok(())
    }

    async fn read_rssi(&self) -> Result<(), RadioError> {
        self.record("read_rssi".to_string());
        if self.silent {
            return Ok(());
        }
        self.emit(RadioEvent::RssiRead {
            id: self.id.clone(),
            rssi: self.rssi,
            error: None,
        });
        Ok(())
    }
}

struct MockRadioShared {
    events: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
    power: Mutex<PowerState>,
    /// Registered peripherals, addressable by identity.
    registry: Mutex<Vec<Arc<MockPeripheral>>>,
    /// Subset retrievable without a scan (previously bonded).
    bonded: Mutex<Vec<PeripheralId>>,
    /// Subset already connected at the system level.
    system_connected: Mutex<Vec<PeripheralId>>,
    scanning: AtomicBool,
    scan_starts: AtomicU32,
}

/// A scriptable in-memory central radio.
#[derive(Clone)]
pub struct MockRadio {
    shared: Arc<MockRadioShared>,
}

impl MockRadio {
    /// Create a radio with power state [`PowerState::Unknown`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockRadioShared {
                events: Mutex::new(None),
                power: Mutex::new(PowerState::Unknown),
                registry: Mutex::new(Vec::new()),
                bonded: Mutex::new(Vec::new()),
                system_connected: Mutex::new(Vec::new()),
                scanning: AtomicBool::new(false),
                scan_starts: AtomicU32::new(0),
            }),
        }
    }

    /// Register a peripheral with the radio so its events reach the
    /// attached consumer.
    pub fn register(&self, peripheral: &Arc<MockPeripheral>) {
        if let Some(sender) = lock(&self.shared.events).as_ref() {
            peripheral.attach_events(sender.clone());
        }
        lock(&self.shared.registry).push(Arc::clone(peripheral));
    }

    /// Mark a registered peripheral as previously bonded, making it
    /// retrievable by identity without a scan.
    pub fn mark_bonded(&self, peripheral: &Arc<MockPeripheral>) {
        lock(&self.shared.bonded).push(peripheral.id());
    }

    /// Mark a registered peripheral as already connected at the system
    /// level.
    pub fn mark_system_connected(&self, peripheral: &Arc<MockPeripheral>) {
        lock(&self.shared.system_connected).push(peripheral.id());
    }

    /// Change the power state and report it to the consumer.
    pub fn set_power(&self, state: PowerState) {
        *lock(&self.shared.power) = state;
        self.emit(RadioEvent::PowerStateChanged(state));
    }

    /// Deliver an advertisement for a registered peripheral.
    pub fn advertise(&self, peripheral: &Arc<MockPeripheral>) {
        let advertisement = Advertisement {
            name: peripheral.name(),
            services: peripheral
                .profile
                .iter()
                .map(|service| service.uuid)
                .collect(),
            rssi: Some(peripheral.rssi),
        };
        self.emit(RadioEvent::Discovered {
            peripheral: Arc::clone(peripheral) as Arc<dyn PeripheralLink>,
            advertisement,
        });
    }

    /// Simulate a disconnect the peripheral initiated itself.
    pub fn remote_disconnect(&self, peripheral: &Arc<MockPeripheral>) {
        peripheral.set_connected(false);
        self.emit(RadioEvent::Disconnected {
            id: peripheral.id(),
            error: Some(RadioError::PeripheralDisconnected),
        });
    }

    /// Simulate a disconnect caused by a radio-level failure.
    pub fn drop_connection(&self, peripheral: &Arc<MockPeripheral>, reason: &str) {
        peripheral.set_connected(false);
        self.emit(RadioEvent::Disconnected {
            id: peripheral.id(),
            error: Some(RadioError::Backend(reason.to_string())),
        });
    }

    /// Hand back peripherals as OS relaunch restoration would.
    pub fn restore(&self, peripherals: &[Arc<MockPeripheral>]) {
        self.emit(RadioEvent::StateRestored {
            peripherals: peripherals
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn PeripheralLink>)
                .collect(),
        });
    }

    /// Whether a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    /// Number of times scanning was started.
    pub fn scan_starts(&self) -> u32 {
        self.shared.scan_starts.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RadioEvent) {
        if let Some(sender) = lock(&self.shared.events).as_ref() {
            let _ = sender.send(event);
        }
    }

    fn find(&self, id: &PeripheralId) -> Option<Arc<MockPeripheral>> {
        lock(&self.shared.registry)
            .iter()
            .find(|p| p.id() == *id)
            .cloned()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CentralRadio for MockRadio {
    async fn attach(&self, events: mpsc::UnboundedSender<RadioEvent>) -> Result<(), RadioError> {
        for peripheral in lock(&self.shared.registry).iter() {
            peripheral.attach_events(events.clone());
        }
        let power = *lock(&self.shared.power);
        let _ = events.send(RadioEvent::PowerStateChanged(power));
        *lock(&self.shared.events) = Some(events);
        Ok(())
    }

    async fn start_scan(&self, _services: &[Uuid]) -> Result<(), RadioError> {
        if !self.power_state().is_powered_on() {
            return Err(RadioError::Unavailable("radio not powered on".into()));
        }
        self.shared.scanning.store(true, Ordering::SeqCst);
        self.shared.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn known_peripheral(&self, id: &PeripheralId) -> Option<Arc<dyn PeripheralLink>> {
        if !lock(&self.shared.bonded).contains(id) {
            return None;
        }
        self.find(id).map(|p| p as Arc<dyn PeripheralLink>)
    }

    async fn connected_peripherals(&self, services: &[Uuid]) -> Vec<Arc<dyn PeripheralLink>> {
        let connected = lock(&self.shared.system_connected).clone();
        connected
            .iter()
            .filter_map(|id| self.find(id))
            .filter(|p| {
                p.profile
                    .iter()
                    .any(|service| services.contains(&service.uuid))
            })
            .map(|p| p as Arc<dyn PeripheralLink>)
            .collect()
    }

    async fn connect(&self, peripheral: &Arc<dyn PeripheralLink>) -> Result<(), RadioError> {
        let id = peripheral.id();
        if let Some(mock) = self.find(&id) {
            mock.set_connected(true);
        }
        self.emit(RadioEvent::Connected { id });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &Arc<dyn PeripheralLink>) -> Result<(), RadioError> {
        let id = peripheral.id();
        if let Some(mock) = self.find(&id) {
            mock.set_connected(false);
        }
        self.emit(RadioEvent::Disconnected { id, error: None });
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        *lock(&self.shared.power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_reveals_incrementally() {
        let peripheral = MockPeripheral::builder("P1").sensor_profile().build();
        assert!(peripheral.known_services().is_empty());

        peripheral.discover_services(&[SENSOR_SERVICE]).await.unwrap();
        let services = peripheral.known_services();
        assert_eq!(services.len(), 1);
        assert!(services[0].characteristics.is_empty());

        peripheral
            .discover_characteristics(SENSOR_SERVICE, &[CONTROL, AUTHENTICATION])
            .await
            .unwrap();
        let services = peripheral.known_services();
        assert_eq!(services[0].characteristics.len(), 2);
    }

    #[tokio::test]
    async fn test_silent_peripheral_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let radio = MockRadio::new();
        let peripheral = MockPeripheral::builder("P1").sensor_profile().silent().build();
        radio.register(&peripheral);
        radio.attach(tx).await.unwrap();
        // Drain the initial power-state report.
        assert!(matches!(
            rx.recv().await,
            Some(RadioEvent::PowerStateChanged(_))
        ));

        peripheral.discover_services(&[SENSOR_SERVICE]).await.unwrap();
        peripheral.set_notify(CONTROL, true).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(peripheral.command_count(), 2);
    }

    #[tokio::test]
    async fn test_bonded_retrieval() {
        let radio = MockRadio::new();
        let peripheral = MockPeripheral::builder("P1").sensor_profile().build();
        radio.register(&peripheral);
        assert!(radio.known_peripheral(&peripheral.id()).await.is_none());
        radio.mark_bonded(&peripheral);
        assert!(radio.known_peripheral(&peripheral.id()).await.is_some());
    }
}
