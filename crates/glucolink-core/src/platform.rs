//! btleplug-backed radio.
//!
//! Adapts btleplug's adapter/peripheral API to the callback-driven
//! [`CentralRadio`]/[`PeripheralLink`] contract: operations emit their
//! completion as [`RadioEvent`]s on the stream attached by the coordinator.
//!
//! btleplug does not report whether a disconnect was remote-initiated, so
//! the backend classifies: a disconnect with no matching local disconnect
//! request is reported as [`RadioError::PeripheralDisconnected`]. It also
//! has no relaunch-restoration callback; [`RadioEvent::StateRestored`] is
//! never emitted from this backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RadioError;
use crate::radio::{
    Advertisement, CentralRadio, DiscoveredService, PeripheralId, PeripheralLink, PowerState,
    RadioEvent,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Format a btleplug peripheral ID as a stable identity string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap MAC addresses.
fn format_peripheral_id(id: &btleplug::platform::PeripheralId) -> PeripheralId {
    let formatted = format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string();
    PeripheralId::new(formatted)
}

struct BtleShared {
    events: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
    power: Mutex<PowerState>,
    /// Peripherals we have wrapped, by identity.
    registry: Mutex<HashMap<PeripheralId, Arc<BtlePeripheral>>>,
    /// Identities with a local disconnect in flight; their disconnect
    /// callbacks are deliberate, not remote-initiated.
    deliberate: Mutex<HashSet<PeripheralId>>,
}

impl BtleShared {
    fn emit(&self, event: RadioEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            let _ = sender.send(event);
        }
    }
}

/// Central radio backed by the first available btleplug adapter.
pub struct BtleRadio {
    adapter: Adapter,
    shared: Arc<BtleShared>,
}

impl BtleRadio {
    /// Open the first available Bluetooth adapter.
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no Bluetooth adapter".into()))?;
        Ok(Self {
            adapter,
            shared: Arc::new(BtleShared {
                events: Mutex::new(None),
                power: Mutex::new(PowerState::Unknown),
                registry: Mutex::new(HashMap::new()),
                deliberate: Mutex::new(HashSet::new()),
            }),
        })
    }

    async fn wrap(&self, peripheral: Peripheral) -> Arc<BtlePeripheral> {
        let id = format_peripheral_id(&peripheral.id());
        if let Some(existing) = lock(&self.shared.registry).get(&id) {
            return Arc::clone(existing);
        }
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        let wrapped = Arc::new(BtlePeripheral {
            id: id.clone(),
            peripheral,
            shared: Arc::clone(&self.shared),
            name: Mutex::new(name),
            subscribed: Mutex::new(HashSet::new()),
            notifications_pumping: AtomicBool::new(false),
        });
        lock(&self.shared.registry).insert(id, Arc::clone(&wrapped));
        wrapped
    }

    fn registered(&self, id: &PeripheralId) -> Option<Arc<BtlePeripheral>> {
        lock(&self.shared.registry).get(id).cloned()
    }
}

#[async_trait]
impl CentralRadio for BtleRadio {
    async fn attach(&self, events: mpsc::UnboundedSender<RadioEvent>) -> Result<(), RadioError> {
        let initial = match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => PowerState::PoweredOn,
            Ok(CentralState::PoweredOff) => PowerState::PoweredOff,
            _ => PowerState::Unknown,
        };
        *lock(&self.shared.power) = initial;
        let _ = events.send(RadioEvent::PowerStateChanged(initial));
        *lock(&self.shared.events) = Some(events);

        let mut stream = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::StateUpdate(state) => {
                        let power = match state {
                            CentralState::PoweredOn => PowerState::PoweredOn,
                            CentralState::PoweredOff => PowerState::PoweredOff,
                            _ => PowerState::Unknown,
                        };
                        *lock(&shared.power) = power;
                        shared.emit(RadioEvent::PowerStateChanged(power));
                    }
                    CentralEvent::DeviceDiscovered(btle_id) => {
                        let Ok(peripheral) = adapter.peripheral(&btle_id).await else {
                            continue;
                        };
                        let properties = peripheral.properties().await.ok().flatten();
                        let advertisement = Advertisement {
                            name: properties.as_ref().and_then(|p| p.local_name.clone()),
                            services: properties
                                .as_ref()
                                .map(|p| p.services.clone())
                                .unwrap_or_default(),
                            rssi: properties.as_ref().and_then(|p| p.rssi),
                        };
                        let id = format_peripheral_id(&peripheral.id());
                        let wrapped = {
                            let registry = lock(&shared.registry);
                            registry.get(&id).cloned()
                        };
                        let wrapped = match wrapped {
                            Some(existing) => existing,
                            None => {
                                let wrapped = Arc::new(BtlePeripheral {
                                    id: id.clone(),
                                    peripheral,
                                    shared: Arc::clone(&shared),
                                    name: Mutex::new(advertisement.name.clone()),
                                    subscribed: Mutex::new(HashSet::new()),
                                    notifications_pumping: AtomicBool::new(false),
                                });
                                lock(&shared.registry).insert(id, Arc::clone(&wrapped));
                                wrapped
                            }
                        };
                        if let Some(name) = &advertisement.name {
                            wrapped.set_name(name.clone());
                        }
                        shared.emit(RadioEvent::Discovered {
                            peripheral: wrapped as Arc<dyn PeripheralLink>,
                            advertisement,
                        });
                    }
                    CentralEvent::DeviceUpdated(btle_id) => {
                        let id = format_peripheral_id(&btle_id);
                        let Some(wrapped) = lock(&shared.registry).get(&id).cloned() else {
                            continue;
                        };
                        let name = wrapped
                            .peripheral
                            .properties()
                            .await
                            .ok()
                            .flatten()
                            .and_then(|p| p.local_name);
                        if let Some(name) = name {
                            if wrapped.name().as_deref() != Some(name.as_str()) {
                                wrapped.set_name(name.clone());
                                shared.emit(RadioEvent::NameUpdated { id, name });
                            }
                        }
                    }
                    CentralEvent::DeviceConnected(btle_id) => {
                        shared.emit(RadioEvent::Connected {
                            id: format_peripheral_id(&btle_id),
                        });
                    }
                    CentralEvent::DeviceDisconnected(btle_id) => {
                        let id = format_peripheral_id(&btle_id);
                        let deliberate = lock(&shared.deliberate).remove(&id);
                        shared.emit(RadioEvent::Disconnected {
                            id,
                            error: (!deliberate).then_some(RadioError::PeripheralDisconnected),
                        });
                    }
                    _ => {}
                }
            }
            debug!("adapter event stream closed");
        });
        Ok(())
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), RadioError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn known_peripheral(&self, id: &PeripheralId) -> Option<Arc<dyn PeripheralLink>> {
        if let Some(wrapped) = self.registered(id) {
            return Some(wrapped as Arc<dyn PeripheralLink>);
        }
        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if format_peripheral_id(&peripheral.id()) == *id {
                return Some(self.wrap(peripheral).await as Arc<dyn PeripheralLink>);
            }
        }
        None
    }

    async fn connected_peripherals(&self, services: &[Uuid]) -> Vec<Arc<dyn PeripheralLink>> {
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return Vec::new();
        };
        let mut connected = Vec::new();
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let advertised = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .map(|p| p.services)
                .unwrap_or_default();
            if advertised.iter().any(|uuid| services.contains(uuid)) {
                connected.push(self.wrap(peripheral).await as Arc<dyn PeripheralLink>);
            }
        }
        connected
    }

    async fn connect(&self, peripheral: &Arc<dyn PeripheralLink>) -> Result<(), RadioError> {
        let id = peripheral.id();
        let Some(wrapped) = self.registered(&id) else {
            return Err(RadioError::Backend(format!("unknown peripheral {id}")));
        };
        let shared = Arc::clone(&self.shared);
        // Connecting can take seconds; never block the caller's task on it.
        tokio::spawn(async move {
            if let Err(err) = wrapped.peripheral.connect().await {
                warn!(%id, %err, "connect failed");
                shared.emit(RadioEvent::ConnectFailed {
                    id,
                    error: err.into(),
                });
            }
            // Success is reported through DeviceConnected on the adapter
            // event stream.
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &Arc<dyn PeripheralLink>) -> Result<(), RadioError> {
        let id = peripheral.id();
        let Some(wrapped) = self.registered(&id) else {
            return Err(RadioError::Backend(format!("unknown peripheral {id}")));
        };
        lock(&self.shared.deliberate).insert(id.clone());
        tokio::spawn(async move {
            if let Err(err) = wrapped.peripheral.disconnect().await {
                debug!(%id, %err, "disconnect failed");
            }
        });
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        *lock(&self.shared.power)
    }
}

/// One btleplug peripheral behind the [`PeripheralLink`] contract.
pub struct BtlePeripheral {
    id: PeripheralId,
    peripheral: Peripheral,
    shared: Arc<BtleShared>,
    name: Mutex<Option<String>>,
    subscribed: Mutex<HashSet<Uuid>>,
    notifications_pumping: AtomicBool,
}

impl std::fmt::Debug for BtlePeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtlePeripheral")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl BtlePeripheral {
    fn set_name(&self, name: String) {
        *lock(&self.name) = Some(name);
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, RadioError> {
        self.peripheral
            .services()
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.uuid == uuid)
            .cloned()
            .ok_or_else(|| RadioError::Backend(format!("characteristic {uuid} not discovered")))
    }

    /// Start forwarding the peripheral's notification stream, once.
    async fn ensure_notification_pump(&self) -> Result<(), RadioError> {
        if self.notifications_pumping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut stream = self.peripheral.notifications().await?;
        let shared = Arc::clone(&self.shared);
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                shared.emit(RadioEvent::ValueUpdated {
                    id: id.clone(),
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                    error: None,
                });
            }
            debug!(%id, "notification stream closed");
        });
        Ok(())
    }
}

#[async_trait]
impl PeripheralLink for BtlePeripheral {
    fn id(&self) -> PeripheralId {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    fn known_services(&self) -> Vec<DiscoveredService> {
        self.peripheral
            .services()
            .iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|characteristic| characteristic.uuid)
                    .collect(),
            })
            .collect()
    }

    fn is_notifying(&self, characteristic: Uuid) -> bool {
        lock(&self.subscribed).contains(&characteristic)
    }

    async fn discover_services(&self, _services: &[Uuid]) -> Result<(), RadioError> {
        // btleplug discovers the whole database in one pass, including
        // characteristics; per-service discovery below completes from it.
        self.peripheral.discover_services().await?;
        self.shared.emit(RadioEvent::ServicesDiscovered {
            id: self.id.clone(),
            error: None,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        service: Uuid,
        _characteristics: &[Uuid],
    ) -> Result<(), RadioError> {
        let known = self
            .peripheral
            .services()
            .iter()
            .any(|s| s.uuid == service);
        if !known {
            return Err(RadioError::Backend(format!("service {service} not found")));
        }
        self.shared.emit(RadioEvent::CharacteristicsDiscovered {
            id: self.id.clone(),
            service,
            error: None,
        });
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), RadioError> {
        let target = self.find_characteristic(characteristic)?;
        if enabled {
            self.ensure_notification_pump().await?;
            self.peripheral.subscribe(&target).await?;
            lock(&self.subscribed).insert(characteristic);
        } else {
            self.peripheral.unsubscribe(&target).await?;
            lock(&self.subscribed).remove(&characteristic);
        }
        self.shared.emit(RadioEvent::NotificationStateChanged {
            id: self.id.clone(),
            characteristic,
            enabled,
            error: None,
        });
        Ok(())
    }

    async fn write_value(&self, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;
        self.shared.emit(RadioEvent::ValueWritten {
            id: self.id.clone(),
            characteristic,
            error: None,
        });
        Ok(())
    }

    async fn read_rssi(&self) -> Result<(), RadioError> {
        let rssi = self
            .peripheral
            .properties()
            .await?
            .and_then(|properties| properties.rssi)
            .ok_or_else(|| RadioError::Backend("RSSI not available".into()))?;
        self.shared.emit(RadioEvent::RssiRead {
            id: self.id.clone(),
            rssi,
            error: None,
        });
        Ok(())
    }
}
