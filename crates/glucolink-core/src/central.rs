//! Central coordinator.
//!
//! Owns the radio's central-role lifecycle: power-state tracking, the
//! retrieve-then-scan acquisition policy, discovery acceptance, disconnect
//! classification, delayed rescans and relaunch restoration.
//!
//! [`CentralCoordinator::start`] wires up three tasks:
//!
//! - the **callback pump** (this module), which drains the radio's event
//!   stream, feeds completions into the session, applies scanning policy
//!   and queues protocol work;
//! - the **engine driver** ([`crate::engine`]), the serial context that
//!   issues protocol commands one at a time;
//! - the **delegate dispatcher** ([`crate::events`]), which keeps slow
//!   consumers off the protocol path.
//!
//! The coordinator never gives up: radio errors are surfaced to the owner
//! and scanning resumes after a short delay, since a sensor can be briefly
//! out of range.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glucolink_types::types::SensorLifecycleState;
use glucolink_types::uuid::{ADVERTISEMENT_SERVICE, AUTHENTICATION, CONTROL, SENSOR_SERVICE};

use crate::cell::SyncCell;
use crate::config::{LinkConfig, PeripheralConfiguration};
use crate::engine::{Acceptance, Engine, EngineJob, SensorIdentity, classify_discovery};
use crate::error::{Error, RadioError, Result};
use crate::events::{EventDispatcher, LinkEvent, SensorLinkDelegate};
use crate::radio::{
    Advertisement, CentralRadio, PeripheralId, PeripheralLink, RadioEvent, is_remote_disconnect,
};
use crate::session::{ConnectionState, PeripheralSession, SessionNotification};

/// Signal strength quality buckets derived from RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SignalQuality {
    /// Signal too weak for reliable operation (< -85 dBm).
    Poor,
    /// Usable but may drop (-85 to -75 dBm).
    Fair,
    /// Good signal strength (-75 to -60 dBm).
    Good,
    /// Excellent signal strength (> -60 dBm).
    Excellent,
}

impl SignalQuality {
    /// Bucket an RSSI value in dBm.
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r > -60 => SignalQuality::Excellent,
            r if r > -75 => SignalQuality::Good,
            r if r > -85 => SignalQuality::Fair,
            _ => SignalQuality::Poor,
        }
    }
}

/// Snapshot of the link's externally visible state.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    /// Sensor lifecycle derived from the latest decoded message.
    pub lifecycle: SensorLifecycleState,
    /// Connection state of the active peripheral reference.
    pub connection: ConnectionState,
    /// Identity of the active peripheral, if a session is up.
    pub active_peripheral: Option<PeripheralId>,
    /// Remembered sensor identity, if any.
    pub sensor: Option<SensorIdentity>,
    /// Activation instant of the current sensor session, if anchored.
    #[serde(with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
    /// Signal quality from the last RSSI read.
    pub signal: Option<SignalQuality>,
}

/// Control messages from the handle (and internal timers) to the pump.
#[derive(Debug)]
enum Control {
    Stop,
    ResumeScan,
}

/// Handle to a running sensor link.
///
/// Dropping the handle aborts the link's background tasks; call
/// [`stop`](Self::stop) first for an orderly teardown.
pub struct CentralCoordinator {
    control: mpsc::UnboundedSender<Control>,
    dispatcher: EventDispatcher,
    session: PeripheralSession,
    engine: Engine,
    remembered: Arc<SyncCell<Option<SensorIdentity>>>,
    active: Arc<SyncCell<Option<PeripheralId>>>,
    rssi: Arc<SyncCell<Option<i16>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CentralCoordinator {
    /// Start a sensor link on `radio`, reporting to `delegate`.
    ///
    /// `remembered` carries the sensor identity from a previous run, if the
    /// owner persisted one; the link then only promotes peripherals whose
    /// name suffix matches it.
    pub async fn start(
        radio: Arc<dyn CentralRadio>,
        delegate: Arc<dyn SensorLinkDelegate>,
        config: LinkConfig,
        remembered: Option<SensorIdentity>,
    ) -> Result<Self> {
        config.validate()?;

        let (dispatcher, dispatch_task) = EventDispatcher::new(delegate, config.event_buffer);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let session =
            PeripheralSession::new(PeripheralConfiguration::sensor_default(), session_tx);
        let remembered = Arc::new(SyncCell::new(remembered));
        let engine = Engine::new(
            session.clone(),
            dispatcher.clone(),
            config.clone(),
            Arc::clone(&remembered),
        );
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine_task = tokio::spawn(engine.clone().run(engine_rx));

        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        radio.attach(radio_tx).await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active = Arc::new(SyncCell::new(None));
        let rssi = Arc::new(SyncCell::new(None));

        let pump = Pump {
            radio,
            session: session.clone(),
            engine_tx,
            dispatcher: dispatcher.clone(),
            config,
            remembered: Arc::clone(&remembered),
            active: Arc::clone(&active),
            rssi: Arc::clone(&rssi),
            // The pump keeps its own sender for rescan timers.
            control_tx: control_tx.clone(),
            scanning: false,
            enabled: true,
            active_identified: false,
        };
        let pump_task = tokio::spawn(pump.run(radio_rx, control_rx, session_rx));

        Ok(Self {
            control: control_tx,
            dispatcher,
            session,
            engine,
            remembered,
            active,
            rssi,
            tasks: vec![dispatch_task, engine_task, pump_task],
        })
    }

    /// Stop the link: cancel any scan and tear down the current
    /// connection. A command already blocking in `run_command` is not
    /// aborted; its timeout is the only bound.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Forget the remembered sensor identity. Typically called by the
    /// owner after a disconnect flagged as a suspected end of session.
    pub fn forget_sensor(&self) {
        self.remembered.set(None);
        info!("remembered sensor identity cleared");
    }

    /// The remembered sensor identity, if any.
    pub fn remembered_sensor(&self) -> Option<SensorIdentity> {
        self.remembered.get()
    }

    /// Identity of the active peripheral, if a session is up.
    pub fn active_peripheral(&self) -> Option<PeripheralId> {
        self.active.get()
    }

    /// Subscribe to the broadcast mirror of the link's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.dispatcher.subscribe()
    }

    /// Snapshot the link's externally visible state.
    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            lifecycle: self.engine.lifecycle(),
            connection: self.session.connection_state(),
            active_peripheral: self.active.get(),
            sensor: self.remembered.get(),
            activated_at: self.engine.activation(),
            signal: self.rssi.get().map(SignalQuality::from_rssi),
        }
    }
}

impl Drop for CentralCoordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The callback pump: drains radio events, feeds the session's completion
/// matching, applies central policy and queues engine work.
struct Pump {
    radio: Arc<dyn CentralRadio>,
    session: PeripheralSession,
    engine_tx: mpsc::UnboundedSender<EngineJob>,
    dispatcher: EventDispatcher,
    config: LinkConfig,
    remembered: Arc<SyncCell<Option<SensorIdentity>>>,
    active: Arc<SyncCell<Option<PeripheralId>>>,
    rssi: Arc<SyncCell<Option<i16>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    scanning: bool,
    enabled: bool,
    /// Whether the peripheral being promoted already matched a remembered
    /// identity at classification time.
    active_identified: bool,
}

impl Pump {
    async fn run(
        mut self,
        mut radio_rx: mpsc::UnboundedReceiver<RadioEvent>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut session_rx: mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        loop {
            tokio::select! {
                Some(control) = control_rx.recv() => self.on_control(control).await,
                Some(event) = radio_rx.recv() => self.on_radio_event(event).await,
                Some(notification) = session_rx.recv() => self.on_session_notification(notification),
                else => break,
            }
        }
        debug!("callback pump finished");
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::Stop => {
                info!("stopping sensor link");
                self.enabled = false;
                self.stop_scan().await;
                if let Some(link) = self.session.link() {
                    if self.session.connection_state() == ConnectionState::Connected {
                        self.session.mark_disconnecting();
                        if let Err(err) = self.radio.disconnect(&link).await {
                            debug!(%err, "disconnect initiation failed");
                        }
                    }
                }
            }
            Control::ResumeScan => {
                if self.enabled
                    && self.radio.power_state().is_powered_on()
                    && self.session.connection_state() == ConnectionState::Disconnected
                {
                    self.acquire().await;
                }
            }
        }
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        // Completion matching and connection-state bookkeeping first.
        self.session.handle_event(&event);

        match event {
            RadioEvent::PowerStateChanged(state) => {
                info!(?state, "radio power state changed");
                self.dispatcher.emit(LinkEvent::ConnectionStatusChanged);
                if state.is_powered_on() {
                    if self.enabled {
                        self.acquire().await;
                    }
                } else {
                    // The radio cancels any scan itself in these states.
                    self.scanning = false;
                }
            }
            RadioEvent::Discovered {
                peripheral,
                advertisement,
            } => {
                self.on_discovered(peripheral, advertisement).await;
            }
            RadioEvent::StateRestored { peripherals } => {
                // Relaunch restoration runs the same acceptance policy as
                // fresh discoveries.
                info!(count = peripherals.len(), "restored peripherals from relaunch");
                for peripheral in peripherals {
                    let advertisement = Advertisement {
                        name: peripheral.name(),
                        services: vec![SENSOR_SERVICE],
                        rssi: None,
                    };
                    self.on_discovered(peripheral, advertisement).await;
                }
            }
            RadioEvent::Connected { id } => {
                if self.session.peripheral_id() == Some(id.clone()) {
                    info!(%id, "peripheral connected");
                    self.stop_scan().await;
                    self.active.set(Some(id));
                    let _ = self.engine_tx.send(EngineJob::Configure {
                        identified: self.active_identified,
                    });
                    if let Some(link) = self.session.link() {
                        if let Err(err) = link.read_rssi().await {
                            debug!(%err, "rssi read failed");
                        }
                    }
                    self.dispatcher.emit(LinkEvent::ConnectionStatusChanged);
                } else {
                    debug!(%id, "unpromoted candidate connected");
                }
            }
            RadioEvent::ConnectFailed { id, error } => {
                if self.session.peripheral_id() == Some(id.clone()) {
                    warn!(%id, %error, "connect failed");
                    self.dispatcher.emit_error(&Error::Radio(error));
                    self.schedule_rescan();
                }
            }
            RadioEvent::Disconnected { id, error } => {
                self.on_disconnected(id, error);
            }
            RadioEvent::RssiRead {
                rssi, error: None, ..
            } => {
                self.rssi.set(Some(rssi));
            }
            _ => {}
        }
    }

    fn on_session_notification(&mut self, notification: SessionNotification) {
        let SessionNotification::Update {
            characteristic,
            value,
        } = notification;
        let job = if characteristic == CONTROL {
            EngineJob::ControlNotification(value)
        } else if characteristic == AUTHENTICATION {
            EngineJob::AuthNotification(value)
        } else {
            debug!(%characteristic, "dropping update on unhandled characteristic");
            return;
        };
        let _ = self.engine_tx.send(job);
    }

    /// Power-on acquisition policy: retrieval by stored identity, then
    /// already-connected peripherals, then an active scan.
    async fn acquire(&mut self) {
        if matches!(
            self.session.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        if let Some(identity) = self.remembered.get() {
            if let Some(peripheral_id) = &identity.peripheral {
                if let Some(peripheral) = self.radio.known_peripheral(peripheral_id).await {
                    info!(%peripheral_id, "retrieved previously bonded peripheral");
                    self.promote(peripheral, true).await;
                    return;
                }
            }
        }

        let connected = self.radio.connected_peripherals(&[SENSOR_SERVICE]).await;
        for peripheral in connected {
            let advertisement = Advertisement {
                name: peripheral.name(),
                services: vec![SENSOR_SERVICE],
                rssi: None,
            };
            self.on_discovered(peripheral, advertisement).await;
            if matches!(
                self.session.connection_state(),
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
        }

        self.start_scan().await;
    }

    async fn on_discovered(
        &mut self,
        peripheral: Arc<dyn PeripheralLink>,
        advertisement: Advertisement,
    ) {
        let name = advertisement.name.clone().or_else(|| peripheral.name());
        let remembered = self.remembered.get();
        match classify_discovery(
            name.as_deref(),
            remembered.as_ref(),
            &self.config.name_prefix,
        ) {
            Acceptance::MakeActive { identified } => {
                debug!(name = ?name, identified, "promoting discovered peripheral");
                self.promote(peripheral, identified).await;
            }
            Acceptance::Connect => {
                debug!(name = ?name, "connecting unpromoted candidate");
                if let Err(err) = self.radio.connect(&peripheral).await {
                    debug!(%err, "candidate connect initiation failed");
                }
            }
            Acceptance::Ignore => {}
        }
    }

    /// Make `peripheral` the session's active reference and connect it.
    /// The session survives the swap; a device reconnecting under a new
    /// handle resumes the same logical session.
    async fn promote(&mut self, peripheral: Arc<dyn PeripheralLink>, identified: bool) {
        self.active_identified = identified;
        if identified {
            // Keep the stored retrieval identity current.
            let id = peripheral.id();
            self.remembered.mutate(|remembered| {
                if let Some(identity) = remembered {
                    identity.peripheral = Some(id.clone());
                }
            });
        }
        self.session.swap_link(Arc::clone(&peripheral));
        self.session.mark_connecting();
        if let Err(err) = self.radio.connect(&peripheral).await {
            warn!(%err, "connect initiation failed");
            self.dispatcher.emit_error(&Error::Radio(err));
            self.schedule_rescan();
        }
    }

    fn on_disconnected(&mut self, id: PeripheralId, error: Option<RadioError>) {
        if self.session.peripheral_id() != Some(id.clone()) {
            debug!(%id, "unpromoted peripheral disconnected");
            return;
        }
        let remote_initiated = is_remote_disconnect(&error);
        info!(%id, remote_initiated, "peripheral disconnected");
        if let Some(err) = &error {
            if !remote_initiated {
                // Remote-initiated disconnects are classified by the
                // engine; everything else is a connection error.
                self.dispatcher.emit_error(&Error::Radio(err.clone()));
            }
        }
        self.active.set(None);
        self.rssi.set(None);
        let _ = self
            .engine_tx
            .send(EngineJob::Disconnected { remote_initiated });

        if self.enabled {
            // Let the radio settle instead of hot-looping against it.
            self.schedule_rescan();
        }
    }

    fn schedule_rescan(&self) {
        let control = self.control_tx.clone();
        let delay = self.config.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.send(Control::ResumeScan);
        });
    }

    async fn start_scan(&mut self) {
        if self.scanning {
            return;
        }
        match self.radio.start_scan(&[ADVERTISEMENT_SERVICE]).await {
            Ok(()) => {
                self.scanning = true;
                info!("scanning for sensor");
            }
            Err(err) => {
                warn!(%err, "scan start failed");
                self.dispatcher.emit_error(&Error::Radio(err));
                self.schedule_rescan();
            }
        }
    }

    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        if let Err(err) = self.radio.stop_scan().await {
            debug!(%err, "scan stop failed");
        }
        self.scanning = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_quality_buckets() {
        assert_eq!(SignalQuality::from_rssi(-45), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(-70), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(-80), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rssi(-92), SignalQuality::Poor);
        assert!(SignalQuality::Excellent > SignalQuality::Poor);
    }
}
