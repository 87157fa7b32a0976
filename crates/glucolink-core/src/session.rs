//! Peripheral session.
//!
//! A [`PeripheralSession`] owns one physical peripheral connection and makes
//! the radio's callback-driven operations look synchronous to the protocol
//! engine: [`PeripheralSession::run_command`] registers pending-command
//! expectations, issues the radio call, and blocks the calling task until
//! the matching callback arrives or a bounded timeout elapses.
//!
//! Only one command may be in flight per session. The guard fails a second
//! concurrent call with [`Error::InvalidConfiguration`] rather than queueing
//! it; the engine task serializes its own command issuance.
//!
//! The session survives reconnection: the underlying [`PeripheralLink`] can
//! be swapped in place while the session (and its logical identity) live
//! on, since a peripheral reference can go stale across radio resets.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PeripheralConfiguration;
use crate::error::{Error, Result};
use crate::radio::{PeripheralLink, PeripheralId, PowerState, RadioEvent};

/// Connection lifecycle of the session's current peripheral reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Connect initiated, awaiting confirmation.
    Connecting,
    /// Connection confirmed by the radio.
    Connected,
    /// Deliberate disconnect initiated, awaiting confirmation.
    Disconnecting,
}

/// Predicate applied to candidate values when awaiting a value update.
pub type ValuePredicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Inline handler for unsolicited updates on one characteristic.
pub type MacroHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// What asynchronous radio event a command is waiting for.
///
/// Created when a command starts, removed exactly once when the matching
/// callback arrives or the wait times out.
pub enum PendingCommand {
    /// Awaiting service discovery completion.
    DiscoverServices,
    /// Awaiting characteristic discovery for one service.
    DiscoverCharacteristics {
        /// The service being discovered.
        service: Uuid,
    },
    /// Awaiting a notification-state change.
    NotificationState {
        /// The characteristic being (un)subscribed.
        characteristic: Uuid,
    },
    /// Awaiting a write completion.
    WriteValue {
        /// The characteristic being written.
        characteristic: Uuid,
    },
    /// Awaiting a value update, optionally filtered by a predicate.
    ValueUpdate {
        /// The characteristic being observed.
        characteristic: Uuid,
        /// Optional filter; non-matching updates leave the command pending.
        predicate: Option<ValuePredicate>,
    },
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingCommand::DiscoverServices => write!(f, "DiscoverServices"),
            PendingCommand::DiscoverCharacteristics { service } => {
                write!(f, "DiscoverCharacteristics({service})")
            }
            PendingCommand::NotificationState { characteristic } => {
                write!(f, "NotificationState({characteristic})")
            }
            PendingCommand::WriteValue { characteristic } => {
                write!(f, "WriteValue({characteristic})")
            }
            PendingCommand::ValueUpdate {
                characteristic,
                predicate,
            } => write!(
                f,
                "ValueUpdate({characteristic}, predicate: {})",
                predicate.is_some()
            ),
        }
    }
}

/// Unsolicited update forwarded to the session's owner.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// A characteristic value arrived with nothing pending and no macro
    /// handler registered.
    Update {
        /// Source characteristic.
        characteristic: Uuid,
        /// Raw frame bytes.
        value: Bytes,
    },
}

struct SessionState {
    link: Option<Arc<dyn PeripheralLink>>,
    connection: ConnectionState,
    power: PowerState,
    pending: Vec<PendingCommand>,
    failure: Option<Error>,
    macros: HashMap<Uuid, MacroHandler>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    completed: Notify,
    owner_tx: mpsc::UnboundedSender<SessionNotification>,
    config: PeripheralConfiguration,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registration handle passed to a [`PeripheralSession::run_command`] body.
///
/// The body registers its pending expectations *before* issuing the radio
/// call so a fast callback cannot race the registration.
pub struct CommandScope {
    shared: Arc<SessionShared>,
    link: Arc<dyn PeripheralLink>,
}

impl CommandScope {
    /// The peripheral the command runs against.
    pub fn link(&self) -> Arc<dyn PeripheralLink> {
        Arc::clone(&self.link)
    }

    /// Register an expectation to be completed by a matching callback.
    pub fn expect(&self, command: PendingCommand) {
        self.shared.lock().pending.push(command);
    }
}

/// Owns one peripheral connection and its command synchronization state.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct PeripheralSession {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("PeripheralSession")
            .field("connection", &state.connection)
            .field("power", &state.power)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl PeripheralSession {
    /// Create a session with no peripheral attached. Unsolicited updates
    /// with no macro handler are forwarded to `owner_tx`.
    pub fn new(
        config: PeripheralConfiguration,
        owner_tx: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState {
                    link: None,
                    connection: ConnectionState::Disconnected,
                    power: PowerState::Unknown,
                    pending: Vec::new(),
                    failure: None,
                    macros: HashMap::new(),
                }),
                completed: Notify::new(),
                owner_tx,
                config,
            }),
        }
    }

    /// Replace the underlying peripheral reference in place, keeping the
    /// session alive. Configuration must be re-applied afterwards; the
    /// idempotent [`apply_configuration`](Self::apply_configuration) only
    /// re-does what the new reference is missing.
    pub fn swap_link(&self, link: Arc<dyn PeripheralLink>) {
        let mut state = self.shared.lock();
        if let Some(current) = &state.link {
            if current.id() != link.id() {
                debug!(old = %current.id(), new = %link.id(), "replacing session peripheral");
            }
        }
        state.link = Some(link);
    }

    /// Drop the current peripheral reference.
    pub fn clear_link(&self) {
        let mut state = self.shared.lock();
        state.link = None;
        state.connection = ConnectionState::Disconnected;
    }

    /// The current peripheral reference, if any.
    pub fn link(&self) -> Option<Arc<dyn PeripheralLink>> {
        self.shared.lock().link.clone()
    }

    /// Identity of the current peripheral reference, if any.
    pub fn peripheral_id(&self) -> Option<PeripheralId> {
        self.shared.lock().link.as_ref().map(|l| l.id())
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    /// Record that a connect was initiated.
    pub fn mark_connecting(&self) {
        self.shared.lock().connection = ConnectionState::Connecting;
    }

    /// Record that a deliberate disconnect was initiated.
    pub fn mark_disconnecting(&self) {
        self.shared.lock().connection = ConnectionState::Disconnecting;
    }

    /// Register an inline handler for unsolicited updates on
    /// `characteristic`. The handler runs on the callback pump; keep it
    /// cheap.
    pub fn register_macro(&self, characteristic: Uuid, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared
            .lock()
            .macros
            .insert(characteristic, Arc::new(handler));
    }

    /// Whether the radio is powered and the peripheral connected.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.lock();
        state.power.is_powered_on()
            && state.connection == ConnectionState::Connected
            && state.link.is_some()
    }

    /// Run one command against the peripheral.
    ///
    /// `body` registers its pending expectations via [`CommandScope::expect`]
    /// and issues the radio call; `run_command` then blocks until every
    /// registered expectation has been completed by a matching callback, or
    /// `timeout` elapses.
    ///
    /// Fails fast with [`Error::NotReady`] when the radio or peripheral are
    /// not usable and with [`Error::InvalidConfiguration`] when another
    /// command is already pending. The pending set is cleared on every exit
    /// path, so a failed command never wedges the session.
    pub async fn run_command<F, Fut>(&self, operation: &str, timeout: Duration, body: F) -> Result<()>
    where
        F: FnOnce(CommandScope) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let link = {
            let mut state = self.shared.lock();
            if !state.power.is_powered_on() {
                return Err(Error::NotReady("radio not powered on"));
            }
            if state.connection != ConnectionState::Connected {
                return Err(Error::NotReady("peripheral not connected"));
            }
            let Some(link) = state.link.clone() else {
                return Err(Error::NotReady("no peripheral attached"));
            };
            if !state.pending.is_empty() {
                return Err(Error::command_pending(operation));
            }
            state.failure = None;
            link
        };

        let scope = CommandScope {
            shared: Arc::clone(&self.shared),
            link,
        };
        if let Err(err) = body(scope).await {
            self.clear_pending();
            return Err(err);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.shared.lock();
                if state.pending.is_empty() {
                    return match state.failure.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }
            let completed = self.shared.completed.notified();
            if tokio::time::timeout_at(deadline, completed).await.is_err() {
                self.clear_pending();
                return Err(Error::timeout(operation, timeout));
            }
        }
    }

    /// Write `value` to a characteristic and wait for the completion
    /// callback.
    pub async fn write_value(
        &self,
        characteristic: Uuid,
        value: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        self.run_command("write value", timeout, move |scope| async move {
            scope.expect(PendingCommand::WriteValue { characteristic });
            scope
                .link()
                .write_value(characteristic, &value)
                .await
                .map_err(Error::from)
        })
        .await
    }

    /// Enable notifications on a characteristic and wait for the state
    /// change callback.
    pub async fn enable_notifications(&self, characteristic: Uuid, timeout: Duration) -> Result<()> {
        self.run_command("enable notifications", timeout, move |scope| async move {
            scope.expect(PendingCommand::NotificationState { characteristic });
            scope
                .link()
                .set_notify(characteristic, true)
                .await
                .map_err(Error::from)
        })
        .await
    }

    /// Apply the session's peripheral configuration.
    ///
    /// Idempotent against partial prior discovery: only missing services
    /// and characteristics are discovered, and notifications are enabled
    /// only where not already active. Safe to re-run after the peripheral
    /// reference has been swapped.
    pub async fn apply_configuration(&self, timeout: Duration) -> Result<()> {
        let link = self
            .link()
            .ok_or(Error::NotReady("no peripheral attached"))?;
        let config = self.shared.config.clone();

        let known: Vec<Uuid> = link.known_services().iter().map(|s| s.uuid).collect();
        let missing: Vec<Uuid> = config
            .services()
            .iter()
            .map(|s| s.service)
            .filter(|uuid| !known.contains(uuid))
            .collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), "discovering services");
            self.run_command("discover services", timeout, move |scope| async move {
                scope.expect(PendingCommand::DiscoverServices);
                scope
                    .link()
                    .discover_services(&missing)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        }

        for service_config in config.services() {
            let service_uuid = service_config.service;
            let discovered = link.known_services();
            let Some(service) = discovered.iter().find(|s| s.uuid == service_uuid) else {
                return Err(Error::protocol(format!(
                    "service {service_uuid} missing after discovery"
                )));
            };
            let missing: Vec<Uuid> = service_config
                .characteristics
                .iter()
                .copied()
                .filter(|c| !service.characteristics.contains(c))
                .collect();
            if missing.is_empty() {
                continue;
            }
            debug!(service = %service_uuid, count = missing.len(), "discovering characteristics");
            self.run_command("discover characteristics", timeout, move |scope| async move {
                scope.expect(PendingCommand::DiscoverCharacteristics {
                    service: service_uuid,
                });
                scope
                    .link()
                    .discover_characteristics(service_uuid, &missing)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        }

        for service_config in config.services() {
            for &characteristic in &service_config.notifying {
                let discovered = link.known_services();
                let found = discovered
                    .iter()
                    .any(|s| s.characteristics.contains(&characteristic));
                if !found {
                    return Err(Error::unknown_characteristic(characteristic));
                }
                if link.is_notifying(characteristic) {
                    continue;
                }
                self.enable_notifications(characteristic, timeout).await?;
            }
        }

        Ok(())
    }

    /// Feed a radio callback into the session.
    ///
    /// Called from the callback pump. Completion-type events are matched
    /// against the pending set; value updates with no match run a macro
    /// handler inline or, when nothing is pending, are forwarded to the
    /// owner.
    pub fn handle_event(&self, event: &RadioEvent) {
        match event {
            RadioEvent::PowerStateChanged(power) => {
                self.shared.lock().power = *power;
            }
            RadioEvent::Connected { id } if self.is_current(id) => {
                self.shared.lock().connection = ConnectionState::Connected;
            }
            RadioEvent::ConnectFailed { id, .. } | RadioEvent::Disconnected { id, .. }
                if self.is_current(id) =>
            {
                self.shared.lock().connection = ConnectionState::Disconnected;
            }
            RadioEvent::ServicesDiscovered { id, error } if self.is_current(id) => {
                self.complete(error, |p| matches!(p, PendingCommand::DiscoverServices));
            }
            RadioEvent::CharacteristicsDiscovered { id, service, error }
                if self.is_current(id) =>
            {
                self.complete(error, |p| {
                    matches!(p, PendingCommand::DiscoverCharacteristics { service: s } if s == service)
                });
            }
            RadioEvent::NotificationStateChanged {
                id,
                characteristic,
                error,
                ..
            } if self.is_current(id) => {
                self.complete(error, |p| {
                    matches!(p, PendingCommand::NotificationState { characteristic: c } if c == characteristic)
                });
            }
            RadioEvent::ValueWritten {
                id,
                characteristic,
                error,
            } if self.is_current(id) => {
                self.complete(error, |p| {
                    matches!(p, PendingCommand::WriteValue { characteristic: c } if c == characteristic)
                });
            }
            RadioEvent::ValueUpdated {
                id,
                characteristic,
                value,
                error,
            } if self.is_current(id) => {
                self.handle_value_update(*characteristic, value, error);
            }
            _ => {}
        }
    }

    fn is_current(&self, id: &PeripheralId) -> bool {
        self.shared
            .lock()
            .link
            .as_ref()
            .is_some_and(|link| link.id() == *id)
    }

    /// Remove the first pending command `matcher` accepts, record any
    /// native error, and signal the waiter once the pending set is empty.
    fn complete(&self, error: &Option<crate::error::RadioError>, matcher: impl Fn(&PendingCommand) -> bool) {
        let mut state = self.shared.lock();
        let Some(index) = state.pending.iter().position(&matcher) else {
            return;
        };
        state.pending.remove(index);
        if let Some(err) = error {
            state.failure.get_or_insert(Error::Radio(err.clone()));
        }
        if state.pending.is_empty() {
            self.shared.completed.notify_one();
        }
    }

    fn handle_value_update(
        &self,
        characteristic: Uuid,
        value: &Bytes,
        error: &Option<crate::error::RadioError>,
    ) {
        enum Disposition {
            Completed,
            Macro(MacroHandler),
            Forward,
            Drop,
        }

        let disposition = {
            let mut state = self.shared.lock();
            let index = state.pending.iter().position(|p| match p {
                PendingCommand::ValueUpdate {
                    characteristic: c,
                    predicate,
                } if *c == characteristic => {
                    // A native error ends the wait regardless of content.
                    error.is_some() || predicate.as_ref().is_none_or(|pred| pred(value))
                }
                _ => false,
            });
            if let Some(index) = index {
                state.pending.remove(index);
                if let Some(err) = error {
                    state.failure.get_or_insert(Error::Radio(err.clone()));
                }
                if state.pending.is_empty() {
                    self.shared.completed.notify_one();
                }
                Disposition::Completed
            } else if let Some(err) = error {
                warn!(%characteristic, %err, "dropping unsolicited update with error");
                Disposition::Drop
            } else if let Some(handler) = state.macros.get(&characteristic) {
                Disposition::Macro(Arc::clone(handler))
            } else if state.pending.is_empty() {
                Disposition::Forward
            } else {
                Disposition::Drop
            }
        };

        match disposition {
            Disposition::Completed | Disposition::Drop => {}
            // Run outside the lock; handlers may call back into the session.
            Disposition::Macro(handler) => handler(value),
            Disposition::Forward => {
                let _ = self.shared.owner_tx.send(SessionNotification::Update {
                    characteristic,
                    value: value.clone(),
                });
            }
        }
    }

    fn clear_pending(&self) {
        self.shared.lock().pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }
}
