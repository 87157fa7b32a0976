//! Sensor protocol engine.
//!
//! The highest-level state machine of the link: decides when a peripheral
//! becomes "the" sensor, drives the authenticate → enable-control →
//! enable-backfill sequence, buffers and flushes historical records, and
//! emits typed domain events through the [`EventDispatcher`].
//!
//! The engine runs on its own driver task, consuming [`EngineJob`]s queued
//! by the central coordinator's callback pump. That task is the link's
//! dedicated serial execution context: protocol commands are issued from
//! here one at a time, and blocking in
//! [`PeripheralSession::run_command`] never stalls callback delivery.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use glucolink_types::codec::{AuthResponse, BackfillMessage, GlucoseMessage, opcode};
use glucolink_types::types::{GlucoseReading, SensorLifecycleState};
use glucolink_types::uuid::{AUTHENTICATION, BACKFILL, CONTROL};

use crate::cell::SyncCell;
use crate::config::LinkConfig;
use crate::error::Error;
use crate::events::{EventDispatcher, LinkEvent};
use crate::radio::PeripheralId;
use crate::session::{PendingCommand, PeripheralSession};

/// Remembered identity of "the" sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorIdentity {
    /// Advertised sensor name, e.g. `DXCM7A`. The two trailing characters
    /// carry the serial suffix used for re-identification.
    pub name: String,
    /// Last known peripheral identifier, for direct retrieval without a
    /// scan.
    pub peripheral: Option<PeripheralId>,
}

/// Classification of a discovered peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Promote to the session's active peripheral. `identified` is true
    /// when the name matched a remembered identity, so no adoption query
    /// is needed.
    MakeActive {
        /// Whether the peripheral is already known to be "the" sensor.
        identified: bool,
    },
    /// Connect, but do not promote.
    Connect,
    /// Not a sensor of interest.
    Ignore,
}

/// Decide what to do with a discovered (or restored) peripheral.
///
/// A peripheral is provisionally accepted when its advertised name carries
/// the sensor prefix. With no remembered identity, the first match wins;
/// with one, only a name-suffix match is treated as "the" sensor and
/// others are connected without promotion.
pub fn classify_discovery(
    name: Option<&str>,
    remembered: Option<&SensorIdentity>,
    prefix: &str,
) -> Acceptance {
    let Some(name) = name else {
        return Acceptance::Ignore;
    };
    if !name.starts_with(prefix) {
        return Acceptance::Ignore;
    }
    match remembered {
        None => Acceptance::MakeActive { identified: false },
        Some(identity) if name_suffix_matches(name, &identity.name) => {
            Acceptance::MakeActive { identified: true }
        }
        Some(_) => Acceptance::Connect,
    }
}

/// Compare the serial suffix (trailing two characters) of two sensor names.
fn name_suffix_matches(candidate: &str, remembered: &str) -> bool {
    fn tail(name: &str) -> Option<(char, char)> {
        let mut rev = name.chars().rev();
        let last = rev.next()?;
        let second = rev.next()?;
        Some((second, last))
    }
    match (tail(candidate), tail(remembered)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A disconnect is a suspected end of the sensor session only when an
/// authentication handshake was in flight and the peripheral itself ended
/// the connection. Preserved as a heuristic; not validated further.
fn is_suspected_session_end(pending_auth: bool, remote_initiated: bool) -> bool {
    pending_auth && remote_initiated
}

/// Work items queued to the engine driver task.
#[derive(Debug)]
pub(crate) enum EngineJob {
    /// The active peripheral connected: apply configuration and run the
    /// authentication sequence.
    Configure {
        /// Whether the peripheral already matched a remembered identity.
        identified: bool,
    },
    /// Unsolicited control-channel frame.
    ControlNotification(Bytes),
    /// Unsolicited authentication-channel frame.
    AuthNotification(Bytes),
    /// The active peripheral disconnected.
    Disconnected {
        /// Whether the peripheral ended the connection itself.
        remote_initiated: bool,
    },
}

struct EngineState {
    lifecycle: SensorLifecycleState,
    activation: Option<OffsetDateTime>,
    backfill: Vec<BackfillMessage>,
    pending_auth: bool,
    promoted: bool,
}

struct EngineShared {
    state: Mutex<EngineState>,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The protocol engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub(crate) struct Engine {
    session: PeripheralSession,
    dispatcher: EventDispatcher,
    config: LinkConfig,
    remembered: Arc<SyncCell<Option<SensorIdentity>>>,
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine bound to `session` and register its inline backfill
    /// frame handler.
    pub(crate) fn new(
        session: PeripheralSession,
        dispatcher: EventDispatcher,
        config: LinkConfig,
        remembered: Arc<SyncCell<Option<SensorIdentity>>>,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            state: Mutex::new(EngineState {
                lifecycle: SensorLifecycleState::Searching,
                activation: None,
                backfill: Vec::new(),
                pending_auth: false,
                promoted: false,
            }),
        });

        // Backfill frames are cheap to decode and append, so they run
        // inline on the callback pump instead of round-tripping through
        // the driver task.
        let macro_shared = Arc::clone(&shared);
        session.register_macro(BACKFILL, move |value| {
            match BackfillMessage::decode(value) {
                Some(message) => macro_shared.lock().backfill.push(message),
                None => {
                    debug!(len = value.len(), "dropping backfill frame with unexpected length")
                }
            }
        });

        Self {
            session,
            dispatcher,
            config,
            remembered,
            shared,
        }
    }

    /// Current lifecycle state, for status queries.
    pub(crate) fn lifecycle(&self) -> SensorLifecycleState {
        self.shared.lock().lifecycle
    }

    /// Activation instant of the current sensor session, if anchored.
    pub(crate) fn activation(&self) -> Option<OffsetDateTime> {
        self.shared.lock().activation
    }

    /// Drive the engine until the job channel closes.
    pub(crate) async fn run(self, mut jobs: mpsc::UnboundedReceiver<EngineJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                EngineJob::Configure { identified } => {
                    self.shared.lock().promoted = identified;
                    self.configure_and_authenticate().await;
                }
                EngineJob::ControlNotification(value) => {
                    self.on_control_notification(&value).await;
                }
                EngineJob::AuthNotification(value) => {
                    self.on_auth_notification(&value).await;
                }
                EngineJob::Disconnected { remote_initiated } => {
                    self.on_disconnected(remote_initiated);
                }
            }
        }
        debug!("engine driver task finished");
    }

    /// Apply configuration, then run the authentication handshake.
    ///
    /// Failures are surfaced but never terminate the session; the next
    /// trigger retries configuration from scratch.
    async fn configure_and_authenticate(&self) {
        if let Err(err) = self
            .session
            .apply_configuration(self.config.command_timeout)
            .await
        {
            warn!(%err, "configuration failed; will retry on next trigger");
            self.dispatcher.emit_error(&err);
            return;
        }

        self.shared.lock().pending_auth = true;
        if let Err(err) = self
            .session
            .enable_notifications(AUTHENTICATION, self.config.command_timeout)
            .await
        {
            warn!(%err, "enabling auth notifications failed");
            self.dispatcher.emit_error(&err);
            return;
        }

        // The sensor pushes the challenge response on its own cycle; wait
        // for a frame the codec recognizes. Non-matching frames leave the
        // wait pending.
        let captured: Arc<Mutex<Option<AuthResponse>>> = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&captured);
        let wait = self
            .session
            .run_command("await auth response", self.config.auth_timeout, move |scope| async move {
                scope.expect(PendingCommand::ValueUpdate {
                    characteristic: AUTHENTICATION,
                    predicate: Some(Box::new(move |value| match AuthResponse::decode(value) {
                        Some(response) => {
                            *seen.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
                            true
                        }
                        None => {
                            debug!(len = value.len(), "ignoring non-matching auth frame");
                            false
                        }
                    })),
                });
                Ok(())
            })
            .await;

        match wait {
            Ok(()) => {
                let response = captured.lock().unwrap_or_else(|e| e.into_inner()).take();
                self.finish_authentication(response).await;
            }
            Err(err) => {
                // A late response can still complete the handshake through
                // the unsolicited path while pending_auth stays set.
                warn!(%err, "authentication wait failed");
                self.dispatcher.emit_error(&err);
            }
        }
    }

    /// Accept an auth-challenge response as proof of an authenticated,
    /// bonded session and bring up the data channels.
    async fn finish_authentication(&self, response: Option<AuthResponse>) {
        let Some(response) = response else {
            self.dispatcher
                .emit_error(&Error::protocol("auth wait completed without a response"));
            return;
        };
        if !response.authenticated {
            self.dispatcher
                .emit_error(&Error::protocol("sensor refused authentication"));
            return;
        }
        info!(bonded = response.bonded, "sensor link authenticated");
        self.shared.lock().pending_auth = false;

        for characteristic in [CONTROL, BACKFILL] {
            if let Err(err) = self
                .session
                .enable_notifications(characteristic, self.config.command_timeout)
                .await
            {
                warn!(%err, %characteristic, "enabling notifications failed");
                self.dispatcher.emit_error(&err);
                return;
            }
        }

        let name = self.peripheral_name();
        self.dispatcher.emit(LinkEvent::SensorConnected { name });
        self.dispatcher.emit(LinkEvent::ConnectionStatusChanged);
    }

    /// Late or unsolicited authentication frame.
    async fn on_auth_notification(&self, value: &[u8]) {
        if !self.shared.lock().pending_auth {
            debug!("ignoring auth frame outside handshake");
            return;
        }
        match AuthResponse::decode(value) {
            Some(response) => self.finish_authentication(Some(response)).await,
            None => debug!(len = value.len(), "ignoring unparseable auth frame"),
        }
    }

    /// Dispatch a control-channel frame by its leading opcode.
    async fn on_control_notification(&self, value: &[u8]) {
        match value.first().copied() {
            Some(opcode::GLUCOSE) => self.on_glucose_frame(value).await,
            Some(opcode::BACKFILL_FINISHED) => self.flush_backfill(),
            Some(op) => debug!("unhandled control opcode 0x{op:02X}"),
            None => debug!("empty control frame"),
        }
    }

    async fn on_glucose_frame(&self, value: &[u8]) {
        let Some(message) = GlucoseMessage::decode(value) else {
            debug!(len = value.len(), "dropping malformed glucose frame");
            return;
        };

        let (activation, lifecycle_changed, promoted) = {
            let mut state = self.shared.lock();
            // The first live message anchors the session's activation
            // instant; it then stays fixed for the life of the session.
            let activation = *state.activation.get_or_insert_with(|| {
                OffsetDateTime::now_utc()
                    - time::Duration::seconds(i64::from(message.timestamp))
            });
            let lifecycle = message.algorithm_state.lifecycle();
            let changed = state.lifecycle != lifecycle;
            state.lifecycle = lifecycle;
            (activation, changed, state.promoted)
        };

        if !promoted {
            let name = self.peripheral_name();
            let accepted = self.dispatcher.ask_new_sensor(&name, activation).await;
            if !accepted {
                debug!(%name, "owner declined new sensor; leaving unpromoted");
                return;
            }
            let identity = SensorIdentity {
                name: name.clone(),
                peripheral: self.session.peripheral_id(),
            };
            self.remembered.set(Some(identity));
            self.shared.lock().promoted = true;
            info!(%name, "sensor adopted");
        }

        if lifecycle_changed {
            self.dispatcher.emit(LinkEvent::ConnectionStatusChanged);
        }
        if let Some(reading) = message.to_reading(activation) {
            self.dispatcher.emit(LinkEvent::Reading { reading });
        }
    }

    /// Convert the accumulated backfill buffer into a reading batch and
    /// clear it.
    fn flush_backfill(&self) {
        let (messages, activation) = {
            let mut state = self.shared.lock();
            (std::mem::take(&mut state.backfill), state.activation)
        };
        let Some(activation) = activation else {
            warn!(
                dropped = messages.len(),
                "backfill finished before activation was anchored"
            );
            return;
        };
        let mut readings: Vec<GlucoseReading> = messages
            .iter()
            .filter_map(|message| message.to_reading(activation))
            .collect();
        readings.sort_by_key(|reading| reading.timestamp);
        info!(
            received = messages.len(),
            usable = readings.len(),
            "backfill flushed"
        );
        self.dispatcher.emit(LinkEvent::Backfill { readings });
    }

    fn on_disconnected(&self, remote_initiated: bool) {
        let suspected = {
            let mut state = self.shared.lock();
            let suspected = is_suspected_session_end(state.pending_auth, remote_initiated);
            state.pending_auth = false;
            if suspected {
                // The sensor session itself looks over; drop the anchor and
                // let the owner decide whether to forget the identity.
                state.activation = None;
                state.lifecycle = SensorLifecycleState::Searching;
                state.promoted = false;
            }
            suspected
        };
        if suspected {
            info!("suspected end of sensor session");
        }
        self.dispatcher.emit(LinkEvent::SensorDisconnected {
            suspected_end_of_session: suspected,
        });
        self.dispatcher.emit(LinkEvent::ConnectionStatusChanged);
    }

    fn peripheral_name(&self) -> String {
        self.session
            .link()
            .and_then(|link| link.name())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> SensorIdentity {
        SensorIdentity {
            name: name.to_string(),
            peripheral: None,
        }
    }

    #[test]
    fn test_classify_without_remembered_identity() {
        // First seen wins when nothing is remembered.
        assert_eq!(
            classify_discovery(Some("DXCM7A"), None, "DXCM"),
            Acceptance::MakeActive { identified: false }
        );
        assert_eq!(classify_discovery(Some("Thermo X"), None, "DXCM"), Acceptance::Ignore);
        assert_eq!(classify_discovery(None, None, "DXCM"), Acceptance::Ignore);
    }

    #[test]
    fn test_classify_with_remembered_identity() {
        let remembered = identity("DXCM7A");
        assert_eq!(
            classify_discovery(Some("DXCM7A"), Some(&remembered), "DXCM"),
            Acceptance::MakeActive { identified: true }
        );
        // Same prefix, wrong serial suffix: connected but not promoted.
        assert_eq!(
            classify_discovery(Some("DXCM9Q"), Some(&remembered), "DXCM"),
            Acceptance::Connect
        );
        assert_eq!(
            classify_discovery(Some("Other"), Some(&remembered), "DXCM"),
            Acceptance::Ignore
        );
    }

    #[test]
    fn test_suffix_matching_edge_cases() {
        assert!(name_suffix_matches("DXCM7A", "DXCM7A"));
        // Suffix comparison ignores the rest of the name.
        assert!(name_suffix_matches("DXCM-G-7A", "DXCM7A"));
        assert!(!name_suffix_matches("DXCM7B", "DXCM7A"));
        assert!(!name_suffix_matches("A", "DXCM7A"));
    }

    #[test]
    fn test_end_of_session_classification() {
        assert!(is_suspected_session_end(true, true));
        assert!(!is_suspected_session_end(false, true));
        assert!(!is_suspected_session_end(true, false));
        assert!(!is_suspected_session_end(false, false));
    }
}
