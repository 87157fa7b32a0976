//! Integration tests for the sensor link engine, driven end-to-end through
//! the mock radio. No BLE hardware required.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use glucolink_core::config::LinkConfig;
use glucolink_core::engine::SensorIdentity;
use glucolink_core::error::Error;
use glucolink_core::mock::{MockPeripheral, MockRadio};
use glucolink_core::radio::{CentralRadio, PeripheralLink, PowerState, RadioEvent};
use glucolink_core::session::{ConnectionState, PendingCommand, PeripheralSession};
use glucolink_core::{CentralCoordinator, PeripheralConfiguration, SensorLinkDelegate};
use glucolink_types::GlucoseReading;
use glucolink_types::uuid::{AUTHENTICATION, BACKFILL, CONTROL};

/// Delegate that records everything it is told.
struct RecordingDelegate {
    accept: AtomicBool,
    connected: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<bool>>,
    errors: Mutex<Vec<String>>,
    readings: Mutex<Vec<GlucoseReading>>,
    backfills: Mutex<Vec<Vec<GlucoseReading>>>,
    queries: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            accept: AtomicBool::new(accept),
            connected: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            readings: Mutex::new(Vec::new()),
            backfills: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn reading_values(&self) -> Vec<u16> {
        self.readings.lock().unwrap().iter().map(|r| r.value).collect()
    }
}

#[async_trait]
impl SensorLinkDelegate for RecordingDelegate {
    async fn sensor_connected(&self, name: &str) {
        self.connected.lock().unwrap().push(name.to_string());
    }

    async fn sensor_disconnected(&self, suspected_end_of_session: bool) {
        self.disconnects.lock().unwrap().push(suspected_end_of_session);
    }

    async fn sensor_error(&self, kind: &str, _detail: &str) {
        self.errors.lock().unwrap().push(kind.to_string());
    }

    async fn sensor_read(&self, reading: GlucoseReading) {
        self.readings.lock().unwrap().push(reading);
    }

    async fn sensor_read_backfill(&self, readings: Vec<GlucoseReading>) {
        self.backfills.lock().unwrap().push(readings);
    }

    async fn sensor_discovered_new(&self, name: &str, _activated_at: OffsetDateTime) -> bool {
        self.queries.lock().unwrap().push(name.to_string());
        self.accept.load(Ordering::SeqCst)
    }
}

/// Poll until `condition` holds; panics after five (virtual) seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

fn test_config() -> LinkConfig {
    LinkConfig::default()
        .command_timeout(Duration::from_millis(200))
        .auth_timeout(Duration::from_millis(500))
        .reconnect_delay(Duration::from_millis(300))
}

fn glucose_frame(timestamp: u32, sequence: u16, glucose: u16, state: u8, trend: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 19];
    frame[0] = 0x4E;
    frame[2..6].copy_from_slice(&timestamp.to_le_bytes());
    frame[6..8].copy_from_slice(&sequence.to_le_bytes());
    frame[10..12].copy_from_slice(&5u16.to_le_bytes());
    frame[12..14].copy_from_slice(&glucose.to_le_bytes());
    frame[14] = state;
    frame[15] = trend;
    frame[16] = 0xFF;
    frame[17] = 0xFF;
    frame[18] = 0x0E;
    frame
}

fn backfill_frame(timestamp: u32, glucose: u16, state: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 9];
    frame[0..4].copy_from_slice(&timestamp.to_le_bytes());
    frame[4..6].copy_from_slice(&glucose.to_le_bytes());
    frame[6] = state;
    frame[8] = 0x7F;
    frame
}

/// Wire a standalone session to a mock radio: events flow from the radio's
/// channel into the session's completion matching, as the coordinator's
/// pump would do.
async fn session_with_pump(
    radio: &MockRadio,
    peripheral: &Arc<MockPeripheral>,
) -> PeripheralSession {
    let (owner_tx, _owner_rx) = mpsc::unbounded_channel();
    let session = PeripheralSession::new(PeripheralConfiguration::sensor_default(), owner_tx);
    let (radio_tx, mut radio_rx) = mpsc::unbounded_channel::<RadioEvent>();
    radio.register(peripheral);
    radio.attach(radio_tx).await.unwrap();
    let pump_session = session.clone();
    tokio::spawn(async move {
        while let Some(event) = radio_rx.recv().await {
            pump_session.handle_event(&event);
        }
    });
    session
}

// --- Command synchronization ---

#[tokio::test(start_paused = true)]
async fn test_command_timeout_leaves_session_usable() {
    let radio = MockRadio::new();
    // A peripheral that never delivers completion callbacks.
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .silent()
        .build();
    let session = session_with_pump(&radio, &peripheral).await;
    radio.set_power(PowerState::PoweredOn);
    session.swap_link(peripheral.clone());
    session.mark_connecting();
    radio.connect(&(peripheral.clone() as _)).await.unwrap();
    wait_until("connected", || {
        session.connection_state() == ConnectionState::Connected
    })
    .await;

    let started = tokio::time::Instant::now();
    let result = session
        .run_command("enable notifications", Duration::from_millis(50), |scope| async move {
            scope.expect(PendingCommand::NotificationState {
                characteristic: CONTROL,
            });
            scope
                .link()
                .set_notify(CONTROL, true)
                .await
                .map_err(Error::from)
        })
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));

    // The pending set was cleared on timeout, so the next command is not
    // rejected as reentrant.
    let result = session
        .run_command("second command", Duration::from_millis(50), |scope| async move {
            scope.expect(PendingCommand::NotificationState {
                characteristic: AUTHENTICATION,
            });
            scope
                .link()
                .set_notify(AUTHENTICATION, true)
                .await
                .map_err(Error::from)
        })
        .await;
    assert!(
        matches!(result, Err(Error::Timeout { .. })),
        "second command must time out, not be rejected as reentrant"
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_command_completes_on_callback() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let session = session_with_pump(&radio, &peripheral).await;
    radio.set_power(PowerState::PoweredOn);
    session.swap_link(peripheral.clone());
    session.mark_connecting();
    radio.connect(&(peripheral.clone() as _)).await.unwrap();
    wait_until("connected", || {
        session.connection_state() == ConnectionState::Connected
    })
    .await;

    session
        .write_value(CONTROL, vec![0x01, 0x02], Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(peripheral.writes(), [(CONTROL, vec![0x01, 0x02])]);
}

#[tokio::test(start_paused = true)]
async fn test_reconfiguration_is_idempotent() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let session = session_with_pump(&radio, &peripheral).await;
    radio.set_power(PowerState::PoweredOn);
    session.swap_link(peripheral.clone());
    session.mark_connecting();
    radio.connect(&(peripheral.clone() as _)).await.unwrap();
    wait_until("connected", || {
        session.connection_state() == ConnectionState::Connected
    })
    .await;

    session
        .apply_configuration(Duration::from_millis(200))
        .await
        .unwrap();
    let commands_after_first = peripheral.command_count();
    assert!(commands_after_first > 0);

    // Everything is already discovered and notifying; the second pass must
    // issue no radio commands at all.
    session
        .apply_configuration(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(peripheral.command_count(), commands_after_first);
}

// --- Full protocol flow ---

/// Bring a coordinator up to the authenticated state against `peripheral`.
async fn connect_and_authenticate(
    radio: &MockRadio,
    peripheral: &Arc<MockPeripheral>,
    delegate: &Arc<RecordingDelegate>,
    remembered: Option<SensorIdentity>,
) -> CentralCoordinator {
    radio.register(peripheral);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(delegate) as _,
        test_config(),
        remembered,
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    wait_until("scanning", || radio.is_scanning()).await;
    radio.advertise(peripheral);

    // Wait for the engine to subscribe to the auth characteristic, then
    // deliver the challenge response.
    let auth_peripheral = Arc::clone(peripheral);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;
    peripheral.notify_value(AUTHENTICATION, vec![0x05, 0x01, 0x01]);

    let connected_delegate = Arc::clone(delegate);
    wait_until("sensor connected", move || {
        !connected_delegate.connected.lock().unwrap().is_empty()
    })
    .await;
    link
}

#[tokio::test(start_paused = true)]
async fn test_discovery_auth_and_live_readings() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(true);
    let link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;

    // Scanning stopped once the peripheral connected.
    assert!(!radio.is_scanning());
    assert_eq!(
        delegate.connected.lock().unwrap().as_slice(),
        ["DXCM7A".to_string()]
    );
    assert!(peripheral.is_notifying(CONTROL));
    assert!(peripheral.is_notifying(BACKFILL));

    // First live message: adoption query, activation anchor, reading.
    peripheral.notify_value(CONTROL, glucose_frame(2005, 9, 97, 0x06, 0x7F));
    let query_delegate = Arc::clone(&delegate);
    wait_until("adoption query", move || {
        !query_delegate.queries.lock().unwrap().is_empty()
    })
    .await;
    let reading_delegate = Arc::clone(&delegate);
    wait_until("first reading", move || {
        !reading_delegate.readings.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(delegate.queries.lock().unwrap().as_slice(), ["DXCM7A"]);
    assert_eq!(delegate.reading_values(), [97]);

    let remembered = link.remembered_sensor().expect("sensor adopted");
    assert_eq!(remembered.name, "DXCM7A");
    assert_eq!(remembered.peripheral, Some(peripheral.id()));
    assert_eq!(link.active_peripheral(), Some(peripheral.id()));

    // A later message does not re-anchor activation or re-query the owner.
    peripheral.notify_value(CONTROL, glucose_frame(2305, 10, 104, 0x06, 0x01));
    let reading_delegate = Arc::clone(&delegate);
    wait_until("second reading", move || {
        reading_delegate.readings.lock().unwrap().len() == 2
    })
    .await;
    assert_eq!(delegate.queries.lock().unwrap().len(), 1);

    let readings = delegate.readings.lock().unwrap().clone();
    assert_eq!(
        readings[1].timestamp - readings[0].timestamp,
        time::Duration::seconds(300)
    );
}

#[tokio::test(start_paused = true)]
async fn test_backfill_flush_filters_and_orders() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(true);
    let _link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;

    // Anchor activation with a live message first.
    peripheral.notify_value(CONTROL, glucose_frame(2005, 9, 97, 0x06, 0x7F));
    let reading_delegate = Arc::clone(&delegate);
    wait_until("live reading", move || {
        !reading_delegate.readings.lock().unwrap().is_empty()
    })
    .await;

    // Out-of-order backfill, one record unreliable, one runt frame.
    peripheral.notify_value(BACKFILL, backfill_frame(300, 110, 0x06));
    peripheral.notify_value(BACKFILL, backfill_frame(100, 100, 0x06));
    peripheral.notify_value(BACKFILL, backfill_frame(200, 105, 0x02));
    peripheral.notify_value(BACKFILL, vec![0u8; 10]);
    peripheral.notify_value(CONTROL, vec![0x59]);

    let backfill_delegate = Arc::clone(&delegate);
    wait_until("backfill flush", move || {
        !backfill_delegate.backfills.lock().unwrap().is_empty()
    })
    .await;

    let batches = delegate.backfills.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    // The warming-up record is filtered out; the rest come back in
    // ascending timestamp order regardless of arrival order.
    assert_eq!(batch.iter().map(|r| r.value).collect::<Vec<_>>(), [100, 110]);
    assert!(batch[0].timestamp < batch[1].timestamp);
    assert_eq!(
        batch[1].timestamp - batch[0].timestamp,
        time::Duration::seconds(200)
    );

    // The buffer was cleared: a second finish signal flushes nothing new.
    peripheral.notify_value(CONTROL, vec![0x59]);
    let backfill_delegate = Arc::clone(&delegate);
    wait_until("second flush", move || {
        backfill_delegate.backfills.lock().unwrap().len() == 2
    })
    .await;
    assert!(delegate.backfills.lock().unwrap()[1].is_empty());
}

// --- Disconnect classification ---

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect_during_auth_is_suspected_session_end() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    radio.register(&peripheral);
    let delegate = RecordingDelegate::new(true);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(&delegate) as _,
        test_config(),
        None,
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    wait_until("scanning", || radio.is_scanning()).await;
    radio.advertise(&peripheral);
    let auth_peripheral = Arc::clone(&peripheral);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;

    // No auth response ever arrives; the handshake is still in flight when
    // the peripheral drops the connection itself.
    radio.remote_disconnect(&peripheral);
    let disconnect_delegate = Arc::clone(&delegate);
    wait_until("disconnect report", move || {
        !disconnect_delegate.disconnects.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(delegate.disconnects.lock().unwrap().as_slice(), [true]);

    // The owner decides whether to forget the identity; nothing was
    // adopted here anyway.
    assert_eq!(link.remembered_sensor(), None);
}

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect_after_auth_is_not_session_end() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(true);
    let _link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;

    radio.remote_disconnect(&peripheral);
    let disconnect_delegate = Arc::clone(&delegate);
    wait_until("disconnect report", move || {
        !disconnect_delegate.disconnects.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(delegate.disconnects.lock().unwrap().as_slice(), [false]);
}

#[tokio::test(start_paused = true)]
async fn test_local_error_disconnect_surfaces_connection_error() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(true);
    let _link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;

    radio.drop_connection(&peripheral, "connection interval elapsed");
    let disconnect_delegate = Arc::clone(&delegate);
    wait_until("disconnect report", move || {
        !disconnect_delegate.disconnects.lock().unwrap().is_empty()
    })
    .await;
    // Not remote-initiated: not a suspected session end, and the native
    // error is surfaced as a connection error.
    assert_eq!(delegate.disconnects.lock().unwrap().as_slice(), [false]);
    assert!(delegate.errors.lock().unwrap().iter().any(|k| k == "radio"));
}

#[tokio::test(start_paused = true)]
async fn test_scanning_resumes_after_disconnect() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(true);
    let _link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;
    assert_eq!(radio.scan_starts(), 1);

    radio.remote_disconnect(&peripheral);
    // Rescan happens only after the settle delay.
    wait_until("rescan", || radio.scan_starts() >= 2).await;
    assert!(radio.is_scanning());
}

// --- Acceptance policy ---

#[tokio::test(start_paused = true)]
async fn test_remembered_identity_gates_promotion() {
    let radio = MockRadio::new();
    let wrong = MockPeripheral::builder("P-other")
        .name("DXCM9Q")
        .sensor_profile()
        .build();
    let ours = MockPeripheral::builder("P-ours")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    radio.register(&wrong);
    radio.register(&ours);
    let delegate = RecordingDelegate::new(true);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(&delegate) as _,
        test_config(),
        Some(SensorIdentity {
            name: "DXCM7A".to_string(),
            peripheral: None,
        }),
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    wait_until("scanning", || radio.is_scanning()).await;

    // Prefix matches but the serial suffix does not: connected, never
    // promoted.
    radio.advertise(&wrong);
    let wrong_peripheral = Arc::clone(&wrong);
    wait_until("candidate connected", move || wrong_peripheral.is_connected()).await;
    assert_eq!(link.active_peripheral(), None);
    assert!(radio.is_scanning());

    // The suffix match is "the" sensor, promoted without an adoption
    // query.
    radio.advertise(&ours);
    let auth_peripheral = Arc::clone(&ours);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;
    ours.notify_value(AUTHENTICATION, vec![0x05, 0x01, 0x01]);
    let connected_delegate = Arc::clone(&delegate);
    wait_until("sensor connected", move || {
        !connected_delegate.connected.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(link.active_peripheral(), Some(ours.id()));

    ours.notify_value(CONTROL, glucose_frame(2005, 9, 97, 0x06, 0x7F));
    let reading_delegate = Arc::clone(&delegate);
    wait_until("reading", move || {
        !reading_delegate.readings.lock().unwrap().is_empty()
    })
    .await;
    // An identified sensor is never re-queried.
    assert!(delegate.queries.lock().unwrap().is_empty());
    // The retrieval identity was refreshed on promotion.
    assert_eq!(
        link.remembered_sensor().unwrap().peripheral,
        Some(ours.id())
    );
}

#[tokio::test(start_paused = true)]
async fn test_owner_can_decline_new_sensor() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    let delegate = RecordingDelegate::new(false);
    let link = connect_and_authenticate(&radio, &peripheral, &delegate, None).await;

    peripheral.notify_value(CONTROL, glucose_frame(2005, 9, 97, 0x06, 0x7F));
    let query_delegate = Arc::clone(&delegate);
    wait_until("adoption query", move || {
        !query_delegate.queries.lock().unwrap().is_empty()
    })
    .await;

    // Declined: no reading, no remembered identity.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(delegate.readings.lock().unwrap().is_empty());
    assert_eq!(link.remembered_sensor(), None);
}

#[tokio::test(start_paused = true)]
async fn test_bonded_peripheral_retrieved_without_scan() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    radio.register(&peripheral);
    radio.mark_bonded(&peripheral);
    let delegate = RecordingDelegate::new(true);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(&delegate) as _,
        test_config(),
        Some(SensorIdentity {
            name: "DXCM7A".to_string(),
            peripheral: Some(peripheral.id()),
        }),
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    let auth_peripheral = Arc::clone(&peripheral);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;
    // Direct retrieval: no scan was ever needed.
    assert_eq!(radio.scan_starts(), 0);
    assert_eq!(link.active_peripheral(), Some(peripheral.id()));
}

#[tokio::test(start_paused = true)]
async fn test_system_connected_peripheral_found_without_scan() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    radio.register(&peripheral);
    radio.mark_system_connected(&peripheral);
    let delegate = RecordingDelegate::new(true);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(&delegate) as _,
        test_config(),
        None,
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    // The already-connected peripheral satisfies acquisition before any
    // scan is started.
    let auth_peripheral = Arc::clone(&peripheral);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;
    assert_eq!(radio.scan_starts(), 0);
    assert_eq!(link.active_peripheral(), Some(peripheral.id()));
}

#[tokio::test(start_paused = true)]
async fn test_restored_peripheral_runs_acceptance_policy() {
    let radio = MockRadio::new();
    let peripheral = MockPeripheral::builder("P1")
        .name("DXCM7A")
        .sensor_profile()
        .build();
    radio.register(&peripheral);
    let delegate = RecordingDelegate::new(true);
    let link = CentralCoordinator::start(
        Arc::new(radio.clone()),
        Arc::clone(&delegate) as _,
        test_config(),
        None,
    )
    .await
    .unwrap();

    radio.set_power(PowerState::PoweredOn);
    // The OS hands back a previously-connected peripheral on relaunch; it
    // is treated exactly like a fresh discovery.
    radio.restore(&[Arc::clone(&peripheral)]);
    let auth_peripheral = Arc::clone(&peripheral);
    wait_until("auth subscription", move || {
        auth_peripheral.is_notifying(AUTHENTICATION)
    })
    .await;
    assert_eq!(link.active_peripheral(), Some(peripheral.id()));
}
