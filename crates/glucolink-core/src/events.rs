//! Delegate interface and event dispatch.
//!
//! The owner of a sensor link supplies a [`SensorLinkDelegate`]. Fire-and-
//! forget events are queued to a dedicated dispatch task so a slow consumer
//! can never stall the protocol engine; the one *query* in the interface
//! ([`SensorLinkDelegate::sensor_discovered_new`]) is awaited inline because
//! it gates engine progress.
//!
//! A broadcast [`LinkEvent`] channel mirrors the fire-and-forget events for
//! passive observers such as the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use glucolink_types::GlucoseReading;

use crate::error::Error;

/// Events emitted by the sensor link.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkEvent {
    /// An authenticated sensor session is up.
    SensorConnected {
        /// Advertised sensor name.
        name: String,
    },
    /// The sensor connection ended.
    SensorDisconnected {
        /// Whether the disconnect looks like the sensor session ending
        /// rather than a transient radio drop.
        suspected_end_of_session: bool,
    },
    /// A link error was surfaced. The link keeps retrying regardless.
    SensorError {
        /// Machine-readable error class.
        kind: String,
        /// Human-readable description.
        detail: String,
    },
    /// A live glucose reading arrived.
    Reading {
        /// The decoded reading.
        reading: GlucoseReading,
    },
    /// A batch of historical readings was flushed.
    Backfill {
        /// Readings in ascending timestamp order.
        readings: Vec<GlucoseReading>,
    },
    /// Connection status changed; query the link for details.
    ConnectionStatusChanged,
}

/// Interface the owning application implements to receive link callbacks.
///
/// All methods except [`sensor_discovered_new`](Self::sensor_discovered_new)
/// default to no-ops.
#[async_trait]
pub trait SensorLinkDelegate: Send + Sync {
    /// An authenticated sensor session is up.
    async fn sensor_connected(&self, name: &str) {
        let _ = name;
    }

    /// The sensor connection ended.
    async fn sensor_disconnected(&self, suspected_end_of_session: bool) {
        let _ = suspected_end_of_session;
    }

    /// A link error was surfaced.
    async fn sensor_error(&self, kind: &str, detail: &str) {
        let _ = (kind, detail);
    }

    /// A live glucose reading arrived.
    async fn sensor_read(&self, reading: GlucoseReading) {
        let _ = reading;
    }

    /// A batch of historical readings was flushed.
    async fn sensor_read_backfill(&self, readings: Vec<GlucoseReading>) {
        let _ = readings;
    }

    /// A sensor the link has never seen produced its first glucose
    /// message. Return `true` to adopt it as "the" sensor; `false` leaves
    /// it unpromoted and scanning continues.
    async fn sensor_discovered_new(&self, name: &str, activated_at: OffsetDateTime) -> bool;

    /// Connection status changed.
    async fn connection_status_changed(&self) {}
}

/// Routes engine output to the delegate task and the broadcast channel.
#[derive(Clone)]
pub struct EventDispatcher {
    delegate: Arc<dyn SensorLinkDelegate>,
    queue: mpsc::UnboundedSender<LinkEvent>,
    broadcast: broadcast::Sender<LinkEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher and spawn its delegate-notification task.
    pub fn new(
        delegate: Arc<dyn SensorLinkDelegate>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let (broadcast, _) = broadcast::channel(capacity);
        let task_delegate = Arc::clone(&delegate);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(task_delegate.as_ref(), event).await;
            }
            debug!("delegate dispatch task finished");
        });
        (
            Self {
                delegate,
                queue,
                broadcast,
            },
            task,
        )
    }

    /// Subscribe to the broadcast mirror of the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.broadcast.subscribe()
    }

    /// Queue a fire-and-forget event for the delegate and broadcast it.
    pub fn emit(&self, event: LinkEvent) {
        // Ignore lagging/absent broadcast receivers.
        let _ = self.broadcast.send(event.clone());
        let _ = self.queue.send(event);
    }

    /// Convenience wrapper for emitting an [`Error`] as an event.
    pub fn emit_error(&self, error: &Error) {
        self.emit(LinkEvent::SensorError {
            kind: error.kind().to_string(),
            detail: error.to_string(),
        });
    }

    /// Ask the owner whether to adopt a newly discovered sensor. Awaited
    /// inline: the answer gates promotion.
    pub async fn ask_new_sensor(&self, name: &str, activated_at: OffsetDateTime) -> bool {
        self.delegate.sensor_discovered_new(name, activated_at).await
    }
}

async fn dispatch(delegate: &dyn SensorLinkDelegate, event: LinkEvent) {
    match event {
        LinkEvent::SensorConnected { name } => delegate.sensor_connected(&name).await,
        LinkEvent::SensorDisconnected {
            suspected_end_of_session,
        } => {
            delegate
                .sensor_disconnected(suspected_end_of_session)
                .await
        }
        LinkEvent::SensorError { kind, detail } => delegate.sensor_error(&kind, &detail).await,
        LinkEvent::Reading { reading } => delegate.sensor_read(reading).await,
        LinkEvent::Backfill { readings } => delegate.sensor_read_backfill(readings).await,
        LinkEvent::ConnectionStatusChanged => delegate.connection_status_changed().await,
    }
}
