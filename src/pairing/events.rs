//! Pairing lifecycle events.
//!
//! Events are published on a bounded broadcast channel after the state lock
//! is released. Publishing never blocks: with no subscribers the event is
//! dropped, and a subscriber that falls behind sees `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that changed the set of bound devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A pairing code was redeemed and a credential issued.
    DevicePaired {
        device_id: String,
        device_name: String,
        at: DateTime<Utc>,
    },
    /// A device's previous credential was replaced by a new pairing.
    DeviceSuperseded { device_id: String },
    /// A device was evicted to stay under the device ceiling.
    DeviceEvicted {
        device_id: String,
        device_name: String,
    },
    /// A credential was revoked explicitly.
    DeviceRevoked { device_id: String },
}

impl PairingEvent {
    /// Device the event is about.
    pub fn device_id(&self) -> &str {
        match self {
            Self::DevicePaired { device_id, .. }
            | Self::DeviceSuperseded { device_id }
            | Self::DeviceEvicted { device_id, .. }
            | Self::DeviceRevoked { device_id } => device_id,
        }
    }

    /// Whether persisted state is now stale.
    pub fn changes_bindings(&self) -> bool {
        !matches!(self, Self::DeviceSuperseded { .. })
    }
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<PairingEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub(crate) fn emit(&self, event: PairingEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(device_id = event.device_id(), "No pairing event subscribers");
                0
            }
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
