use std::{
    fmt::Display,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::serial::SerialMessage;

/// A serial device as seen by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Where the device can be opened, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,

    /// USB vendor id, if a USB device.
    pub vid: Option<u16>,

    /// USB product id, if a USB device.
    pub pid: Option<u16>,

    /// Reported serial number.
    pub serial_number: Option<String>,

    /// Reported manufacturer.
    pub manufacturer: Option<String>,

    /// Reported product.
    pub product: Option<String>,
}

impl DeviceInfo {
    /// A mock device, which has nothing but a path.
    pub fn mock(path: &str) -> Self {
        Self {
            path: path.to_string(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<serialport::SerialPortInfo> for DeviceInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => Self {
                path: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self {
                path: info.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        }
    }
}

/// Events published on the [`EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// A line arrived from a serial port.
    RawLine {
        /// The port it arrived on.
        path: Option<String>,

        /// The line, without its line terminator.
        text: String,
    },

    /// A scanner decoded a code.
    Scan {
        /// The scanner's port.
        path: Option<String>,

        /// The decoded code.
        code: String,
    },

    /// The known serial devices changed.
    DeviceList {
        /// All currently known devices.
        devices: Vec<DeviceInfo>,
    },

    /// The outcome of pinging the controller.
    EspPingResult {
        /// Whether the controller answered.
        ok: bool,

        /// The answer, if any.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        raw: Option<String>,

        /// The failure condition, if any.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
}

impl Event {
    /// A raw line event.
    pub fn raw_line<S: Into<String>>(path: Option<&str>, text: S) -> Self {
        Self::RawLine {
            path: path.map(Into::into),
            text: text.into(),
        }
    }

    /// Attempt to view the event as a raw line.
    pub fn as_raw_line(&self) -> Option<&str> {
        if let Self::RawLine { text, .. } = self {
            Some(text)
        } else {
            None
        }
    }

    /// An example of a raw line event.
    pub fn example_raw_line() -> Self {
        Self::raw_line(Some("/dev/ttyUSB0"), "HELLO AA:BB:CC:DD:EE:FF")
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::RawLine { path, text } => {
                write!(f, "line from {}: {}", path.as_deref().unwrap_or("?"), SerialMessage::from(text))
            }
            Event::Scan { path, code } => {
                write!(f, "scan from {}: {code}", path.as_deref().unwrap_or("?"))
            }
            Event::DeviceList { devices } => write!(
                f,
                "devices: [{}]",
                devices.iter().map(|device| &device.path).join(", ")
            ),
            Event::EspPingResult { ok, .. } => write!(f, "ping ok: {ok}"),
        }
    }
}

/// An event and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampedEvent {
    /// The event.
    #[serde(flatten)]
    pub inner: Event,

    /// When the event happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TimestampedEvent {
    /// Stamp an event with the current time.
    pub fn now(event: Event) -> Self {
        Self {
            inner: event,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Serialize as a single line of json.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Events should serialize")
    }
}

impl Display for TimestampedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriberId(Uuid);

#[derive(Debug, Default)]
struct Subscribers {
    // Registration order is delivery order.
    list: Vec<(SubscriberId, mpsc::Sender<TimestampedEvent>)>,
    dropped: u64,
}

impl Subscribers {
    fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.list.len();
        self.list.retain(|(other, _)| *other != id);
        before != self.list.len()
    }
}

/// An in-process publish/subscribe register.
///
/// Publishing fans out synchronously to a snapshot of the current subscribers,
/// in the order they subscribed, before returning.
/// A subscriber whose queue is full misses that event, and a subscriber which
/// has gone away is pruned. Neither affects delivery to the others.
///
/// Once [closed](EventBus::close), every subscription ends after what it already received.
#[derive(Debug, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    capacity: usize,
    closed: CancellationToken,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a bus where each subscriber may have at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            capacity: capacity.max(1),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber.
    /// It sees every event published after this call returns.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = SubscriberId(Uuid::new_v4());

        let mut subscribers = self.lock();

        // Checked under the lock, so a concurrent close can not miss this one.
        let registered = !self.closed.is_cancelled();
        if registered {
            subscribers.list.push((id, tx));
            trace!(count = subscribers.list.len(), "Subscribed");
        } else {
            debug!("Subscribed to a closed bus");
        }

        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.subscribers),
            registered,
        }
    }

    /// End every subscription, now and in the future.
    /// Subscribers still get what was published before this call.
    pub fn close(&self) {
        let gone = {
            let mut subscribers = self.lock();
            self.closed.cancel();
            std::mem::take(&mut subscribers.list)
        };

        debug!(subscribers = gone.len(), "Event bus closed");
    }

    /// Whether [`EventBus::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the bus is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Publish an event to all current subscribers.
    /// Returns how many subscribers it was delivered to.
    pub fn publish(&self, event: Event) -> usize {
        let event = TimestampedEvent::now(event);
        trace!(%event, "Publishing");

        let snapshot = self.lock().list.clone();

        let mut delivered = 0;
        let mut dropped = 0;
        let mut gone = vec![];

        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber is not keeping up, event dropped for it");
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if dropped > 0 || !gone.is_empty() {
            let mut subscribers = self.lock();
            subscribers.dropped += dropped;
            for id in gone {
                debug!("Pruning closed subscriber");
                subscribers.remove(id);
            }
        }

        delivered
    }

    /// How many subscribers are registered.
    pub fn subscriber_count(&self) -> usize {
        self.lock().list.len()
    }

    /// How many events were dropped because a subscriber was full, in total.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

/// A registration with the [`EventBus`].
///
/// Unregisters exactly once: either via [`Subscription::unsubscribe`] or on drop.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<TimestampedEvent>,
    bus: Weak<Mutex<Subscribers>>,
    registered: bool,
}

impl Subscription {
    /// Wait for the next event.
    /// Returns `None` if the bus is gone and everything has been read.
    pub async fn recv(&mut self) -> Option<TimestampedEvent> {
        self.receiver.recv().await
    }

    /// Get the next event if there is one.
    pub fn try_recv(&mut self) -> Option<TimestampedEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Stop receiving events.
    /// Returns whether this call was the one that removed the registration.
    pub fn unsubscribe(mut self) -> bool {
        self.unregister()
    }

    fn unregister(&mut self) -> bool {
        if !std::mem::take(&mut self.registered) {
            return false;
        }

        self.receiver.close();

        match self.bus.upgrade() {
            Some(subscribers) => subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
