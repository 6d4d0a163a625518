use std::fmt::Display;

use tokio::{sync::mpsc, task::JoinHandle};

/// Serial port related errors.
pub mod error;

/// The serial port structure.
pub(crate) mod serial_port;

/// Codecs for encoding/decoding messages to/from wire.
pub(crate) mod codecs;

pub use serial_port::SerialPortBuilder;

use self::error::SerialPortError;

/// A line as shown in logs: at most 48 characters, trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMessage(String);

impl<T: AsRef<str>> From<T> for SerialMessage {
    fn from(string_like: T) -> Self {
        Self(string_like.as_ref().into())
    }
}

impl Display for SerialMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.chars().take(48).collect::<String>();

        write!(f, "{}", s.trim())
    }
}

/// What a transport reports, in wire order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A non-empty line arrived.
    Line(String),

    /// This line was put on wire.
    Written(String),

    /// Putting a line on wire failed.
    WriteFailed(SerialPortError),

    /// The transport is gone and will not produce anything more.
    Closed(String),
}

/// The owning side of a line oriented transport, such as a serial port.
///
/// Whoever holds this is the only writer.
#[derive(Debug)]
pub struct TransportHandle {
    pub(crate) path: String,
    pub(crate) writes: mpsc::UnboundedSender<String>,
    pub(crate) events: mpsc::UnboundedReceiver<TransportEvent>,
    pub(crate) task: JoinHandle<()>,
}

impl TransportHandle {
    /// Where this transport is connected.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Ask for a line to be put on wire.
    /// The outcome arrives as [`TransportEvent::Written`] or [`TransportEvent::WriteFailed`].
    pub fn write(&self, line: String) -> Result<(), SerialPortError> {
        self.writes
            .send(line)
            .map_err(|_| SerialPortError::Disconnected)
    }

    /// The next thing that happened on the transport.
    /// `None` means the transport task has stopped.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Stop the transport.
    pub fn close(&self) {
        self.task.abort();
    }
}
