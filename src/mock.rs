//! A mock transport, useful to test serial functionality without the actual serial ports.
//!
//! Lines written to it may be looped back, answered by a script,
//! or both. Tests may also inject lines as if the device sent them unprompted,
//! fail writes, or pull the plug.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    mac::MacAddress,
    serial::{error::SerialPortError, TransportEvent, TransportHandle},
};

/// Produces the lines a device answers with, given a line written to it.
pub type MockScript = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// A script imitating the station controller firmware.
///
/// `PING` is answered with `OK`, `BLINK` with `BLINK-OK`, `MONITOR` is echoed,
/// `WELCOME` is answered with `READY <mac>`, and anything else gets `Done`.
pub fn controller_script(mac: MacAddress) -> MockScript {
    Arc::new(move |line: &str| {
        let verb = line.split_whitespace().next().unwrap_or_default();

        match verb.to_ascii_uppercase().as_str() {
            "PING" => vec!["OK".into()],
            "BLINK" => vec!["BLINK-OK".into()],
            "MONITOR" => vec![line.trim().to_string()],
            "WELCOME" => vec![format!("READY {mac}")],
            "" => vec![],
            _ => vec![format!("> {}", line.trim()), "Done".into()],
        }
    })
}

enum MockInput {
    Lines(Vec<String>),
    Disconnect,
}

/// Builder for a mock [`TransportHandle`].
pub struct MockBuilder {
    name: String,
    loopback: bool,
    script: Option<MockScript>,
}

impl Debug for MockBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBuilder")
            .field("name", &self.name)
            .field("loopback", &self.loopback)
            .field("script", &self.script.is_some())
            .finish()
    }
}

impl MockBuilder {
    /// A mock which swallows everything written to it.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            loopback: false,
            script: None,
        }
    }

    /// Emulate a per-line loopback: each written line also arrives from wire.
    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Answer written lines with this script.
    pub fn script(mut self, script: MockScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Start the mock.
    #[must_use]
    pub fn build(self) -> (TransportHandle, MockController) {
        info!(%self.name, "Running mock");

        let (writes_tx, mut writes_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel::<MockInput>();

        // Outsiders may observe what was put on wire from this broadcast.
        let (written_tx, _) = broadcast::channel(1024);
        let written_tx_task = written_tx.clone();

        let fail_next_write = Arc::new(AtomicBool::new(false));
        let fail_next_write_task = fail_next_write.clone();

        let Self {
            name,
            loopback,
            script,
        } = self;

        // The task holds on to an input sender so the input channel
        // stays open even when every controller is dropped.
        let inputs_keepalive = inputs_tx.clone();

        let task = tokio::spawn(
            async move {
                let _inputs_keepalive = inputs_keepalive;

                let reason = loop {
                    tokio::select! {
                        to_write = writes_rx.recv() => {
                            let Some(line) = to_write else {
                                break "owner dropped";
                            };

                            if fail_next_write_task.swap(false, Ordering::SeqCst) {
                                debug!(%line, "Failing write on request");
                                let error = SerialPortError::IO(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "mock write failure",
                                ));
                                let _ = events_tx.send(TransportEvent::WriteFailed(error));
                                continue;
                            }

                            let line = line.trim_end_matches(['\r', '\n']).to_string();
                            trace!(%line, "Put on wire");

                            match written_tx_task.send(line.clone()) {
                                Ok(listeners) => trace!("Broadcasted written line to {listeners} listener(s)"),
                                Err(_) => trace!("Nobody is observing written lines"),
                            }

                            let mut events = vec![TransportEvent::Written(line.clone())];

                            if loopback {
                                events.push(TransportEvent::Line(line.clone()));
                            }

                            if let Some(script) = &script {
                                events.extend(script(&line).into_iter().map(TransportEvent::Line));
                            }

                            if events.into_iter().any(|event| events_tx.send(event).is_err()) {
                                break "owner dropped";
                            }
                        }
                        input = inputs_rx.recv() => {
                            match input {
                                Some(MockInput::Lines(lines)) => {
                                    // Lines with embedded newlines are split, the way a wire would.
                                    let lines = lines
                                        .iter()
                                        .flat_map(|line| line.lines())
                                        .filter(|line| !line.trim().is_empty())
                                        .map(|line| TransportEvent::Line(line.to_string()))
                                        .collect::<Vec<_>>();

                                    if lines.into_iter().any(|event| events_tx.send(event).is_err()) {
                                        break "owner dropped";
                                    }
                                }
                                Some(MockInput::Disconnect) => break "unplugged",
                                None => break "inputs closed",
                            }
                        }
                    }
                };

                warn!(%reason, "Mock transport stopped");
                let _ = events_tx.send(TransportEvent::Closed(reason.to_string()));
            }
            .instrument(info_span!("mock", %name)),
        );

        let handle = TransportHandle {
            path: format!("mock:{name}"),
            writes: writes_tx,
            events: events_rx,
            task,
        };

        let controller = MockController {
            inputs: inputs_tx,
            written: written_tx,
            fail_next_write,
        };

        (handle, controller)
    }
}

/// Drives a mock transport from the device side.
#[derive(Debug, Clone)]
pub struct MockController {
    inputs: mpsc::UnboundedSender<MockInput>,
    written: broadcast::Sender<String>,
    fail_next_write: Arc<AtomicBool>,
}

impl MockController {
    /// Make the device send a line.
    pub fn inject<S: Into<String>>(&self, line: S) {
        self.inject_many([line]);
    }

    /// Make the device send several lines, back to back.
    pub fn inject_many<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines.into_iter().map(Into::into).collect();
        if self.inputs.send(MockInput::Lines(lines)).is_err() {
            warn!("Mock is gone, injected lines are lost");
        }
    }

    /// The next write will fail.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Simulate the device being unplugged.
    pub fn disconnect(&self) {
        let _ = self.inputs.send(MockInput::Disconnect);
    }

    /// Observe lines put on wire, from now on.
    pub fn written(&self) -> broadcast::Receiver<String> {
        self.written.subscribe()
    }
}
