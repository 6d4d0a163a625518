//! The correlator owns a transport and is the only thing writing to it.
//!
//! Commands are queued and put on wire one at a time.
//! A command is in flight until it settles, and only then is the next one written.

use std::{collections::VecDeque, fmt::Display, time::Duration};

use futures::future;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    error::Error,
    events::{Event, EventBus},
    serial::{SerialMessage, TransportEvent, TransportHandle},
};

/// A line exactly like this ends a successful response.
pub const TERMINATOR_DONE: &str = "Done";

/// A line starting like this ends a failed response.
pub const TERMINATOR_ERROR: &str = "Error";

/// Something to put on wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The text, without line terminator.
    pub text: String,

    /// When the command was created.
    pub issued_at: chrono::DateTime<chrono::Utc>,

    /// How long to wait for a terminator once written.
    /// The correlator default is used if not set.
    pub timeout: Option<Duration>,
}

impl Command {
    /// A new command.
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            issued_at: chrono::Utc::now(),
            timeout: None,
        }
    }

    /// Wait at most this long for the terminator.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SerialMessage::from(&self.text))
    }
}

/// What settles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// A `Done` or `Error..` line.
    Terminator,

    /// The write being confirmed.
    Written,
}

#[derive(Debug)]
struct PendingRequest {
    command: Command,
    expect: Expect,
    written: bool,
    deadline: Option<Instant>,
    buffered_lines: Vec<String>,
    responder: oneshot::Sender<Result<Vec<String>, Error>>,
}

impl PendingRequest {
    fn settle(self, result: Result<Vec<String>, Error>) {
        match &result {
            Ok(lines) => debug!(command = %self.command, lines = lines.len(), "Settled ok"),
            Err(e) => debug!(command = %self.command, %e, "Settled with error"),
        }

        if self.responder.send(result).is_err() {
            debug!("Caller left before the command settled");
        }
    }
}

#[derive(Debug)]
enum CorrelatorMessage {
    Enqueue(PendingRequest),
    Shutdown(oneshot::Sender<()>),
}

enum Step {
    Message(Option<CorrelatorMessage>),
    Transport(Option<TransportEvent>),
    Expired,
}

struct Correlator {
    path: String,

    /// `None` once the transport is gone.
    transport: Option<TransportHandle>,

    /// Why the transport is gone.
    absent_reason: String,

    messages: mpsc::UnboundedReceiver<CorrelatorMessage>,
    queue: VecDeque<PendingRequest>,
    in_flight: Option<PendingRequest>,
    bus: EventBus,
    default_timeout: Duration,
}

async fn next_transport_event(transport: &mut Option<TransportHandle>) -> Option<TransportEvent> {
    match transport {
        Some(transport) => transport.next_event().await,
        None => future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

impl Correlator {
    async fn run(&mut self) {
        loop {
            let deadline = self.in_flight.as_ref().and_then(|pending| pending.deadline);

            let step = tokio::select! {
                message = self.messages.recv() => Step::Message(message),
                event = next_transport_event(&mut self.transport) => Step::Transport(event),
                _ = until(deadline) => Step::Expired,
            };

            match step {
                Step::Message(Some(CorrelatorMessage::Enqueue(pending))) => {
                    trace!(command = %pending.command, queued = self.queue.len(), "Enqueued");
                    self.queue.push_back(pending);
                    self.start_next();
                }
                Step::Message(Some(CorrelatorMessage::Shutdown(ack))) => {
                    self.shutdown();
                    let _ = ack.send(());
                    break;
                }
                Step::Message(None) => {
                    self.shutdown();
                    break;
                }
                Step::Transport(Some(event)) => self.handle_transport_event(event),
                Step::Transport(None) => {
                    self.transport_gone("transport task stopped".into());
                }
                Step::Expired => self.expire_in_flight(),
            }
        }

        debug!("Correlator stopped");
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Line(line) => self.handle_line(line),
            TransportEvent::Written(line) => {
                let Some(pending) = self.in_flight.as_mut() else {
                    warn!(%line, "Write confirmed with nothing in flight");
                    return;
                };
                pending.written = true;

                if pending.expect == Expect::Written {
                    self.settle_in_flight(Ok(vec![]));
                }
            }
            TransportEvent::WriteFailed(e) => {
                warn!(%e, "Write failed");
                self.settle_in_flight(Err(Error::TransportAbsent(format!(
                    "{}: {e}",
                    self.path
                ))));
            }
            TransportEvent::Closed(reason) => self.transport_gone(reason),
        }
    }

    fn handle_line(&mut self, line: String) {
        // Observers see every line, whether or not it belongs to a command.
        self.bus.publish(Event::raw_line(Some(&self.path), line.clone()));

        let Some(pending) = self.in_flight.as_mut() else {
            trace!(%line, "Line with nothing in flight");
            return;
        };

        if pending.expect != Expect::Terminator || !pending.written {
            return;
        }

        if line == TERMINATOR_DONE {
            let lines = std::mem::take(&mut pending.buffered_lines);
            self.settle_in_flight(Ok(lines));
        } else if line.starts_with(TERMINATOR_ERROR) {
            let mut lines = std::mem::take(&mut pending.buffered_lines);
            lines.push(line);
            self.settle_in_flight(Err(Error::DeviceError { lines }));
        } else {
            pending.buffered_lines.push(line);
        }
    }

    fn settle_in_flight(&mut self, result: Result<Vec<String>, Error>) {
        if let Some(pending) = self.in_flight.take() {
            pending.settle(result);
        }

        self.start_next();
    }

    fn expire_in_flight(&mut self) {
        let Some(pending) = self.in_flight.as_ref() else {
            return;
        };

        let timeout = pending.command.timeout.unwrap_or(self.default_timeout);
        warn!(command = %pending.command, ?timeout, "No terminator in time");

        self.settle_in_flight(Err(Error::Timeout(timeout.as_millis() as u64)));
    }

    fn start_next(&mut self) {
        while self.in_flight.is_none() {
            let Some(mut pending) = self.queue.pop_front() else {
                return;
            };

            let Some(transport) = &self.transport else {
                pending.settle(Err(Error::TransportAbsent(self.absent_reason.clone())));
                continue;
            };

            debug!(command = %pending.command, "Putting on wire");

            if let Err(e) = transport.write(pending.command.text.clone()) {
                pending.settle(Err(Error::TransportAbsent(format!("{}: {e}", self.path))));
                continue;
            }

            if pending.expect == Expect::Terminator {
                let timeout = pending.command.timeout.unwrap_or(self.default_timeout);
                pending.deadline = Some(Instant::now() + timeout);
            }

            self.in_flight = Some(pending);
        }
    }

    fn reject_all(&mut self, error: Error) {
        for pending in self.in_flight.take().into_iter().chain(self.queue.drain(..)) {
            pending.settle(Err(error.clone()));
        }
    }

    fn transport_gone(&mut self, reason: String) {
        warn!(%reason, "Transport gone");

        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.absent_reason = format!("{}: {reason}", self.path);

        self.reject_all(Error::TransportAbsent(self.absent_reason.clone()));
    }

    fn shutdown(&mut self) {
        info!("Shutting down");

        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.absent_reason = format!("{}: shut down", self.path);

        self.reject_all(Error::ShuttingDown);
    }
}

/// The way to put commands on a transport.
#[derive(Debug, Clone)]
pub struct CorrelatorHandle {
    path: String,
    messages: mpsc::UnboundedSender<CorrelatorMessage>,
}

impl CorrelatorHandle {
    /// Take ownership of the transport and start correlating.
    ///
    /// Raw lines are published on the given bus.
    /// Commands without a timeout of their own get `default_timeout`.
    pub fn new(transport: TransportHandle, bus: EventBus, default_timeout: Duration) -> Self {
        let path = transport.path().to_string();
        Self::spawn(path, Some(transport), String::new(), bus, default_timeout)
    }

    /// A correlator for a transport which could not be opened.
    /// Every request fails fast with [`Error::TransportAbsent`].
    pub fn absent(path: &str, reason: &str, bus: EventBus) -> Self {
        Self::spawn(
            path.to_string(),
            None,
            format!("{path}: {reason}"),
            bus,
            Duration::ZERO,
        )
    }

    fn spawn(
        path: String,
        transport: Option<TransportHandle>,
        absent_reason: String,
        bus: EventBus,
        default_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut correlator = Correlator {
            path: path.clone(),
            transport,
            absent_reason,
            messages: rx,
            queue: VecDeque::new(),
            in_flight: None,
            bus,
            default_timeout,
        };

        let span = info_span!("correlator", %path);
        tokio::spawn(async move { correlator.run().await }.instrument(span));

        Self { path, messages: tx }
    }

    /// The path of the transport.
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn request(&self, command: Command, expect: Expect) -> Result<Vec<String>, Error> {
        let (tx, rx) = oneshot::channel();

        let pending = PendingRequest {
            command,
            expect,
            written: false,
            deadline: None,
            buffered_lines: vec![],
            responder: tx,
        };

        self.messages
            .send(CorrelatorMessage::Enqueue(pending))
            .map_err(|_| Error::ShuttingDown)?;

        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Queue a command and wait for its terminated response.
    ///
    /// Resolves with every line before `Done`.
    /// A line starting with `Error` rejects with [`Error::DeviceError`],
    /// carrying every line up to and including it.
    ///
    /// Dropping the returned future does not take the command out of the queue.
    pub async fn enqueue(&self, command: Command) -> Result<Vec<String>, Error> {
        self.request(command, Expect::Terminator).await
    }

    /// Queue a command which has no terminated response,
    /// and wait until it has been put on wire.
    pub async fn send(&self, command: Command) -> Result<(), Error> {
        self.request(command, Expect::Written).await.map(|_| ())
    }

    /// Reject anything pending with [`Error::ShuttingDown`] and close the transport.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();

        if self.messages.send(CorrelatorMessage::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
