//! Keeps barcode scanners open, remembers what they scanned.
//!
//! Each scanner path goes `Closed -> Opening -> Open`, and on failure `Open -> Cooldown`.
//! A periodic ensure tick moves `Closed` and `Cooldown` back to `Opening`,
//! but never more often than the minimum retry interval.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    error::Error,
    events::{Event, EventBus},
    mock::{MockBuilder, MockController},
    serial::{error::SerialPortError, SerialPortBuilder, TransportEvent, TransportHandle},
};

/// How many scans per path are remembered.
pub const RECENT_SCANS: usize = 16;

/// Opens ports for the scanner manager.
pub trait PortOpener: Send + Sync + 'static {
    /// Open the port at the path. Must fail fast.
    fn open(&self, path: &str, baud: u32) -> Result<TransportHandle, SerialPortError>;
}

/// Opens actual serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, path: &str, baud: u32) -> Result<TransportHandle, SerialPortError> {
        SerialPortBuilder::new(path).set_baud(baud).build()
    }
}

#[derive(Debug, Default)]
struct MockPorts {
    plugged: HashSet<String>,
    controllers: HashMap<String, MockController>,
    attempts: usize,
}

/// Opens mock ports, but only those which are "plugged in".
#[derive(Debug, Default, Clone)]
pub struct MockOpener {
    ports: Arc<Mutex<MockPorts>>,
}

impl MockOpener {
    fn ports(&self) -> MutexGuard<'_, MockPorts> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the path openable.
    pub fn plug(&self, path: &str) {
        self.ports().plugged.insert(path.to_string());
    }

    /// Make the path fail to open, and disconnect it if it is open.
    pub fn unplug(&self, path: &str) {
        let mut ports = self.ports();
        ports.plugged.remove(path);

        if let Some(controller) = ports.controllers.remove(path) {
            controller.disconnect();
        }
    }

    /// Drive the device currently opened at the path.
    pub fn controller(&self, path: &str) -> Option<MockController> {
        self.ports().controllers.get(path).cloned()
    }

    /// How many opens were attempted in total.
    pub fn attempts(&self) -> usize {
        self.ports().attempts
    }
}

impl PortOpener for MockOpener {
    fn open(&self, path: &str, _baud: u32) -> Result<TransportHandle, SerialPortError> {
        let mut ports = self.ports();
        ports.attempts += 1;

        if !ports.plugged.contains(path) {
            return Err(SerialPortError::Open {
                path: path.to_string(),
                problem: "not plugged in".into(),
            });
        }

        let (handle, controller) = MockBuilder::new(path).build();
        ports.controllers.insert(path.to_string(), controller);

        Ok(handle)
    }
}

/// A decoded scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastScan {
    /// What was scanned.
    pub code: String,

    /// When.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A snapshot of a scanner's connection state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannerStatus {
    /// The scanner's port.
    pub path: String,

    /// Whether the port is open.
    pub open: bool,

    /// Whether the port failed and waits before being opened again.
    pub in_cooldown: bool,

    /// The earliest time the next open is attempted, if in cooldown.
    pub next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,

    /// The last problem seen.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening,
    Open,
    Cooldown,
}

#[derive(Debug)]
struct ScannerState {
    phase: Phase,
    last_attempt: Option<Instant>,
    next_attempt: Option<Instant>,
    next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    backoff: Duration,
    last_error: Option<String>,
    last_scan: Option<LastScan>,
    recent: VecDeque<LastScan>,
    reader: Option<JoinHandle<()>>,

    // Bumped on each open, so a stale reader does not touch a newer connection's state.
    generation: u64,
}

impl ScannerState {
    fn new(backoff: Duration) -> Self {
        Self {
            phase: Phase::Closed,
            last_attempt: None,
            next_attempt: None,
            next_attempt_at: None,
            backoff,
            last_error: None,
            last_scan: None,
            recent: VecDeque::with_capacity(RECENT_SCANS),
            reader: None,
            generation: 0,
        }
    }

    fn status(&self, path: &str) -> ScannerStatus {
        let in_cooldown = self.phase == Phase::Cooldown;

        ScannerStatus {
            path: path.to_string(),
            open: self.phase == Phase::Open,
            in_cooldown,
            next_attempt_at: if in_cooldown { self.next_attempt_at } else { None },
            last_error: self.last_error.clone(),
        }
    }

    fn cool_down(&mut self, problem: String, max_backoff: Duration) {
        let now = Instant::now();
        let wait = self.backoff;

        self.phase = Phase::Cooldown;
        self.last_error = Some(problem);
        self.next_attempt = Some(now + wait);
        self.next_attempt_at = chrono::Duration::from_std(wait)
            .ok()
            .map(|wait| chrono::Utc::now() + wait);
        self.backoff = (wait * 2).min(max_backoff);
    }

    fn record(&mut self, code: String) {
        let scan = LastScan {
            code,
            timestamp: chrono::Utc::now(),
        };

        if self.recent.len() == RECENT_SCANS {
            self.recent.pop_front();
        }
        self.recent.push_back(scan.clone());
        self.last_scan = Some(scan);
    }
}

/// Manages scanner connections by path.
#[derive(Clone)]
pub struct ScannerManager {
    states: Arc<Mutex<HashMap<String, ScannerState>>>,
    opener: Arc<dyn PortOpener>,
    bus: EventBus,
    retry_interval: Duration,
    max_backoff: Duration,
}

impl Debug for ScannerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerManager")
            .field("retry_interval", &self.retry_interval)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}

impl ScannerManager {
    /// A new manager.
    /// Opens are at least `retry_interval` apart per path; backoff doubles up to `max_backoff`.
    pub fn new(
        opener: Arc<dyn PortOpener>,
        bus: EventBus,
        retry_interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            opener,
            bus,
            retry_interval,
            max_backoff: max_backoff.max(retry_interval),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, ScannerState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the scanner at the path is open, if allowed to try now.
    ///
    /// Does nothing if the scanner is open, or was attempted within the minimum retry interval,
    /// or is cooling down.
    pub fn ensure_scanner_for_path(&self, path: &str, baud: u32) -> ScannerStatus {
        let now = Instant::now();
        let mut states = self.states();
        let state = states
            .entry(path.to_string())
            .or_insert_with(|| ScannerState::new(self.retry_interval));

        let too_soon = state
            .last_attempt
            .map_or(false, |last| now < last + self.retry_interval);
        let cooling = state.next_attempt.map_or(false, |next| now < next);

        match state.phase {
            Phase::Open | Phase::Opening => return state.status(path),
            Phase::Cooldown if cooling => return state.status(path),
            Phase::Closed | Phase::Cooldown if too_soon => return state.status(path),
            Phase::Closed | Phase::Cooldown => {}
        }

        state.phase = Phase::Opening;
        state.last_attempt = Some(now);
        debug!(%path, %baud, "Opening scanner");

        match self.opener.open(path, baud) {
            Ok(transport) => {
                info!(%path, "Scanner open");
                state.phase = Phase::Open;
                state.backoff = self.retry_interval;
                state.last_error = None;
                state.next_attempt = None;
                state.next_attempt_at = None;
                state.generation += 1;

                let reader = self.spawn_reader(path, transport, state.generation);
                if let Some(old) = state.reader.replace(reader) {
                    old.abort();
                }
            }
            Err(e) => {
                warn!(%path, %e, "Could not open scanner");
                state.cool_down(e.to_string(), self.max_backoff);
            }
        }

        state.status(path)
    }

    fn spawn_reader(&self, path: &str, mut transport: TransportHandle, generation: u64) -> JoinHandle<()> {
        let states = Arc::downgrade(&self.states);
        let bus = self.bus.clone();
        let max_backoff = self.max_backoff;
        let owned_path = path.to_string();

        tokio::spawn(
            async move {
                let path = owned_path;

                let reason = loop {
                    match transport.next_event().await {
                        Some(TransportEvent::Line(line)) => {
                            let code = line.trim();
                            if code.is_empty() {
                                continue;
                            }
                            trace!(%code, "Scanned");

                            let Some(states) = states.upgrade() else {
                                break "manager dropped".to_string();
                            };
                            if let Some(state) = states
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .get_mut(&path)
                            {
                                state.record(code.to_string());
                            }

                            bus.publish(Event::Scan {
                                path: Some(path.clone()),
                                code: code.to_string(),
                            });
                        }
                        Some(TransportEvent::Closed(reason)) => break reason,
                        Some(TransportEvent::WriteFailed(e)) => break e.to_string(),
                        Some(TransportEvent::Written(_)) => continue,
                        None => break SerialPortError::Disconnected.to_string(),
                    }
                };

                warn!(%reason, "Scanner connection lost");

                if let Some(states) = states.upgrade() {
                    let mut states = states.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(state) = states.get_mut(&path) {
                        if state.generation == generation && state.phase == Phase::Open {
                            state.reader = None;
                            state.cool_down(reason, max_backoff);
                        }
                    }
                }
            }
            .instrument(info_span!("scanner", %path)),
        )
    }

    /// The status of the scanner at the path.
    pub fn status(&self, path: &str) -> Result<ScannerStatus, Error> {
        self.states()
            .get(path)
            .map(|state| state.status(path))
            .ok_or_else(|| Error::NoSuchScanner(path.to_string()))
    }

    /// The status of all known scanners, by path.
    pub fn status_all(&self) -> Vec<ScannerStatus> {
        let mut statuses = self
            .states()
            .iter()
            .map(|(path, state)| state.status(path))
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.path.cmp(&b.path));

        statuses
    }

    /// Take the most recent scan at the path, if any.
    /// A scan is handed out at most once.
    pub fn get_last_scan_and_clear_for(&self, path: &str) -> Result<Option<LastScan>, Error> {
        self.states()
            .get_mut(path)
            .map(|state| state.last_scan.take())
            .ok_or_else(|| Error::NoSuchScanner(path.to_string()))
    }

    /// The last few scans at the path, oldest first.
    /// Reading these does not clear anything.
    pub fn recent_scans(&self, path: &str) -> Result<Vec<LastScan>, Error> {
        self.states()
            .get(path)
            .map(|state| state.recent.iter().cloned().collect())
            .ok_or_else(|| Error::NoSuchScanner(path.to_string()))
    }

    /// Close the scanner at the path.
    /// The next ensure tick may open it again.
    pub fn close(&self, path: &str) -> Result<(), Error> {
        let mut states = self.states();
        let state = states
            .get_mut(path)
            .ok_or_else(|| Error::NoSuchScanner(path.to_string()))?;

        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        state.phase = Phase::Closed;
        state.next_attempt = None;
        state.next_attempt_at = None;
        info!(%path, "Scanner closed");

        Ok(())
    }

    /// Close every scanner.
    pub fn close_all(&self) {
        let paths = self.states().keys().cloned().collect::<Vec<_>>();

        for path in paths {
            let _ = self.close(&path);
        }
    }

    /// Periodically ensure the given scanners are open, until cancelled.
    pub fn keep_open(
        &self,
        scanners: Vec<(String, u32)>,
        tick: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            for (path, baud) in &scanners {
                                manager.ensure_scanner_for_path(path, *baud);
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }

                debug!("Scanner ensure tick stopped");
            }
            .instrument(info_span!("scanner-ensure")),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PATH: &str = "/dev/ttyScanner";

    fn manager(retry_ms: u64, max_ms: u64) -> (ScannerManager, MockOpener, EventBus) {
        let opener = MockOpener::default();
        let bus = EventBus::default();
        let manager = ScannerManager::new(
            Arc::new(opener.clone()),
            bus.clone(),
            Duration::from_millis(retry_ms),
            Duration::from_millis(max_ms),
        );

        (manager, opener, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_cools_down_and_respects_interval() {
        let (manager, opener, _bus) = manager(2000, 8000);

        let status = manager.ensure_scanner_for_path(PATH, 9600);
        assert!(!status.open);
        assert!(status.in_cooldown);
        assert!(status.last_error.is_some());
        assert!(status.next_attempt_at.is_some());
        assert_eq!(opener.attempts(), 1);

        // Hammering does not reopen.
        for _ in 0..10 {
            manager.ensure_scanner_for_path(PATH, 9600);
        }
        assert_eq!(opener.attempts(), 1);

        opener.plug(PATH);
        tokio::time::advance(Duration::from_millis(2001)).await;

        let status = manager.ensure_scanner_for_path(PATH, 9600);
        assert!(status.open);
        assert!(!status.in_cooldown);
        assert_eq!(status.last_error, None);
        assert_eq!(opener.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let (manager, opener, _bus) = manager(1000, 3000);

        manager.ensure_scanner_for_path(PATH, 9600);
        assert_eq!(opener.attempts(), 1);

        // Second wait is 2s, so 1.5s is too early.
        tokio::time::advance(Duration::from_millis(1001)).await;
        manager.ensure_scanner_for_path(PATH, 9600);
        assert_eq!(opener.attempts(), 2);
        tokio::time::advance(Duration::from_millis(1500)).await;
        manager.ensure_scanner_for_path(PATH, 9600);
        assert_eq!(opener.attempts(), 2);
        tokio::time::advance(Duration::from_millis(501)).await;
        manager.ensure_scanner_for_path(PATH, 9600);
        assert_eq!(opener.attempts(), 3);

        // Capped at 3s from now on.
        for attempts in 4..7 {
            tokio::time::advance(Duration::from_millis(3001)).await;
            manager.ensure_scanner_for_path(PATH, 9600);
            assert_eq!(opener.attempts(), attempts);
        }
    }

    #[tokio::test]
    async fn scans_are_handed_out_once() {
        let (manager, opener, bus) = manager(10, 100);
        let mut events = bus.subscribe();
        opener.plug(PATH);

        assert!(manager.ensure_scanner_for_path(PATH, 9600).open);
        let scanner = opener.controller(PATH).unwrap();

        scanner.inject_many(["  ", " KSSK-0042 "]);
        let event = events.recv().await.unwrap();
        assert_eq!(
            event.inner,
            Event::Scan {
                path: Some(PATH.into()),
                code: "KSSK-0042".into()
            }
        );

        let scan = manager.get_last_scan_and_clear_for(PATH).unwrap().unwrap();
        assert_eq!(scan.code, "KSSK-0042");
        assert_eq!(manager.get_last_scan_and_clear_for(PATH).unwrap(), None);

        assert_eq!(manager.recent_scans(PATH).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ring_keeps_the_latest() {
        let (manager, opener, bus) = manager(10, 100);
        let mut events = bus.subscribe();
        opener.plug(PATH);
        manager.ensure_scanner_for_path(PATH, 9600);

        let codes = (0..20).map(|n| format!("CODE-{n}")).collect::<Vec<_>>();
        opener.controller(PATH).unwrap().inject_many(codes.clone());
        for _ in 0..20 {
            events.recv().await.unwrap();
        }

        let recent = manager
            .recent_scans(PATH)
            .unwrap()
            .into_iter()
            .map(|scan| scan.code)
            .collect::<Vec<_>>();
        assert_eq!(recent, codes[4..].to_vec());
    }

    #[tokio::test]
    async fn unplugged_goes_to_cooldown() {
        let (manager, opener, _bus) = manager(10, 100);
        opener.plug(PATH);
        assert!(manager.ensure_scanner_for_path(PATH, 9600).open);

        opener.unplug(PATH);

        let mut status = manager.status(PATH).unwrap();
        for _ in 0..100 {
            if status.in_cooldown {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = manager.status(PATH).unwrap();
        }

        assert!(status.in_cooldown);
        assert!(!status.open);
        assert_eq!(status.last_error.as_deref(), Some("unplugged"));
    }

    #[tokio::test]
    async fn unknown_and_closed() {
        let (manager, opener, _bus) = manager(10, 100);
        assert_eq!(
            manager.status("/dev/nope").unwrap_err(),
            Error::NoSuchScanner("/dev/nope".into())
        );

        opener.plug(PATH);
        manager.ensure_scanner_for_path(PATH, 9600);
        manager.close(PATH).unwrap();

        let status = manager.status(PATH).unwrap();
        assert!(!status.open);
        assert!(!status.in_cooldown);
        assert_eq!(manager.status_all(), vec![status]);
    }
}
