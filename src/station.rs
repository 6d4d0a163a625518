//! The station service: one controller, some scanners, the lock store, and the bus between them.
//!
//! Constructed once at start-up and shared by handle. [`Station::shutdown`] stops background work,
//! rejects pending controller commands and closes every port.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::{Config, ControllerEndpoint, LockStoreConfig},
    correlator::{Command, CorrelatorHandle},
    error::Error,
    events::{DeviceInfo, Event, EventBus},
    lock::{LockManager, LockStore, MemoryLockStore, RedisLockStore},
    mac::MacAddress,
    mock::{controller_script, MockBuilder, MockController},
    scanner::{PortOpener, ScannerManager, SerialOpener},
    serial::{serial_port::available_ports, SerialPortBuilder, TransportHandle},
    waiter::{LineMatcher, Waiter},
};

/// The MAC a mock controller reports as its own.
pub const MOCK_CONTROLLER_MAC: &str = "02:00:00:00:00:01";

/// A board which announced itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discovery {
    /// The board's MAC.
    pub mac: MacAddress,

    /// Where it came from and what it said, e.g. `serial:HELLO AA:BB:CC:DD:EE:FF`.
    pub raw: String,
}

fn normalized(line: &str) -> String {
    line.split_whitespace().join(" ").to_ascii_uppercase()
}

#[derive(Debug)]
struct StationInner {
    config: Config,
    bus: EventBus,
    correlator: CorrelatorHandle,
    scanners: ScannerManager,
    locks: LockManager,
    mock: Option<MockController>,
    devices: Mutex<Vec<DeviceInfo>>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle to the station service.
#[derive(Debug, Clone)]
pub struct Station {
    inner: Arc<StationInner>,
}

impl Station {
    /// Open the configured controller and lock store, then start background work.
    ///
    /// A controller which can not be opened is not fatal; controller operations
    /// then report it as not present. An unreachable lock store is fatal.
    pub async fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let store: Arc<dyn LockStore> = match &config.lock_store {
            LockStoreConfig::Redis { url } => Arc::new(RedisLockStore::connect(url).await?),
            LockStoreConfig::Memory => Arc::new(MemoryLockStore::default()),
        };

        let (controller, mock) = match &config.controller {
            Some(ControllerEndpoint::Tty { path, baud }) => {
                let transport = SerialPortBuilder::new(path)
                    .set_baud(*baud)
                    .build()
                    .map_err(|e| e.to_string());
                (transport, None)
            }
            Some(ControllerEndpoint::Mock(name)) => {
                let mac = MacAddress::parse(MOCK_CONTROLLER_MAC)?;
                let (transport, controller) = MockBuilder::new(name)
                    .script(controller_script(mac))
                    .build();
                (Ok(transport), Some(controller))
            }
            None => (Err("no controller configured".to_string()), None),
        };

        let station = Self::build(config, controller, store, Arc::new(SerialOpener), mock);
        station.start_background();

        Ok(station)
    }

    /// Put a station together from already opened parts.
    /// No background work is started, see [`Station::start_background`].
    pub fn assemble(
        config: Config,
        controller: Result<TransportHandle, String>,
        lock_store: Arc<dyn LockStore>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        Self::build(config, controller, lock_store, opener, None)
    }

    fn build(
        config: Config,
        controller: Result<TransportHandle, String>,
        lock_store: Arc<dyn LockStore>,
        opener: Arc<dyn PortOpener>,
        mock: Option<MockController>,
    ) -> Self {
        let bus = EventBus::new(config.subscriber_capacity);

        let correlator = match controller {
            Ok(transport) => {
                info!(path = %transport.path(), "Controller open");
                CorrelatorHandle::new(transport, bus.clone(), config.timeouts.command())
            }
            Err(reason) => {
                let path = config
                    .controller
                    .as_ref()
                    .map_or_else(|| "controller".to_string(), ControllerEndpoint::path);
                warn!(%path, %reason, "Controller not present");
                CorrelatorHandle::absent(&path, &reason, bus.clone())
            }
        };

        let scanners = ScannerManager::new(
            opener,
            bus.clone(),
            Duration::from_millis(config.scanner_retry_ms),
            Duration::from_millis(config.scanner_max_backoff_ms),
        );

        let locks = LockManager::new(
            lock_store,
            &config.lock_namespace,
            Duration::from_secs(config.default_lock_ttl_secs),
        );

        Self {
            inner: Arc::new(StationInner {
                config,
                bus,
                correlator,
                scanners,
                locks,
                mock,
                devices: Mutex::new(vec![]),
                background: CancellationToken::new(),
                tasks: Mutex::new(vec![]),
            }),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The scanners.
    pub fn scanners(&self) -> &ScannerManager {
        &self.inner.scanners
    }

    /// The locks.
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// The device side of a configured mock controller.
    pub fn mock_controller(&self) -> Option<MockController> {
        self.inner.mock.clone()
    }

    fn timeouts(&self) -> &crate::config::Timeouts {
        &self.inner.config.timeouts
    }

    fn devices_lock(&self) -> MutexGuard<'_, Vec<DeviceInfo>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn waiter(&self, matcher: LineMatcher) -> Waiter {
        Waiter::start(&self.inner.bus, matcher).on_path(self.inner.correlator.path())
    }

    /// Subscribe first, then write, then wait.
    async fn send_then_wait(
        &self,
        text: String,
        matcher: LineMatcher,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let waiter = self.waiter(matcher);

        tokio::select! {
            sent = self.inner.correlator.send(Command::new(text)) => sent?,
            _ = cancel.cancelled() => return Err(Error::ClientAbort),
        }

        waiter.wait(cancel.clone(), Some(timeout)).await.into_result()
    }

    /// Blink the indicators of the board with the MAC, `count` times.
    pub async fn blink(
        &self,
        mac: &str,
        count: u32,
        cancel: CancellationToken,
    ) -> Result<String, Error> {
        let mac = MacAddress::parse(mac)?;

        self.send_then_wait(
            format!("BLINK {count} {mac}"),
            LineMatcher::blink_ok(),
            self.timeouts().blink(),
            &cancel,
        )
        .await
    }

    /// Monitor pins (and optionally latch pins) of the board with the MAC.
    ///
    /// The controller echoes the command back, and the echo must match what was sent.
    pub async fn monitor(
        &self,
        pins: &[u32],
        latch_pins: &[u32],
        mac: &str,
        cancel: CancellationToken,
    ) -> Result<String, Error> {
        let mac = MacAddress::parse(mac)?;
        if pins.is_empty() {
            return Err(Error::InvalidInput("No pins to monitor".into()));
        }

        let mut command = format!("MONITOR {}", pins.iter().join(","));
        if !latch_pins.is_empty() {
            command += &format!(" LATCH {}", latch_pins.iter().join(","));
        }
        command += &format!(" {mac}");

        let echoed = self
            .send_then_wait(
                command.clone(),
                LineMatcher::echo("MONITOR"),
                self.timeouts().echo(),
                &cancel,
            )
            .await?;

        if normalized(&echoed) == normalized(&command) {
            Ok(echoed)
        } else {
            warn!(%command, %echoed, "Echo mismatch");
            Err(Error::EchoMismatch {
                sent: command,
                echoed,
            })
        }
    }

    /// Greet the board with the MAC and wait until it says it is ready.
    pub async fn check_ready(&self, mac: &str, cancel: CancellationToken) -> Result<String, Error> {
        let mac = MacAddress::parse(mac)?;

        self.send_then_wait(
            "WELCOME".into(),
            LineMatcher::ready(mac),
            self.timeouts().ready(),
            &cancel,
        )
        .await
    }

    /// Ping the controller. The outcome is also published.
    pub async fn ping(&self, cancel: CancellationToken) -> Result<String, Error> {
        let result = self
            .send_then_wait(
                "PING".into(),
                LineMatcher::ping_ok(),
                self.timeouts().ping(),
                &cancel,
            )
            .await;

        let event = match &result {
            Ok(line) => Event::EspPingResult {
                ok: true,
                raw: Some(line.clone()),
                error: None,
            },
            // Nobody to tell.
            Err(Error::ClientAbort) => return result,
            Err(e) => Event::EspPingResult {
                ok: false,
                raw: None,
                error: Some(e.condition().to_string()),
            },
        };
        self.inner.bus.publish(event);

        result
    }

    /// Wait for a board to announce itself.
    /// There is no timeout, this waits until cancelled.
    pub async fn discover(&self, cancel: CancellationToken) -> Result<Discovery, Error> {
        let line = self
            .waiter(LineMatcher::hello())
            .wait(cancel, None)
            .await
            .into_result()?;

        let mac = MacAddress::extract(&line)
            .ok_or_else(|| Error::InvalidMac(format!("No MAC in `{line}`")))?;
        info!(%mac, "Discovered");

        Ok(Discovery {
            mac,
            raw: format!("serial:{line}"),
        })
    }

    /// Run a command with a terminated response on the controller.
    pub async fn command(&self, text: &str, cancel: CancellationToken) -> Result<Vec<String>, Error> {
        let text = text.trim();
        if text.is_empty() || text.contains(['\n', '\r']) {
            return Err(Error::InvalidInput("A command is a single non-empty line".into()));
        }

        tokio::select! {
            response = self.inner.correlator.enqueue(Command::new(text)) => response,
            _ = cancel.cancelled() => Err(Error::ClientAbort),
        }
    }

    /// The last known serial devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices_lock().clone()
    }

    /// Look for serial devices, and publish the list if it changed.
    pub fn refresh_devices(&self) -> Result<Vec<DeviceInfo>, Error> {
        let mut devices = available_ports()
            .map_err(|e| Error::TransportAbsent(e.to_string()))?
            .into_iter()
            .map(DeviceInfo::from)
            .collect::<Vec<_>>();

        if let Some(ControllerEndpoint::Mock(name)) = &self.inner.config.controller {
            devices.push(DeviceInfo::mock(&format!("mock:{name}")));
        }
        devices.sort();

        let changed = {
            let mut known = self.devices_lock();
            let changed = *known != devices;
            *known = devices.clone();
            changed
        };

        if changed {
            debug!(count = devices.len(), "Device list changed");
            self.inner.bus.publish(Event::DeviceList {
                devices: devices.clone(),
            });
        }

        Ok(devices)
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, every: Duration, mut work: F)
    where
        F: FnMut(Station, CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let station = self.clone();
        let cancel = self.inner.background.clone();

        let task = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = interval.tick() => work(station.clone(), cancel.child_token()).await,
                        _ = cancel.cancelled() => break,
                    }
                }

                debug!("Stopped");
            }
            .instrument(info_span!("background", task = name)),
        );

        self.tasks_lock().push(task);
    }

    fn tasks_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the controller heartbeat, device list refresh and scanner ensure tick,
    /// as configured. None of these are tied to a request.
    pub fn start_background(&self) {
        let config = &self.inner.config;

        if config.ping_interval_secs > 0 && config.controller.is_some() {
            self.spawn_periodic(
                "ping",
                Duration::from_secs(config.ping_interval_secs),
                |station, cancel| async move {
                    if let Err(e) = station.ping(cancel).await {
                        debug!(%e, "Heartbeat ping failed");
                    }
                },
            );
        }

        if config.device_refresh_secs > 0 {
            self.spawn_periodic(
                "devices",
                Duration::from_secs(config.device_refresh_secs),
                |station, _| async move {
                    if let Err(e) = station.refresh_devices() {
                        warn!(%e, "Could not list serial devices");
                    }
                },
            );
        }

        if !config.scanners.is_empty() {
            let scanners = config
                .scanners
                .iter()
                .map(|scanner| (scanner.path.clone(), scanner.baud))
                .collect();

            let task = self.inner.scanners.keep_open(
                scanners,
                config.scanner_tick(),
                self.inner.background.child_token(),
            );
            self.tasks_lock().push(task);
        }
    }

    /// Stop everything.
    ///
    /// Pending controller commands and waits are rejected with [`Error::ShuttingDown`],
    /// and event streams end.
    pub async fn shutdown(&self) {
        info!("Station shutting down");

        self.inner.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks_lock());
        for task in tasks {
            task.abort();
        }

        self.inner.bus.close();
        self.inner.correlator.shutdown().await;
        self.inner.scanners.close_all();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use super::*;
    use crate::{mock::MockBuilder, scanner::MockOpener};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn station_with(builder: MockBuilder) -> (Station, MockController) {
        let (transport, device) = builder.build();
        let station = Station::assemble(
            Config::default(),
            Ok(transport),
            Arc::new(MemoryLockStore::default()),
            Arc::new(MockOpener::default()),
        );

        (station, device)
    }

    fn scripted() -> (Station, MockController) {
        let mac = MacAddress::parse(MOCK_CONTROLLER_MAC).unwrap();
        station_with(MockBuilder::new("station").script(controller_script(mac)))
    }

    #[tokio::test]
    async fn blink_ok() {
        let (station, device) = scripted();
        let mut written = device.written();

        let line = station.blink(MAC, 3, CancellationToken::new()).await.unwrap();

        assert_eq!(line, "BLINK-OK");
        assert_eq!(written.recv().await.unwrap(), "BLINK 3 AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test(start_paused = true)]
    async fn blink_without_answer_times_out() {
        let (station, _device) = station_with(MockBuilder::new("mute"));
        let started = Instant::now();

        let err = station
            .blink(MAC, 3, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, Error::Timeout(5000));
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn blink_bad_mac_writes_nothing() {
        let (station, device) = scripted();
        let mut written = device.written();

        let err = station
            .blink("AA:BB", 3, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "invalid-mac");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_abort_unsubscribes() {
        let (station, _device) = station_with(MockBuilder::new("mute"));
        let cancel = CancellationToken::new();

        let blink = tokio::spawn({
            let station = station.clone();
            let cancel = cancel.clone();
            async move { station.blink(MAC, 1, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(station.bus().subscriber_count(), 1);

        cancel.cancel();
        assert_eq!(blink.await.unwrap().unwrap_err(), Error::ClientAbort);
        assert_eq!(station.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn monitor_echo() {
        let (station, device) = scripted();
        let mut written = device.written();

        station
            .monitor(&[1, 2, 3], &[7], "aa:bb:cc:dd:ee:ff", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            written.recv().await.unwrap(),
            "MONITOR 1,2,3 LATCH 7 AA:BB:CC:DD:EE:FF"
        );
    }

    #[tokio::test]
    async fn payload_errors_are_not_mac_errors() {
        let (station, _device) = scripted();

        let err = station
            .monitor(&[], &[], MAC, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "invalid-input");

        let err = station
            .monitor(&[1], &[], "AA:BB", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "invalid-mac");

        let err = station
            .command("a\nb", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "invalid-input");
    }

    #[tokio::test]
    async fn monitor_echo_mismatch() {
        let (station, device) = station_with(MockBuilder::new("garbled"));
        let mut written = device.written();

        let monitor = tokio::spawn({
            let station = station.clone();
            async move {
                station
                    .monitor(&[1], &[], MAC, CancellationToken::new())
                    .await
            }
        });

        written.recv().await.unwrap();
        device.inject("MONITOR 2 AA:BB:CC:DD:EE:FF");

        let err = monitor.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::EchoMismatch {
                sent: "MONITOR 1 AA:BB:CC:DD:EE:FF".into(),
                echoed: "MONITOR 2 AA:BB:CC:DD:EE:FF".into()
            }
        );
    }

    #[tokio::test]
    async fn ready_is_mac_scoped() {
        let (station, device) = station_with(MockBuilder::new("ready"));
        let mut written = device.written();

        let ready = tokio::spawn({
            let station = station.clone();
            async move { station.check_ready(MAC, CancellationToken::new()).await }
        });

        assert_eq!(written.recv().await.unwrap(), "WELCOME");
        device.inject_many(["READY 11:22:33:44:55:66", "READY aa:bb:cc:dd:ee:ff"]);

        assert_eq!(ready.await.unwrap().unwrap(), "READY aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn ping_publishes_result() {
        let (station, _device) = scripted();
        let mut events = station.bus().subscribe();

        assert_eq!(station.ping(CancellationToken::new()).await.unwrap(), "OK");

        loop {
            let event = events.recv().await.unwrap();
            if let Event::EspPingResult { ok, raw, error } = event.inner {
                assert!(ok);
                assert_eq!(raw.as_deref(), Some("OK"));
                assert_eq!(error, None);
                break;
            }
        }
    }

    #[tokio::test]
    async fn discover_hello() {
        let (station, device) = station_with(MockBuilder::new("hello"));

        let discovery = tokio::spawn({
            let station = station.clone();
            async move { station.discover(CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.inject("HELLO AA:BB:CC:DD:EE:FF");

        let discovery = discovery.await.unwrap().unwrap();
        assert_eq!(discovery.mac.as_str(), MAC);
        assert_eq!(discovery.raw, "serial:HELLO AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn command_passthrough() {
        let (station, _device) = scripted();

        let lines = station
            .command("state", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lines, vec!["> state"]);

        assert!(station
            .command("a\nb", CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn absent_controller_fails_fast() {
        let station = Station::assemble(
            Config::default(),
            Err("No such file or directory".into()),
            Arc::new(MemoryLockStore::default()),
            Arc::new(MockOpener::default()),
        );

        let err = station
            .blink(MAC, 1, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "serial-not-present");
        assert_eq!(station.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_pending() {
        let (station, device) = station_with(MockBuilder::new("slow"));
        let mut written = device.written();

        let pending = tokio::spawn({
            let station = station.clone();
            async move { station.command("state", CancellationToken::new()).await }
        });
        written.recv().await.unwrap();

        station.shutdown().await;
        assert_eq!(pending.await.unwrap().unwrap_err(), Error::ShuttingDown);
    }

    #[tokio::test]
    async fn shutdown_settles_waits() {
        let (station, device) = station_with(MockBuilder::new("mute"));
        let mut written = device.written();

        let discovery = tokio::spawn({
            let station = station.clone();
            async move { station.discover(CancellationToken::new()).await }
        });
        let blink = tokio::spawn({
            let station = station.clone();
            async move { station.blink(MAC, 2, CancellationToken::new()).await }
        });

        written.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(station.bus().subscriber_count(), 2);

        station.shutdown().await;

        let settled = tokio::time::timeout(Duration::from_secs(1), async {
            (discovery.await.unwrap(), blink.await.unwrap())
        })
        .await
        .expect("waits should settle on shutdown");

        assert_eq!(settled.0.unwrap_err(), Error::ShuttingDown);
        assert_eq!(settled.1.unwrap_err(), Error::ShuttingDown);
        assert_eq!(station.bus().subscriber_count(), 0);
    }

    #[test]
    fn normalization() {
        assert_eq!(
            normalized("  monitor 1,2   aa:bb:cc:dd:ee:ff "),
            normalized("MONITOR 1,2 AA:BB:CC:DD:EE:FF")
        );
    }
}
