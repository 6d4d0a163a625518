use std::{path::Path, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Where the station controller is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerEndpoint {
    /// A serial port.
    Tty {
        /// Likely "/dev/ttyUSBx" or "COMx".
        path: String,

        /// Baud rate.
        baud: u32,
    },

    /// A mock controller with the given name, answering like the firmware does.
    /// Useful for trying things out without hardware.
    Mock(String),
}

impl ControllerEndpoint {
    /// The path this endpoint is known by.
    pub fn path(&self) -> String {
        match self {
            ControllerEndpoint::Tty { path, .. } => path.clone(),
            ControllerEndpoint::Mock(name) => format!("mock:{name}"),
        }
    }
}

/// A barcode scanner to keep open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Likely "/dev/ttyACMx" or "COMx".
    pub path: String,

    /// Baud rate.
    pub baud: u32,
}

/// Where locks are kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockStoreConfig {
    /// A redis server, e.g. `redis://127.0.0.1/`.
    Redis {
        /// Connection url.
        url: String,
    },

    /// Process memory. Only meaningful for a single station.
    Memory,
}

/// Time budgets for talking to the controller, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Waiting for `BLINK-OK`.
    pub blink_ms: u64,

    /// Waiting for a ping answer.
    pub ping_ms: u64,

    /// Waiting for `READY`.
    pub ready_ms: u64,

    /// Waiting for a `MONITOR` echo.
    pub echo_ms: u64,

    /// Waiting for a terminated command response.
    pub command_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            blink_ms: 5000,
            ping_ms: 3000,
            ready_ms: 10_000,
            echo_ms: 3000,
            command_ms: 5000,
        }
    }
}

impl Timeouts {
    /// The blink budget.
    pub fn blink(&self) -> Duration {
        Duration::from_millis(self.blink_ms)
    }

    /// The ping budget.
    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms)
    }

    /// The ready budget.
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }

    /// The echo budget.
    pub fn echo(&self) -> Duration {
        Duration::from_millis(self.echo_ms)
    }

    /// The command budget.
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }
}

/// The configuration used for running the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The station controller. Without one, controller operations report it as not present.
    pub controller: Option<ControllerEndpoint>,

    /// Scanners to keep open.
    pub scanners: Vec<ScannerConfig>,

    /// Where locks are kept.
    pub lock_store: LockStoreConfig,

    /// Prefix of lock keys.
    pub lock_namespace: String,

    /// TTL of a lock when the request does not say.
    pub default_lock_ttl_secs: u64,

    /// See [`Timeouts`].
    pub timeouts: Timeouts,

    /// Scanner opens are at least this far apart.
    pub scanner_retry_ms: u64,

    /// Scanner open backoff does not grow beyond this.
    pub scanner_max_backoff_ms: u64,

    /// How often event streams send a keep-alive.
    pub heartbeat_secs: u64,

    /// How often the controller is pinged in the background.
    /// Zero disables it.
    pub ping_interval_secs: u64,

    /// How often the serial device list is refreshed.
    /// Zero disables it.
    pub device_refresh_secs: u64,

    /// How many undelivered events a subscriber may have before it misses some.
    pub subscriber_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: None,
            scanners: vec![],
            lock_store: LockStoreConfig::Memory,
            lock_namespace: "kssk:lock:".into(),
            default_lock_ttl_secs: 900,
            timeouts: Timeouts::default(),
            scanner_retry_ms: 2000,
            scanner_max_backoff_ms: 30_000,
            heartbeat_secs: 15,
            ping_interval_secs: 30,
            device_refresh_secs: 5,
            subscriber_capacity: 1024,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            controller: Some(ControllerEndpoint::Tty {
                path: "/dev/ttyUSB0".into(),
                baud: 115_200,
            }),
            scanners: vec![
                ScannerConfig {
                    path: "/dev/ttyACM0".into(),
                    baud: 9600,
                },
                ScannerConfig {
                    path: "/dev/ttyACM1".into(),
                    baud: 9600,
                },
            ],
            lock_store: LockStoreConfig::Redis {
                url: "redis://127.0.0.1/".into(),
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .expect("Config should serialize")
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// How often the scanner ensure tick runs.
    pub fn scanner_tick(&self) -> Duration {
        Duration::from_millis(self.scanner_retry_ms)
    }

    fn check_timeouts(&self) -> Result<(), Error> {
        let Timeouts {
            blink_ms,
            ping_ms,
            ready_ms,
            echo_ms,
            command_ms,
        } = &self.timeouts;

        let zeroes = [
            ("blink_ms", blink_ms),
            ("ping_ms", ping_ms),
            ("ready_ms", ready_ms),
            ("echo_ms", echo_ms),
            ("command_ms", command_ms),
        ]
        .into_iter()
        .filter(|(_, ms)| **ms == 0)
        .map(|(name, _)| name)
        .collect::<Vec<_>>();

        if zeroes.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Timeouts must be above zero, but these are not: {zeroes:?}"
            )))
        }
    }

    fn check_scanner_timing(&self) -> Result<(), Error> {
        if self.scanner_retry_ms == 0 {
            return Err(Error::BadConfig(
                "The scanner retry interval must be above zero.".into(),
            ));
        }

        if self.scanner_max_backoff_ms < self.scanner_retry_ms {
            return Err(Error::BadConfig(format!(
                "The scanner max backoff ({} ms) is below the retry interval ({} ms).",
                self.scanner_max_backoff_ms, self.scanner_retry_ms
            )));
        }

        Ok(())
    }

    fn check_scanner_paths(&self) -> Result<(), Error> {
        let duplicates = self
            .scanners
            .iter()
            .map(|scanner| &scanner.path)
            .duplicates()
            .collect::<Vec<_>>();

        if !duplicates.is_empty() {
            return Err(Error::BadConfig(format!(
                "Each scanner may only be listed once. Duplicates: {duplicates:?}"
            )));
        }

        if let Some(controller) = &self.controller {
            let controller_path = controller.path();

            if self.scanners.iter().any(|scanner| scanner.path == controller_path) {
                return Err(Error::BadConfig(format!(
                    "The controller path `{controller_path}` is also listed as a scanner."
                )));
            }
        }

        Ok(())
    }

    fn check_locks(&self) -> Result<(), Error> {
        if self.lock_namespace.is_empty() {
            return Err(Error::BadConfig(
                "The lock namespace may not be empty, it would claim every key in the store."
                    .into(),
            ));
        }

        if self.default_lock_ttl_secs == 0 {
            return Err(Error::BadConfig(
                "The default lock TTL must be above zero.".into(),
            ));
        }

        Ok(())
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_timeouts()?;
        self.check_scanner_timing()?;
        self.check_scanner_paths()?;
        self.check_locks()?;

        Ok(())
    }
}
