#![deny(missing_docs)]

//! This crate drives a wiring-harness test station.
//!
//! The station controller is reached over a serial port. Commands are put on wire one at a time,
//! in the order they were asked for, and their responses are correlated back to whoever asked:
//! either by terminator lines (`Done`, `Error...`) or by waiting for a specific line to show up.
//!
//! Every line, scan and device change is published on an in-process event bus,
//! which server-sent event streams and websockets forward to any number of observers.
//!
//! Barcode scanners are kept open with a cooldown between attempts,
//! and each scan is handed out to at most one poll.
//!
//! KSSK work units are guarded by TTL-bounded locks in Redis,
//! so two stations never work on the same unit at once.

/// Command line interface.
pub mod cli;

/// Configuration of the station service.
pub mod config;

/// Serializing commands onto a transport and pairing them with their responses.
pub mod correlator;

/// Possible errors in this library.
pub mod error;

/// The event bus and the events on it.
pub mod events;

/// Station locks on KSSKs.
pub mod lock;

/// Logging setup.
pub mod logging;

/// MAC addresses.
pub mod mac;

/// Mocked transports.
pub mod mock;

/// Barcode scanner connections.
pub mod scanner;

/// Serial port transports.
pub mod serial;

/// Code relating to setting up a server.
pub mod server;

/// The station service object.
pub mod station;

/// Waiting for matching lines.
pub mod waiter;

mod sse;
mod websocket;
