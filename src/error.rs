use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::Lock;

/// Errors thay may occur in this library.
///
/// Every variant maps to a fixed condition string, see [`Error::condition`].
/// Callers translate conditions into whatever their transport needs.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The caller went away before the operation completed.
    #[error("The request was cancelled by the client")]
    ClientAbort,

    /// No matching response arrived within the time budget.
    #[error("No matching response within {0} ms")]
    Timeout(u64),

    /// No physical device is reachable.
    #[error("The serial device is not present: {0}")]
    TransportAbsent(String),

    /// A MAC address which does not parse.
    #[error("Invalid MAC: {0}")]
    InvalidMac(String),

    /// Any other malformed input, e.g. an empty pin list or station id.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The device echoed something other than what was sent.
    #[error("Sent `{sent}` but the device echoed `{echoed}`")]
    EchoMismatch {
        /// The command as put on wire.
        sent: String,

        /// The line the device echoed back.
        echoed: String,
    },

    /// The device ended its response with an `Error` terminator.
    /// All lines received before (and including) the terminator are kept.
    #[error("The device reported an error: {}", lines.join(" | "))]
    DeviceError {
        /// The partial response.
        lines: Vec<String>,
    },

    /// The lock is held by someone else.
    #[error("The lock for `{}` is held by station {:?}", .0.kssk, .0.station_id)]
    LockHeld(Lock),

    /// The external lock store could not be reached.
    #[error("The lock store is unavailable: {0}")]
    StoreUnavailable(String),

    /// The service is shutting down and will not complete the request.
    #[error("Shutting down")]
    ShuttingDown,

    /// No scanner is known at the given path.
    #[error("No scanner at `{0}`")]
    NoSuchScanner(String),

    /// Bad json.
    #[error("The request `{request}` could not be deserialized. Problem: {problem}")]
    BadJson {
        /// The problematic request.
        request: String,

        /// The deserialization issue.
        problem: String,
    },

    /// The configuration is not valid.
    #[error("The configuration is not valid. Problem: `{0}`")]
    BadConfig(String),
}

impl Error {
    /// The transport-agnostic condition string for this error.
    pub fn condition(&self) -> &'static str {
        match self {
            Error::ClientAbort => "client-abort",
            Error::Timeout(_) => "timeout",
            Error::TransportAbsent(_) => "serial-not-present",
            Error::InvalidMac(_) => "invalid-mac",
            Error::InvalidInput(_) => "invalid-input",
            Error::EchoMismatch { .. } => "echo-mismatch",
            Error::DeviceError { .. } => "device-error",
            Error::LockHeld(_) => "lock-held",
            Error::StoreUnavailable(_) => "store-unavailable",
            Error::ShuttingDown => "shutting-down",
            Error::NoSuchScanner(_) => "no-such-scanner",
            Error::BadJson { .. } => "bad-json",
            Error::BadConfig(_) => "bad-config",
        }
    }

    /// Get the inner message if this is a bad config error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }

    /// Get the partial response if the device reported an error.
    pub fn device_lines(&self) -> Option<&[String]> {
        if let Self::DeviceError { lines } = self {
            Some(lines)
        } else {
            None
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_conditions() {
        assert_eq!(Error::ClientAbort.condition(), "client-abort");
        assert_eq!(Error::Timeout(5000).condition(), "timeout");
        assert_eq!(
            Error::TransportAbsent("/dev/ttyUSB0".into()).condition(),
            "serial-not-present"
        );
        assert_eq!(Error::InvalidMac("zz".into()).condition(), "invalid-mac");
        assert_eq!(Error::InvalidInput("".into()).condition(), "invalid-input");
        assert_eq!(
            Error::EchoMismatch {
                sent: "a".into(),
                echoed: "b".into()
            }
            .condition(),
            "echo-mismatch"
        );
    }

    #[test]
    fn device_error_keeps_partial_response() {
        let e = Error::DeviceError {
            lines: vec!["line one".into(), "Error: no route".into()],
        };

        assert_eq!(e.device_lines().unwrap().len(), 2);
        assert!(e.to_string().contains("line one | Error: no route"));
    }
}
