use std::io;

use thiserror::Error;

/// Any error a transport might encounter.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem: {0}")]
    IO(#[from] io::Error),

    /// Could not open the port.
    #[error("Could not open port at {path}: {problem}")]
    Open {
        /// The port.
        path: String,

        /// What went wrong.
        problem: String,
    },

    /// Serial port disconnected.
    #[error("Serial port disconnected")]
    Disconnected,
}
