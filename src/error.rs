//! Error types for the DAC gateway
//!
//! Every error is handled at the layer that detects it. Nothing here is
//! allowed to abort the host process: bus failures leave the register shadow
//! untouched, connection failures feed the reconnect machine, configuration
//! errors are clamped away before they reach hardware.

use std::time::Duration;

/// Failures of a single register transaction on the control bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The transaction did not complete within its time budget
    #[error("bus transaction timed out after {0:?}")]
    Timeout(Duration),

    /// The transport reported a failure (NACK, missing tool, I/O error)
    #[error("bus transfer failed on register {reg:#04x}: {reason}")]
    Transport {
        /// Register the transaction targeted
        reg: u8,
        /// Transport-specific failure description
        reason: String,
    },

    /// Writes are disabled because detection did not find the chip
    #[error("device absent, hardware writes disabled")]
    DeviceAbsent,

    /// The gateway worker has shut down
    #[error("bus gateway closed")]
    Closed,
}

/// Failures of the playback engine's push feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The handshake with the engine failed
    #[error("failed to connect to playback engine: {0}")]
    Connect(String),

    /// The feed closed underneath us
    #[error("playback engine feed closed")]
    Closed,

    /// The engine sent something we could not interpret
    #[error("playback engine protocol error: {0}")]
    Protocol(String),
}

/// Top-level taxonomy surfaced by the controller.
#[derive(Debug, thiserror::Error)]
pub enum DacError {
    /// Detection mismatch. Non-fatal; writes stay disabled until a re-check.
    #[error("DAC not found on bus {bus} at address {address:#04x}")]
    DeviceAbsent {
        /// Bus number that was searched
        bus: u8,
        /// 7-bit address that was searched
        address: u8,
    },

    /// Transport-level read/write failure
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Setting the running gateway cannot apply
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Convenience alias for controller operations
pub type DacResult<T> = Result<T, DacError>;
