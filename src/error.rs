//! Custom error types for the rig.
//!
//! This module defines the primary error type, `RigError`, shared by the transport,
//! the command queue, the motion planner and the capture monitor. Using the
//! `thiserror` crate, it gives every layer a single vocabulary for failure.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment load failures and semantic
//!   validation failures of an otherwise well-formed configuration.
//! - **`Io`**, **`Serial`**, **`Transport`**: communication with the motor
//!   controller. Status polls never surface these; they fail open inside the
//!   dispatch worker and only sends propagate them.
//! - **`QueueClosed`**, **`DispatchFailed`**, **`PossiblyWedged`**: command queue
//!   lifecycle. `DispatchFailed` means a command that was already folded into the
//!   predicted arm position never reached the firmware, so the position model is
//!   no longer trustworthy.
//! - **`DetourImpossible`**, **`CaptureUnavailable`**: physical impossibilities.
//!   Both are fatal for the current test run.
//! - **`WidgetNotFound`**: a hard query (click, assert) failed after the arm was
//!   reset and the rig released.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Errors produced by the rig.
#[derive(Error, Debug)]
pub enum RigError {
    /// Configuration file or environment could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or port I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the serial port driver.
    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No serial port matched the configured name or manufacturer.
    #[error("No serial port found for the motor controller (looked for '{0}')")]
    SerialPortNotFound(String),

    /// Generic transport failure (closed port, injected fault, short write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The command queue no longer accepts work.
    #[error("Command queue is closed")]
    QueueClosed,

    /// A dispatched command could not be delivered to the firmware.
    #[error("Failed to dispatch command #{id} '{text}': {reason}")]
    DispatchFailed {
        /// Sequence id of the lost command.
        id: u64,
        /// Instruction text of the lost command.
        text: String,
        /// Last transport error seen while sending.
        reason: String,
    },

    /// The firmware never reported idle within the configured drain timeout.
    #[error("Motor controller did not drain within {waited:?}; it may be wedged")]
    PossiblyWedged {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The screen is wider than the arm envelope on every axis.
    #[error("Screen is too large for the arm to move out of the camera view")]
    DetourImpossible,

    /// The camera produced no frame during startup.
    #[error("Cannot start the SUT monitor: no frame within {0:?}")]
    CaptureUnavailable(Duration),

    /// The frame source or capture thread failed while running.
    #[error("Capture error: {0}")]
    Capture(String),

    /// Image encode/decode failure.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Calibration record could not be (de)serialized.
    #[error("Calibration record error: {0}")]
    Calibration(#[from] serde_json::Error),

    /// A hard query did not find its widget.
    #[error("Widget '{widget}' not found (best similarity {similarity:.3})")]
    WidgetNotFound {
        /// Template name or path.
        widget: String,
        /// Best similarity the matcher reported.
        similarity: f64,
    },

    /// Typed text could not be split into keys.
    #[error("Invalid key text: {0}")]
    InvalidKeyText(String),

    /// The keyboard layout has no such key.
    #[error("Keyboard '{keyboard}' has no key '{key}'")]
    UnknownKey {
        /// Keyboard name.
        keyboard: String,
        /// Key as typed.
        key: String,
    },

    /// Several components failed while shutting down.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RigError>),
}

impl RigError {
    /// Whether the error leaves the arm in an unknown physical state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RigError::DispatchFailed { .. }
                | RigError::PossiblyWedged { .. }
                | RigError::DetourImpossible
                | RigError::CaptureUnavailable(_)
        )
    }
}
