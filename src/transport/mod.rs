//! Line-oriented link to the EiBotBoard motor controller.
//!
//! Every instruction is a short ASCII line terminated by a carriage return.
//! The controller understands a small fixed set:
//!
//! | Mnemonic | Meaning |
//! |---|---|
//! | `XM,ms,a,b` | mixed-axis relative move lasting `ms` milliseconds |
//! | `SM,ms,a,b` | stepper move lasting `ms` milliseconds |
//! | `SC,4,n` / `SC,5,n` | servo position for pen up / pen down |
//! | `SP,state[,ms]` | raise (1) or lower (0) the pen, then wait `ms` |
//! | `HM,rate` | home to the origin (firmware 2.6.2 and later) |
//! | `QM` | motion status query |
//! | `QP` | pen state query |
//! | `QS` | step position query |
//! | `V` | firmware version query |
//!
//! The [`Transport`] trait is the seam between the command queue and the wire.
//! [`SerialTransport`] talks to real hardware; [`mock::MockFirmware`] simulates
//! the controller for tests and virtual runs.

pub mod mock;
#[cfg(feature = "instrument_serial")]
mod serial;

#[cfg(feature = "instrument_serial")]
pub use serial::{find_rig_port, SerialTransport};

use crate::error::RigResult;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terminator appended to every instruction on the wire.
pub const LINE_TERMINATOR: &str = "\r";

/// Firmware version query.
pub const QUERY_VERSION: &str = "V";
/// Motion status query.
pub const QUERY_MOTION: &str = "QM";
/// Pen state query.
pub const QUERY_PEN: &str = "QP";
/// Step position query.
pub const QUERY_STEPS: &str = "QS";

/// Blocking request/response link to the motor controller.
///
/// Implementations append [`LINE_TERMINATOR`] themselves; callers pass bare
/// instruction text.
pub trait Transport: Send {
    /// Write one instruction without waiting for a reply.
    fn send(&mut self, line: &str) -> RigResult<()>;

    /// Write one instruction and return the raw reply text.
    ///
    /// An empty string means the controller said nothing before the read
    /// timeout expired.
    fn query(&mut self, line: &str) -> RigResult<String>;

    /// Release the underlying port. Further calls fail.
    fn close(&mut self) -> RigResult<()>;

    /// Whether the link still accepts traffic.
    fn is_open(&self) -> bool;
}

/// Transport handle shared between the dispatch worker and caller threads.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing.
pub fn shared(transport: impl Transport + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

/// Make sure the pen starts lifted.
///
/// The controller reports `0` from `QP` when the pen is down; in that case it
/// is raised before any motion is queued.
pub fn prepare_pen(transport: &SharedTransport) -> RigResult<()> {
    let reply = transport.lock().query(QUERY_PEN)?;
    match reply.trim_start().chars().next() {
        Some('0') => {
            debug!("Pen reported down at connect, raising it");
            transport.lock().send("SP,1")
        }
        Some('1') => Ok(()),
        _ => {
            warn!(reply = %reply.trim(), "Unexpected pen state reply, leaving pen as is");
            Ok(())
        }
    }
}
