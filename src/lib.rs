//! Core library for a camera-guided touchscreen test rig.
//!
//! A stylus on a two-axis arm taps, drags and swipes a device screen while a
//! camera watches it. The crate is layered bottom-up:
//!
//! - [`transport`]: line-oriented serial link to the motor controller, plus a
//!   simulated controller for tests and dry runs.
//! - [`command_queue`]: paces dispatch so the controller's small motion FIFO
//!   never overflows, and estimates when queued motion will finish.
//! - [`robot`]: turns screen pixels into controller instructions and keeps the
//!   arm out of the camera's view when a photo is needed.
//! - [`monitor`]: background frame reader with photo and detour-frame
//!   rendezvous.
//! - [`script`]: detour, photograph, match, act. On-screen typing goes
//!   through [`keyboard`].
//!
//! Shared plumbing lives in [`config`], [`calibration`], [`error`] and
//! [`logging`].

pub mod calibration;
pub mod command;
pub mod command_queue;
pub mod config;
pub mod error;
pub mod firmware;
pub mod geometry;
pub mod keyboard;
pub mod logging;
pub mod monitor;
pub mod robot;
pub mod script;
pub mod transport;

pub use calibration::CalibrationRecord;
pub use command_queue::{CommandQueue, QueueSettings};
pub use config::RigConfig;
pub use error::{RigError, RigResult};
pub use robot::Robot;
pub use script::{Matcher, ScriptSettings, TestScript};
