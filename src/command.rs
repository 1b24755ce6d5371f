//! Wire commands and the actions that produce them.
//!
//! A [`Command`] is one controller instruction plus the bookkeeping the queue
//! needs: a sequence id, when it was enqueued, and when it is expected to start
//! and how long it runs. The duration comes from the instruction's own timing
//! field, so estimates never depend on planner state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// One controller instruction in flight through the queue. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Monotonic sequence id, starting at 1 for each queue.
    pub id: u64,
    /// Instruction text without terminator.
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
    /// Running queue end-time estimate at the moment of enqueue.
    pub estimated_start: DateTime<Utc>,
    pub estimated_duration: Duration,
}

impl Command {
    pub(crate) fn new(id: u64, text: String, estimated_start: DateTime<Utc>) -> Self {
        let estimated_duration = estimate_duration(&text);
        Self {
            id,
            text,
            enqueued_at: Utc::now(),
            estimated_start,
            estimated_duration,
        }
    }

    /// Estimated completion time.
    pub fn estimated_end(&self) -> DateTime<Utc> {
        self.estimated_start + chrono_duration(self.estimated_duration)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.text)
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Execution time encoded in an instruction.
///
/// `XM` and `SM` carry milliseconds in their first field, `SP` in its optional
/// second field. Everything else runs in no measurable time. A malformed
/// number estimates to zero.
pub fn estimate_duration(text: &str) -> Duration {
    let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();
    let field = match fields.first().copied() {
        Some("XM") | Some("SM") => fields.get(1),
        Some("SP") if fields.len() >= 3 => fields.get(2),
        _ => None,
    };

    match field {
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(command = text, "Unparseable duration field, estimating 0 ms");
                Duration::ZERO
            }
        },
        None => Duration::ZERO,
    }
}

/// Kind of user-level action issuing motion or needing a still arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Move,
    Click,
    DoubleClick,
    LongPress,
    Drag,
    PressDrag,
    Swipe,
    PressKeyboard,
    PenDown,
    PenUp,
    Reset,
    Release,
    Detour,
    Match,
    Photo,
}

impl ActionKind {
    /// Whether the action must wait for the arm to stop before it is issued.
    pub fn requires_settle(self) -> bool {
        matches!(
            self,
            ActionKind::Click
                | ActionKind::Drag
                | ActionKind::DoubleClick
                | ActionKind::PressDrag
                | ActionKind::PressKeyboard
                | ActionKind::LongPress
                | ActionKind::Release
                | ActionKind::Reset
                | ActionKind::Detour
                | ActionKind::Match
                | ActionKind::Photo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Move => "move",
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double click",
            ActionKind::LongPress => "long press",
            ActionKind::Drag => "drag",
            ActionKind::PressDrag => "press drag",
            ActionKind::Swipe => "swipe",
            ActionKind::PressKeyboard => "press keyboard",
            ActionKind::PenDown => "pen down",
            ActionKind::PenUp => "pen up",
            ActionKind::Reset => "reset",
            ActionKind::Release => "release",
            ActionKind::Detour => "detour",
            ActionKind::Match => "match",
            ActionKind::Photo => "photo",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction text builders.
pub mod wire {
    /// Servo channel holding the pen-up position.
    pub const SERVO_UP: u8 = 4;
    /// Servo channel holding the pen-down position.
    pub const SERVO_DOWN: u8 = 5;

    /// Mixed-axis relative move.
    pub fn mixed_move(ms: u64, a: i64, b: i64) -> String {
        format!("XM,{},{},{}", ms, a, b)
    }

    /// Stand still for `ms` milliseconds.
    pub fn pause(ms: u64) -> String {
        mixed_move(ms, 0, 0)
    }

    /// Set a servo position.
    pub fn servo(channel: u8, position: i64) -> String {
        format!("SC,{},{}", channel, position)
    }

    /// Lower the pen and wait.
    pub fn pen_down(ms: u64) -> String {
        format!("SP,0,{}", ms)
    }

    /// Raise the pen and wait.
    pub fn pen_up(ms: u64) -> String {
        format!("SP,1,{}", ms)
    }

    /// Home to the origin at `rate` steps per second.
    pub fn home(rate: u64) -> String {
        format!("HM,{}", rate)
    }
}
