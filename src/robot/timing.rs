//! Motion and pen timing estimates.
//!
//! The arm is a two-motor mixed-axis (CoreXY style) mechanism: motor A turns by
//! `x + y` and motor B by `x - y`, so a move lasts as long as the busier motor
//! needs at the configured step rate.

use crate::command::ActionKind;
use crate::geometry::StepVector;
use nalgebra::Vector2;
use std::time::Duration;

/// Servo units travelled per millisecond of pen motion.
const PEN_UNITS_PER_MS: f64 = 10.0;
/// Servo units travelled per second when converting a height to seconds.
const PEN_UNITS_PER_S: f64 = 10_000.0;
/// Extra lift/drop time of each tap in a double click, in seconds.
const DOUBLE_CLICK_TAP_S: f64 = 0.2;

/// Seconds needed to travel `delta` at `speed` steps per second.
pub fn move_time(delta: StepVector, speed: f64) -> f64 {
    let motor_a = delta.x + delta.y;
    let motor_b = delta.x - delta.y;
    motor_a.abs().max(motor_b.abs()) as f64 / speed
}

/// [`move_time`] rounded up to whole milliseconds, as carried by `XM`.
pub fn move_time_ms(delta: StepVector, speed: f64) -> u64 {
    (move_time(delta, speed) * 1000.0).ceil() as u64
}

/// Milliseconds the servo needs to travel `height` units.
pub fn pen_fall_time_ms(height: i64) -> u64 {
    (height.abs() as f64 / PEN_UNITS_PER_MS).ceil() as u64
}

/// Pen-fall height model.
///
/// The calibrated tip height is measured at the screen centre. Older arms sag
/// toward the edges of their travel, which `height_error` describes per axis
/// across the whole range. With both errors zero the tip height is used as is.
#[derive(Debug, Clone, PartialEq)]
pub struct PenModel {
    pub tip_height: i64,
    pub height_error: [f64; 2],
    pub arm_range_cm: [f64; 2],
    /// Screen centre in the arm frame.
    pub screen_center: Vector2<f64>,
}

impl PenModel {
    /// Fall height with the arm at `position`.
    pub fn fall_height(&self, position: StepVector) -> i64 {
        let [err_x, err_y] = self.height_error;
        if err_x == 0.0 && err_y == 0.0 {
            return self.tip_height;
        }

        let rate_x = err_x / self.arm_range_cm[0];
        let rate_y = err_y / self.arm_range_cm[1];
        let rel_x = self.screen_center.x - position.x as f64;
        let rel_y = self.screen_center.y - position.y as f64;

        let fall_x = (rate_x * rel_x / 5.0).ceil() * if rel_x > 0.0 { 1.5 } else { 1.3 };
        let fall_y = (rate_y * rel_y / 5.0).ceil() * if rel_y > 0.0 { 1.2 } else { 1.5 };

        (self.tip_height as f64 + fall_x + fall_y) as i64
    }
}

/// Wall-clock estimates for whole actions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationModel {
    pub motor_speed: f64,
    pub drag_speed: f64,
}

impl DurationModel {
    /// Estimated duration of `kind`.
    ///
    /// `travel` is the motion the action itself performs (the drag or swipe
    /// vector, the approach for a move, the way home for a reset) and `press`
    /// the dwell of long presses.
    pub fn estimate(
        &self,
        kind: ActionKind,
        fall_height: i64,
        travel: StepVector,
        press: Duration,
    ) -> Duration {
        let fall = fall_height as f64 / PEN_UNITS_PER_S;
        let press = press.as_secs_f64();

        let secs = match kind {
            ActionKind::Click => fall * 2.0,
            ActionKind::Move | ActionKind::Reset => move_time(travel, self.motor_speed),
            ActionKind::DoubleClick => (fall + DOUBLE_CLICK_TAP_S) * 2.0,
            ActionKind::Swipe | ActionKind::Drag => {
                move_time(travel, self.drag_speed) + fall * 2.0
            }
            ActionKind::LongPress => fall * 2.0 + press,
            ActionKind::PressDrag => move_time(travel, self.drag_speed) + fall * 2.0 + press,
            ActionKind::PenDown => fall,
            _ => 0.0,
        };

        Duration::from_secs_f64(secs.max(0.0))
    }
}
