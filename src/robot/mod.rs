//! Motion planner for the stylus arm.
//!
//! `Robot` turns screen-level intents (tap here, drag from there to there,
//! get out of the camera's way) into ordered batches of controller
//! instructions and hands them to the [`CommandQueue`].
//!
//! ## Position model
//!
//! There is no position feedback from the controller. The planner keeps a
//! single predicted position in arm-frame steps and updates it *before* the
//! batch that realizes it is enqueued. A dispatch failure therefore poisons the
//! model, which is why the queue faults instead of skipping the command.
//!
//! ## Action shape
//!
//! Every pointing action is an approach move (`XM` plus a short settle pause)
//! followed by a pen batch. Before the pen batch the planner blocks until the
//! firmware has drained if the action kind needs a still arm.
//!
//! ## Virtual debug
//!
//! Without a queue the planner runs dry: positions and swipe traces are still
//! computed but nothing is sent and no photo is taken.

pub mod detour;
pub mod timing;

use crate::calibration::CalibrationRecord;
use crate::command::{wire, ActionKind};
use crate::command_queue::{CommandQueue, QueueSettings};
use crate::config::{RigConfig, RobotConfig};
use crate::error::{RigError, RigResult};
use crate::geometry::{DirectionMatrix, PixelScale, Region, ScreenRect, StepVector, SwipeDirection};
use crate::monitor::{FrameSource, ImageSequenceSink, MonitorSettings, SutMonitor, VideoSink};
use crate::transport::{self, SharedTransport};
use detour::{DetourDecision, DetourPlanner, Evadability};
use nalgebra::Vector2;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use timing::{move_time_ms, pen_fall_time_ms, DurationModel, PenModel};
use tracing::{debug, info, warn};

/// Settle pause after every approach and pen lift, in milliseconds.
const SETTLE_MS: u64 = 100;
/// Extra servo travel above the touch height before a double click.
const HOVER_DISTANCE: i64 = 1000;
/// Share of the region extent a swipe travels.
const SWIPE_SPAN: f64 = 2.0 / 3.0;

/// A photo taken by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub index: u64,
    pub path: PathBuf,
}

/// Start and travel of a swipe in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwipeTrace {
    pub start: (i64, i64),
    pub delta: (i64, i64),
}

/// The arm, its predicted position, and the pipes to the controller and camera.
pub struct Robot {
    config: RobotConfig,
    screen: ScreenRect,
    scale: PixelScale,
    direction: DirectionMatrix,
    origin_detour: [i64; 2],
    pen: PenModel,
    timing: DurationModel,
    detour: DetourPlanner,
    position: StepVector,
    last_action_duration: Duration,
    photo_index: u64,
    photo_dir: PathBuf,
    queue: Option<CommandQueue>,
    monitor: Option<SutMonitor>,
    released: bool,
}

impl Robot {
    /// Build a planner for a calibrated rig.
    ///
    /// Without a `queue` the planner runs in virtual-debug mode.
    pub fn new(
        config: &RobotConfig,
        calibration: &CalibrationRecord,
        queue: Option<CommandQueue>,
        monitor: Option<SutMonitor>,
        photo_dir: impl Into<PathBuf>,
    ) -> Self {
        let scale = calibration.scale(config.one_cm_steps);
        let direction = calibration.direction();
        let screen = calibration.screen;

        let (cx, cy) = screen.center();
        let center_f = direction.apply(scale.to_steps(cx) as f64, scale.to_steps(cy) as f64);
        let screen_center = StepVector::new(center_f.x as i64, center_f.y as i64);

        let extent = direction.apply(
            scale.to_steps(screen.width) as f64,
            scale.to_steps(screen.height) as f64,
        );
        let range = direction.apply(
            config.arm_range_cm[0] * config.one_cm_steps,
            config.arm_range_cm[1] * config.one_cm_steps,
        );
        let margin = Vector2::new(
            config.evade_margin_cm[0] * config.one_cm_steps,
            config.evade_margin_cm[1] * config.one_cm_steps,
        );
        let evadability = Evadability::analyze(extent, range, margin);
        if !evadability.any() {
            warn!(
                ?extent,
                ?range,
                "Screen exceeds the arm range on both axes; detours will fail"
            );
        }

        Self {
            config: config.clone(),
            screen,
            scale,
            direction,
            origin_detour: calibration.origin_detour,
            pen: PenModel {
                tip_height: calibration.tip_height,
                height_error: config.height_error,
                arm_range_cm: config.arm_range_cm,
                screen_center: center_f,
            },
            timing: DurationModel {
                motor_speed: config.motor_speed,
                drag_speed: config.drag_speed,
            },
            detour: DetourPlanner {
                evadability,
                screen_center,
                outside_distance: config.outside_distance,
                y_side_offset: config.y_side_offset,
                step_threshold: config.detour_step_threshold,
                step_distance: config.detour_step_distance,
            },
            position: StepVector::zeros(),
            last_action_duration: Duration::ZERO,
            photo_index: 0,
            photo_dir: photo_dir.into(),
            queue,
            monitor,
            released: false,
        }
    }

    /// Planner that computes positions but never moves.
    pub fn virtual_debug(
        config: &RobotConfig,
        calibration: &CalibrationRecord,
        photo_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(config, calibration, None, None, photo_dir)
    }

    /// Assemble a rig from its configuration.
    ///
    /// Loads the calibration record, then, unless the configuration asks for a
    /// virtual run, lifts the pen, opens the command queue on `transport` and
    /// starts the monitor on `camera`. Photos land in the output directory;
    /// with `record_video` every frame is also kept under `video/` there.
    pub fn from_config(
        config: &RigConfig,
        transport: SharedTransport,
        camera: Option<Box<dyn FrameSource>>,
    ) -> RigResult<Self> {
        config.validate()?;
        let app = &config.application;
        let calibration = CalibrationRecord::load(&app.calibration_path)?;
        std::fs::create_dir_all(&app.output_dir)?;

        if app.virtual_debug {
            info!(output = %app.output_dir.display(), "Virtual debug run, controller left idle");
            return Ok(Self::virtual_debug(&config.robot, &calibration, &app.output_dir));
        }

        transport::prepare_pen(&transport)?;
        let queue = CommandQueue::open(transport, QueueSettings::from(&config.queue))?;

        let monitor = match camera {
            Some(camera) => {
                let sink: Option<Box<dyn VideoSink>> = if config.monitor.record_video {
                    Some(Box::new(ImageSequenceSink::new(app.output_dir.join("video"))?))
                } else {
                    None
                };
                let settings = MonitorSettings::try_from(&config.monitor)?;
                Some(SutMonitor::start(camera, sink, settings)?)
            }
            None => {
                warn!("No camera attached; photos and detour matching are unavailable");
                None
            }
        };

        info!(name = %app.name, monitor = monitor.is_some(), "Rig assembled");
        Ok(Self::new(
            &config.robot,
            &calibration,
            Some(queue),
            monitor,
            &app.output_dir,
        ))
    }

    /// Open the controller's serial port and assemble the rig on it.
    #[cfg(feature = "instrument_serial")]
    pub fn connect(config: &RigConfig, camera: Option<Box<dyn FrameSource>>) -> RigResult<Self> {
        let link = transport::SerialTransport::open(&config.serial)?;
        Self::from_config(config, transport::shared(link), camera)
    }

    pub fn is_virtual(&self) -> bool {
        self.queue.is_none()
    }

    /// Predicted arm position in steps.
    pub fn position(&self) -> StepVector {
        self.position
    }

    /// Estimate for the most recent action.
    pub fn last_action_duration(&self) -> Duration {
        self.last_action_duration
    }

    /// Whether the arm is away from the screen origin.
    pub fn needs_reset(&self) -> bool {
        self.position != StepVector::zeros()
    }

    pub fn evadability(&self) -> Evadability {
        self.detour.evadability
    }

    pub fn screen(&self) -> ScreenRect {
        self.screen
    }

    pub fn command_queue(&self) -> Option<&CommandQueue> {
        self.queue.as_ref()
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    // ---------------------------------------------------------------------
    // Pointing actions
    // ---------------------------------------------------------------------

    /// Tap at screen pixel `(x, y)`.
    pub fn click(&mut self, x: f64, y: f64) -> RigResult<()> {
        let rel = self.aim_at(x, y);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)?;
        self.settle(ActionKind::Click)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::Click, height, StepVector::zeros(), Duration::ZERO);
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down(t),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t + 50),
            wire::pause(SETTLE_MS),
        ])
    }

    /// Two quick taps at `(x, y)`.
    pub fn double_click(&mut self, x: f64, y: f64) -> RigResult<()> {
        let rel = self.aim_at(x, y);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)?;
        self.settle(ActionKind::DoubleClick)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(
            ActionKind::DoubleClick,
            height,
            StepVector::zeros(),
            Duration::ZERO,
        );
        let interval = (self.config.double_click_time_s * 1000.0).ceil() as u64;
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height + HOVER_DISTANCE),
            wire::pen_down(t),
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down((HOVER_DISTANCE / 10) as u64),
            wire::pen_up(interval),
            wire::pen_down(interval + 20),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t + 50),
            wire::pause(SETTLE_MS),
        ])
    }

    /// Hold the stylus on `(x, y)` for `press`.
    pub fn long_press(&mut self, x: f64, y: f64, press: Duration) -> RigResult<()> {
        let rel = self.aim_at(x, y);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)?;
        self.settle(ActionKind::LongPress)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::LongPress, height, StepVector::zeros(), press);
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down(t),
            wire::pause(duration_ms(press)),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t + 50),
            wire::pause(SETTLE_MS),
        ])
    }

    /// Drag from `(x1, y1)` to `(x2, y2)`.
    pub fn drag(&mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> RigResult<()> {
        let (rel, travel) = self.aim_stroke(x1, y1, x2, y2);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)?;
        self.settle(ActionKind::Drag)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::Drag, height, travel, Duration::ZERO);
        let stroke_ms = move_time_ms(travel, self.config.drag_speed);
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down(t),
            wire::pause(50),
            wire::mixed_move(stroke_ms, travel.x, travel.y),
            wire::pause(50),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t + 50),
        ])
    }

    /// Long press on `(x1, y1)`, then drag to `(x2, y2)`.
    pub fn press_drag(
        &mut self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        press: Duration,
    ) -> RigResult<()> {
        let (rel, travel) = self.aim_stroke(x1, y1, x2, y2);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)?;
        self.settle(ActionKind::PressDrag)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::PressDrag, height, travel, press);
        let stroke_ms = move_time_ms(travel, self.config.drag_speed);
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down(t),
            wire::pause(t),
            wire::pause(duration_ms(press)),
            wire::mixed_move(stroke_ms, travel.x, travel.y),
            wire::pause(50),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t),
            wire::pause(SETTLE_MS),
        ])
    }

    /// Swipe across `region` in `direction`.
    ///
    /// The stroke starts a third of the region extent behind the region centre
    /// and covers two thirds of the extent.
    pub fn swipe(&mut self, region: Region, direction: SwipeDirection) -> RigResult<SwipeTrace> {
        let rect = self.screen.region_rect(region);
        let center_x = rect.x + rect.width / 2.0 - self.screen.x;
        let center_y = rect.y + rect.height / 2.0 - self.screen.y;

        let (dx, dy) = match direction {
            SwipeDirection::Up => (0.0, -rect.height),
            SwipeDirection::Down => (0.0, rect.height),
            SwipeDirection::Left => (-rect.width, 0.0),
            SwipeDirection::Right => (rect.width, 0.0),
        };
        let px = self.scale.to_steps(center_x - dx / 3.0);
        let py = self.scale.to_steps(center_y - dy / 3.0);
        let start = self.direction.apply_steps(px, py);
        let rel = start - self.position;

        let swipe_x = self.scale.to_steps(dx * SWIPE_SPAN);
        let swipe_y = self.scale.to_steps(dy * SWIPE_SPAN);
        let travel = self.direction.apply_steps(swipe_x, swipe_y);
        self.position = start + travel;

        let trace = SwipeTrace {
            start: (self.scale.to_pixels(px), self.scale.to_pixels(py)),
            delta: (self.scale.to_pixels(swipe_x), self.scale.to_pixels(swipe_y)),
        };
        if self.is_virtual() {
            return Ok(trace);
        }

        self.approach(rel)?;
        self.settle(ActionKind::Swipe)?;

        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::Swipe, height, travel, Duration::ZERO);
        let stroke_ms = move_time_ms(travel, self.config.drag_speed);
        let init = self.config.pen_initial_height;
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, init + height),
            wire::pen_down(t),
            wire::pause(SETTLE_MS),
            wire::mixed_move(stroke_ms, travel.x, travel.y),
            wire::servo(wire::SERVO_UP, init),
            wire::pen_up(t + 50),
            wire::pause(SETTLE_MS),
        ])?;
        Ok(trace)
    }

    // ---------------------------------------------------------------------
    // Plain motion
    // ---------------------------------------------------------------------

    /// Move by `(lx, ly)` centimetres in the arm frame.
    pub fn move_by_cm(&mut self, lx: f64, ly: f64) -> RigResult<()> {
        let delta = StepVector::new(
            (lx * self.config.one_cm_steps) as i64,
            (ly * self.config.one_cm_steps) as i64,
        );
        self.position += delta;
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(delta)
    }

    /// Hover over screen pixel `(x, y)` without touching.
    pub fn move_to(&mut self, x: f64, y: f64) -> RigResult<()> {
        let rel = self.aim_at(x, y);
        if self.is_virtual() {
            return Ok(());
        }
        self.approach(rel)
    }

    pub fn pen_down(&mut self) -> RigResult<()> {
        if self.is_virtual() {
            return Ok(());
        }
        self.settle(ActionKind::PenDown)?;
        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::PenDown, height, StepVector::zeros(), Duration::ZERO);
        self.submit(vec![
            wire::servo(wire::SERVO_DOWN, self.config.pen_initial_height + height),
            wire::pen_down(t),
        ])
    }

    pub fn pen_up(&mut self) -> RigResult<()> {
        if self.is_virtual() {
            return Ok(());
        }
        self.settle(ActionKind::PenUp)?;
        let (height, t) = self.pen_fall();
        self.record_estimate(ActionKind::PenUp, height, StepVector::zeros(), Duration::ZERO);
        self.submit(vec![
            wire::servo(wire::SERVO_UP, self.config.pen_initial_height),
            wire::pen_up(t),
            wire::pause(t),
        ])
    }

    // ---------------------------------------------------------------------
    // Detours
    // ---------------------------------------------------------------------

    /// Move off the screen by the calibrated origin offsets. Used once when a
    /// script starts with the arm parked on the screen origin.
    pub fn detour_from_origin(&mut self) -> RigResult<()> {
        let target = StepVector::new(-self.origin_detour[0], -self.origin_detour[1]);
        self.position = target;
        if self.is_virtual() {
            return Ok(());
        }
        let ms = move_time_ms(target, self.config.motor_speed);
        self.submit(vec![wire::mixed_move(ms, target.x, target.y)])
    }

    /// Park the arm outside the screen in one move and wait for it to stop.
    pub fn move_outside_of_screen(&mut self) -> RigResult<()> {
        match self.detour.full(self.position) {
            DetourDecision::Full(delta) => {
                self.position += delta;
                if self.is_virtual() {
                    return Ok(());
                }
                debug!(dx = delta.x, dy = delta.y, "Full detour");
                self.approach(delta)?;
                self.settle(ActionKind::Detour)
            }
            _ => self.abort_detour(),
        }
    }

    /// Take one detour increment toward the outside of the screen.
    ///
    /// Returns the increment; a zero vector means the parking point has been
    /// reached.
    pub fn step_detour(&mut self) -> RigResult<StepVector> {
        match self.detour.step(self.position) {
            DetourDecision::Step(delta) => {
                self.position += delta;
                if self.is_virtual() {
                    return Ok(delta);
                }
                debug!(dx = delta.x, dy = delta.y, "Detour step");
                self.approach(delta)?;
                Ok(delta)
            }
            _ => self.abort_detour().map(|_| StepVector::zeros()),
        }
    }

    /// Whether the arm currently hides part of `region`.
    pub fn is_blocking(&self, region: Region) -> bool {
        detour::is_blocking(self.position, self.region_extent(region))
    }

    /// Step out of `region` if the arm covers it.
    pub fn detour_step_if_blocking(&mut self, region: Region) -> RigResult<DetourDecision> {
        if !self.is_blocking(region) {
            return Ok(DetourDecision::NotBlocking);
        }
        self.step_detour().map(DetourDecision::Step)
    }

    fn abort_detour(&mut self) -> RigResult<()> {
        warn!(
            x = self.position.x,
            y = self.position.y,
            "Screen is too large to detour; releasing the rig"
        );
        if let Err(e) = self.release() {
            warn!(error = %e, "Release after failed detour reported an error");
        }
        Err(RigError::DetourImpossible)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Return to the screen origin.
    ///
    /// Firmware with `HM` homes on its own; older firmware gets the inverse of
    /// the predicted position.
    pub fn reset(&mut self) -> RigResult<()> {
        let current = self.position;
        self.position = StepVector::zeros();
        if self.is_virtual() {
            return Ok(());
        }
        self.settle(ActionKind::Reset)?;

        let home = self
            .queue
            .as_ref()
            .and_then(CommandQueue::connected_version)
            .is_some_and(|v| v.supports_home());

        let (height, _) = self.pen_fall();
        self.record_estimate(ActionKind::Reset, height, current, Duration::ZERO);
        if home {
            self.submit(vec![wire::home(self.config.motor_speed as u64)])
        } else {
            let ms = move_time_ms(current, self.config.motor_speed);
            self.submit(vec![wire::mixed_move(ms, -current.x, -current.y)])
        }
    }

    /// Wait for the arm to stop, then close the monitor and the queue.
    ///
    /// Idempotent. Every step runs even if an earlier one fails.
    pub fn release(&mut self) -> RigResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut errors = Vec::new();
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.wait_until_drained(ActionKind::Release) {
                errors.push(e);
            }
        }
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.close() {
                errors.push(e);
            }
        }
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.close() {
                errors.push(e);
            }
        }

        info!(errors = errors.len(), "Rig released");
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RigError::ShutdownFailed(errors)),
        }
    }

    // ---------------------------------------------------------------------
    // Camera
    // ---------------------------------------------------------------------

    /// Photograph the screen once the arm has stopped.
    ///
    /// `kind` decides whether the previous action has to drain first.
    pub fn take_photo(&mut self, kind: ActionKind) -> RigResult<Photo> {
        self.photo_index += 1;
        let photo = Photo {
            index: self.photo_index,
            path: self.photo_dir.join(format!("{}.png", self.photo_index)),
        };
        if self.is_virtual() {
            return Ok(photo);
        }
        self.settle(kind)?;
        let monitor = self
            .monitor
            .as_ref()
            .ok_or_else(|| RigError::Capture("no monitor attached".to_string()))?;
        monitor.take_photo(&photo.path)?;
        Ok(photo)
    }

    /// Grab the next live frame while a detour may still be moving.
    pub fn detour_frame(&mut self) -> RigResult<PathBuf> {
        let path = self.photo_dir.join("detour.png");
        if self.is_virtual() {
            return Ok(path);
        }
        self.settle(ActionKind::Detour)?;
        let monitor = self
            .monitor
            .as_ref()
            .ok_or_else(|| RigError::Capture("no monitor attached".to_string()))?;
        monitor.detour_frame(&path)?;
        Ok(path)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Convert a screen pixel to an arm-frame target, record it as the new
    /// position and return the move needed to get there.
    fn aim_at(&mut self, x: f64, y: f64) -> StepVector {
        let target = self.pixel_target(x, y);
        let rel = target - self.position;
        self.position = target;
        rel
    }

    /// Like [`aim_at`](Self::aim_at) for a two-point stroke. Returns the
    /// approach and the stroke vector.
    fn aim_stroke(&mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> (StepVector, StepVector) {
        let (px1, py1) = (self.scale.to_steps(x1), self.scale.to_steps(y1));
        let (px2, py2) = (self.scale.to_steps(x2), self.scale.to_steps(y2));
        let travel = self.direction.apply_steps(px2 - px1, py2 - py1);
        let start = self.direction.apply_steps(px1, py1);
        let rel = start - self.position;
        self.position = self.direction.apply_steps(px2, py2);
        (rel, travel)
    }

    fn pixel_target(&self, x: f64, y: f64) -> StepVector {
        self.direction
            .apply_steps(self.scale.to_steps(x), self.scale.to_steps(y))
    }

    fn region_extent(&self, region: Region) -> Vector2<f64> {
        let rect = self.screen.region_rect(region);
        self.direction.apply(
            self.scale.to_steps_f64(rect.width),
            self.scale.to_steps_f64(rect.height),
        )
    }

    /// Fall height at the current position and the servo time it needs.
    fn pen_fall(&self) -> (i64, u64) {
        let height = self.pen.fall_height(self.position);
        (height, pen_fall_time_ms(height))
    }

    fn record_estimate(&mut self, kind: ActionKind, height: i64, travel: StepVector, press: Duration) {
        self.last_action_duration = self.timing.estimate(kind, height, travel, press);
    }

    /// Travel by `delta` and pause briefly so the arm stops swinging.
    fn approach(&mut self, delta: StepVector) -> RigResult<()> {
        self.settle(ActionKind::Move)?;
        self.record_estimate(ActionKind::Move, 0, delta, Duration::ZERO);
        let ms = move_time_ms(delta, self.config.motor_speed);
        self.submit(vec![
            wire::mixed_move(ms, delta.x, delta.y),
            wire::pause(SETTLE_MS),
        ])
    }

    fn settle(&self, kind: ActionKind) -> RigResult<()> {
        self.queue()?.wait_until_drained(kind)
    }

    fn submit(&self, batch: Vec<String>) -> RigResult<()> {
        self.queue()?.enqueue(batch).map(|_| ())
    }

    fn queue(&self) -> RigResult<&CommandQueue> {
        self.queue.as_ref().ok_or(RigError::QueueClosed)
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        if !self.released && !self.is_virtual() {
            if let Err(e) = self.release() {
                warn!(error = %e, "Release on drop failed");
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    (d.as_secs_f64() * 1000.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_queue::QueueSettings;
    use crate::transport::{self, mock::MockFirmware};

    fn calibration() -> CalibrationRecord {
        CalibrationRecord {
            pixel_to_physical: 20.0,
            direction_matrix: [[1.0, 0.0], [0.0, 1.0]],
            tip_height: 3000,
            origin_detour: [2000, 1000],
            screen: ScreenRect::new(100.0, 50.0, 200.0, 400.0),
            calibrated_at: chrono::Utc::now(),
        }
    }

    fn fast_settings() -> QueueSettings {
        QueueSettings {
            poll_interval: Duration::from_millis(5),
            idle_recheck: Duration::from_millis(5),
            close_grace: Duration::from_millis(5),
            ..QueueSettings::default()
        }
    }

    fn robot_on(fw: &MockFirmware, dir: &std::path::Path) -> Robot {
        let queue = CommandQueue::open(transport::shared(fw.clone()), fast_settings()).unwrap();
        Robot::new(&RobotConfig::default(), &calibration(), Some(queue), None, dir)
    }

    #[test]
    fn test_virtual_click_tracks_position_only() {
        let mut robot = Robot::virtual_debug(&RobotConfig::default(), &calibration(), "/tmp");
        assert!(robot.is_virtual());
        robot.click(100.0, 200.0).unwrap();
        // 100 px / 20 px/cm * 800 steps/cm
        assert_eq!(robot.position(), StepVector::new(4000, 8000));
        assert!(robot.needs_reset());
        assert_eq!(robot.last_action_duration(), Duration::ZERO);
        robot.reset().unwrap();
        assert!(!robot.needs_reset());
    }

    #[test]
    fn test_click_batch_order() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let mut robot = robot_on(&fw, dir.path());

        robot.click(100.0, 200.0).unwrap();
        robot.release().unwrap();

        assert_eq!(
            fw.sent_lines(),
            vec![
                "XM,2400,4000,8000",
                "XM,100,0,0",
                "SC,5,19000",
                "SP,0,300",
                "SC,4,16000",
                "SP,1,350",
                "XM,100,0,0",
            ]
        );
        assert!((robot.last_action_duration().as_secs_f64() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_swipe_trace_and_position() {
        let mut robot = Robot::virtual_debug(&RobotConfig::default(), &calibration(), "/tmp");
        let trace = robot.swipe(Region::FULL, SwipeDirection::Up).unwrap();
        // Centre (100, 200), start one third of 400 px below it.
        assert_eq!(trace.start, (100, 333));
        assert_eq!(trace.delta, (0, -266));
        assert_eq!(robot.position(), StepVector::new(4000, 13333 - 10666));
    }

    #[test]
    fn test_reset_uses_home_on_new_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let mut robot = robot_on(&fw, dir.path());
        robot.move_by_cm(1.0, 2.0).unwrap();
        robot.reset().unwrap();
        robot.release().unwrap();
        assert_eq!(fw.sent_lines().last().map(String::as_str), Some("HM,5000"));
    }

    #[test]
    fn test_reset_inverts_position_on_old_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.5.0").with_time_scale(0.01);
        let mut robot = robot_on(&fw, dir.path());
        robot.move_by_cm(1.0, 2.0).unwrap();
        robot.reset().unwrap();
        robot.release().unwrap();
        // |800 + 1600| / 5000 steps/s
        assert_eq!(
            fw.sent_lines().last().map(String::as_str),
            Some("XM,480,-800,-1600")
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0");
        let mut robot = robot_on(&fw, dir.path());
        robot.release().unwrap();
        robot.release().unwrap();
        assert!(robot.is_released());
        assert!(fw.is_closed());
        assert!(matches!(robot.click(1.0, 1.0), Err(RigError::QueueClosed)));
    }
}
