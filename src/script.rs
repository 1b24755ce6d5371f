//! Test-script actions.
//!
//! [`TestScript`] is the layer a test author talks to: find a widget on the
//! device screen, tap it, assert something appeared. Each action runs the
//! same sequence:
//!
//! 1. get the arm out of the camera's way (full detour, or step detour with
//!    matching after every step),
//! 2. photograph the screen and locate the widget,
//! 3. hand the pixel coordinates to the [`Robot`].
//!
//! Soft queries (`matches`, `assert_exist`, `wait`) report `false` when the
//! widget is absent. Hard actions (`click`, `drag`, ...) put the rig in a safe
//! state (arm home, queue and camera closed) and fail with
//! [`RigError::WidgetNotFound`].
//!
//! Template matching itself lives behind the [`Matcher`] trait, and keyboard
//! geometry behind [`KeyLocator`].

use crate::command::ActionKind;
use crate::config::{RigConfig, ThresholdRelation};
use crate::error::{RigError, RigResult};
use crate::geometry::{Region, StepVector, SwipeDirection};
use crate::keyboard::{parse_keys, KeyLocator, KeyboardArea};
use crate::robot::detour::DetourDecision;
use crate::robot::{Robot, SwipeTrace};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Where a template was found and how well it matched.
///
/// Coordinates are the widget centre in screen pixels, measured from the
/// screen's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MatchResult {
    pub similarity: f64,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Template matching backend.
pub trait Matcher {
    /// Locate `template` in `photo`, restricted to `region` of the screen.
    fn locate(&mut self, template: &str, photo: &Path, region: Region) -> RigResult<MatchResult>;
}

/// Acceptance rule for a similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThreshold {
    pub relation: ThresholdRelation,
    pub value: f64,
}

impl MatchThreshold {
    pub fn accepts(&self, similarity: f64) -> bool {
        self.relation.accepts(similarity, self.value)
    }
}

/// Script-level actions, as far as occlusion avoidance cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    AssertExist,
    AssertNotExist,
    Click,
    DoubleClick,
    Drag,
    Find,
    LongPress,
    LongPressDrag,
    Match,
    PressKeyboard,
    TakeScreenPhoto,
    Wait,
    MoveTo,
    Move,
    Swipe,
    PenDown,
    PenUp,
}

impl ScriptAction {
    /// Whether the arm has to leave the screen before this action looks at it.
    pub fn requires_detour(self) -> bool {
        !matches!(
            self,
            ScriptAction::Move | ScriptAction::Swipe | ScriptAction::PenDown | ScriptAction::PenUp
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptAction::AssertExist => "assert_exist",
            ScriptAction::AssertNotExist => "assert_not_exist",
            ScriptAction::Click => "click",
            ScriptAction::DoubleClick => "double_click",
            ScriptAction::Drag => "drag",
            ScriptAction::Find => "find",
            ScriptAction::LongPress => "long_press",
            ScriptAction::LongPressDrag => "long_press_drag",
            ScriptAction::Match => "match",
            ScriptAction::PressKeyboard => "press_keyboard",
            ScriptAction::TakeScreenPhoto => "take_screen_photo",
            ScriptAction::Wait => "wait",
            ScriptAction::MoveTo => "move_to",
            ScriptAction::Move => "move",
            ScriptAction::Swipe => "swipe",
            ScriptAction::PenDown => "pen_down",
            ScriptAction::PenUp => "pen_up",
        }
    }
}

/// Script behavior knobs.
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    pub threshold: MatchThreshold,
    pub press_time: Duration,
    /// Seconds `wait` keeps polling, once per second.
    pub wait_time_s: u64,
    /// Where a virtual-debug run writes its action log.
    pub action_log: Option<PathBuf>,
}

impl ScriptSettings {
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            threshold: MatchThreshold {
                relation: config.matching.relation,
                value: config.matching.threshold,
            },
            press_time: Duration::from_secs_f64(config.robot.press_time_s),
            wait_time_s: config.matching.wait_time_s,
            action_log: config
                .application
                .virtual_debug
                .then(|| config.application.output_dir.join("actions.json")),
        }
    }
}

/// One entry of the virtual-debug action log.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action: &'static str,
    pub params: serde_json::Value,
    pub matches: Vec<MatchResult>,
    pub positions: Option<Vec<(f64, f64)>>,
}

/// A running test script bound to one rig.
pub struct TestScript<M: Matcher> {
    robot: Robot,
    matcher: M,
    settings: ScriptSettings,
    last_match: MatchResult,
    last_widget: Option<String>,
    screen_shot_index: u64,
    last_photo: Option<PathBuf>,
    action_log: Vec<ActionRecord>,
    keyboard: Option<Box<dyn KeyLocator>>,
    finished: bool,
}

impl<M: Matcher> TestScript<M> {
    /// Take over the rig and move the arm off the screen origin.
    pub fn start(mut robot: Robot, matcher: M, settings: ScriptSettings) -> RigResult<Self> {
        robot.detour_from_origin()?;
        info!(virtual_debug = robot.is_virtual(), "Test script started");
        Ok(Self {
            robot,
            matcher,
            settings,
            last_match: MatchResult::default(),
            last_widget: None,
            screen_shot_index: 0,
            last_photo: None,
            action_log: Vec::new(),
            keyboard: None,
            finished: false,
        })
    }

    /// Attach the locator `press_keyboard` uses.
    pub fn with_keyboard(mut self, locator: impl KeyLocator + 'static) -> Self {
        self.keyboard = Some(Box::new(locator));
        self
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    pub fn last_match(&self) -> MatchResult {
        self.last_match
    }

    pub fn screen_shot_index(&self) -> u64 {
        self.screen_shot_index
    }

    /// Path of the most recent screen photo.
    pub fn last_photo(&self) -> Option<&Path> {
        self.last_photo.as_deref()
    }

    pub fn action_log(&self) -> &[ActionRecord] {
        &self.action_log
    }

    // ---------------------------------------------------------------------
    // Detour
    // ---------------------------------------------------------------------

    /// Clear the camera's view of `region` before `action`.
    ///
    /// Without a widget the arm parks fully outside the screen. With one it
    /// moves out step by step and matches after each step; `true` means the
    /// widget was found on the way and is now the last match.
    pub fn detour(
        &mut self,
        action: ScriptAction,
        widget: Option<&str>,
        region: Region,
    ) -> RigResult<bool> {
        if self.robot.is_virtual() {
            return Ok(false);
        }
        if !action.requires_detour() {
            return Ok(true);
        }
        let Some(widget) = widget else {
            self.robot.move_outside_of_screen()?;
            return Ok(true);
        };

        loop {
            match self.robot.detour_step_if_blocking(region)? {
                DetourDecision::Step(delta) => {
                    if self.matches_during_detour(widget, region)? {
                        return Ok(true);
                    }
                    if delta == StepVector::zeros() {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(false)
    }

    fn matches_during_detour(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        let frame = self.robot.detour_frame()?;
        let result = self.matcher.locate(widget, &frame, region)?;
        if self.settings.threshold.accepts(result.similarity) {
            self.last_match = result;
            return Ok(true);
        }
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Photograph the screen once the arm is still.
    fn snapshot(&mut self, kind: ActionKind) -> RigResult<PathBuf> {
        let photo = self.robot.take_photo(kind)?;
        self.screen_shot_index = photo.index;
        self.last_photo = Some(photo.path.clone());
        Ok(photo.path)
    }

    /// Photograph the screen and locate `widget`. Updates the last match.
    fn check_widget(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        let photo = self.snapshot(ActionKind::Match)?;
        self.last_match = self.matcher.locate(widget, &photo, region)?;
        self.last_widget = None;
        Ok(self.settings.threshold.accepts(self.last_match.similarity))
    }

    /// Coordinates of `widget`, from the last match if it was the last widget
    /// seen, otherwise from a fresh photo.
    fn resolve(&mut self, widget: &str, region: Region) -> RigResult<Option<MatchResult>> {
        if self.last_widget.as_deref() == Some(widget) {
            self.last_widget = None;
            return Ok(Some(self.last_match));
        }
        if self.check_widget(widget, region)? {
            return Ok(Some(self.last_match));
        }
        Ok(None)
    }

    /// Locate `widget` after a full detour and return the raw result.
    pub fn find(&mut self, widget: &str, region: Region) -> RigResult<MatchResult> {
        self.detour(ScriptAction::Find, None, region)?;
        let photo = self.snapshot(ActionKind::Match)?;
        self.last_match = self.matcher.locate(widget, &photo, region)?;
        self.last_widget = Some(widget.to_string());
        let result = self.last_match;
        self.record(
            ScriptAction::Find,
            json!([widget, region.0]),
            vec![result],
            Some(vec![(result.x, result.y)]),
        );
        Ok(result)
    }

    /// Whether `widget` is on screen, matching during the detour when possible.
    pub fn matches(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        let mut found = self.detour(ScriptAction::Match, Some(widget), region)?;
        if !found {
            found = self.check_widget(widget, region)?;
            self.record_query(ScriptAction::Match, widget, region, found);
        }
        self.last_widget = found.then(|| widget.to_string());
        info!(widget, found, "match");
        Ok(found)
    }

    pub fn assert_exist(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.detour(ScriptAction::AssertExist, None, region)?;
        let found = self.check_widget(widget, region)?;
        self.record_query(ScriptAction::AssertExist, widget, region, found);
        info!(widget, found, similarity = self.last_match.similarity, "assert_exist");
        Ok(found)
    }

    pub fn assert_not_exist(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.detour(ScriptAction::AssertNotExist, None, region)?;
        let found = self.check_widget(widget, region)?;
        self.record_query(ScriptAction::AssertNotExist, widget, region, found);
        info!(widget, absent = !found, "assert_not_exist");
        Ok(!found)
    }

    /// Poll for `widget` once a second for the configured wait time.
    pub fn wait(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.detour(ScriptAction::Wait, None, region)?;
        for _ in 0..self.settings.wait_time_s {
            if !self.robot.is_virtual() {
                thread::sleep(WAIT_POLL);
            }
            if self.check_widget(widget, region)? {
                self.record_query(ScriptAction::Wait, widget, region, true);
                info!(widget, "wait succeeded");
                return Ok(true);
            }
        }
        self.record_query(ScriptAction::Wait, widget, region, false);
        warn!(widget, wait_s = self.settings.wait_time_s, "wait timed out");
        Ok(false)
    }

    /// Photograph the whole screen with the arm parked outside it.
    pub fn take_screen_photo(&mut self) -> RigResult<u64> {
        self.detour(ScriptAction::TakeScreenPhoto, None, Region::FULL)?;
        self.snapshot(ActionKind::Photo)?;
        Ok(self.screen_shot_index)
    }

    // ---------------------------------------------------------------------
    // Pointing actions
    // ---------------------------------------------------------------------

    pub fn click(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.tap(ScriptAction::Click, widget, region)
    }

    pub fn double_click(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.tap(ScriptAction::DoubleClick, widget, region)
    }

    pub fn long_press(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.tap(ScriptAction::LongPress, widget, region)
    }

    fn tap(&mut self, action: ScriptAction, widget: &str, region: Region) -> RigResult<bool> {
        if self.detour(action, Some(widget), region)? {
            self.last_widget = Some(widget.to_string());
        }
        let Some(target) = self.resolve(widget, region)? else {
            self.record(action, json!([widget, region.0]), vec![self.last_match], None);
            return self.hard_failure(action, widget);
        };

        self.record(
            action,
            json!([widget, region.0]),
            vec![target],
            Some(vec![(target.x, target.y)]),
        );
        match action {
            ScriptAction::DoubleClick => self.robot.double_click(target.x, target.y)?,
            ScriptAction::LongPress => {
                self.robot.long_press(target.x, target.y, self.settings.press_time)?
            }
            _ => self.robot.click(target.x, target.y)?,
        }
        info!(action = action.as_str(), widget, x = target.x, y = target.y, "Action issued");
        Ok(true)
    }

    pub fn drag(
        &mut self,
        start: &str,
        end: &str,
        start_region: Region,
        end_region: Region,
    ) -> RigResult<bool> {
        self.stroke(ScriptAction::Drag, start, end, start_region, end_region)
    }

    pub fn press_drag(
        &mut self,
        start: &str,
        end: &str,
        start_region: Region,
        end_region: Region,
    ) -> RigResult<bool> {
        self.stroke(ScriptAction::LongPressDrag, start, end, start_region, end_region)
    }

    fn stroke(
        &mut self,
        action: ScriptAction,
        start: &str,
        end: &str,
        start_region: Region,
        end_region: Region,
    ) -> RigResult<bool> {
        self.detour(action, None, start_region)?;
        let params = json!([start, end, start_region.0, end_region.0]);

        // A widget matched by the previous query is reused without a photo.
        let (from, to) = if self.last_widget.as_deref() == Some(end) {
            let to = self.resolve(end, end_region)?;
            (self.resolve(start, start_region)?, to)
        } else {
            let from = self.resolve(start, start_region)?;
            match from {
                Some(_) => (from, self.resolve(end, end_region)?),
                None => (None, None),
            }
        };

        let (Some(from), Some(to)) = (from, to) else {
            let missing = if from.is_none() { start } else { end };
            self.record(action, params, vec![self.last_match], None);
            return self.hard_failure(action, missing);
        };

        self.record(
            action,
            params,
            vec![from, to],
            Some(vec![(from.x, from.y), (to.x, to.y)]),
        );
        match action {
            ScriptAction::LongPressDrag => self.robot.press_drag(
                from.x,
                from.y,
                to.x,
                to.y,
                self.settings.press_time,
            )?,
            _ => self.robot.drag(from.x, from.y, to.x, to.y)?,
        }
        info!(action = action.as_str(), start, end, "Action issued");
        Ok(true)
    }

    /// Swipe across `region`. Returns the stroke in screen pixels.
    pub fn swipe(&mut self, direction: SwipeDirection, region: Region) -> RigResult<SwipeTrace> {
        self.detour(ScriptAction::Swipe, None, region)?;
        self.snapshot(ActionKind::Swipe)?;
        let trace = self.robot.swipe(region, direction)?;
        let (x, y) = (trace.start.0 as f64, trace.start.1 as f64);
        self.record(
            ScriptAction::Swipe,
            json!([direction, region.0]),
            Vec::new(),
            Some(vec![(x, y), (x + trace.delta.0 as f64, y + trace.delta.1 as f64)]),
        );
        Ok(trace)
    }

    /// Type `text` on the on-screen keyboard `keyboard`, one tap per key.
    ///
    /// Special keys are named in brackets, e.g. `"hello[Enter]"`. Every key is
    /// placed before the first tap, so an unknown key types nothing. A
    /// keyboard that is not found, or touches the screen edge, fails like a
    /// missing widget.
    pub fn press_keyboard(&mut self, keyboard: &str, text: &str) -> RigResult<bool> {
        let keys = parse_keys(text)?;
        let mut locator = self.keyboard.take().ok_or_else(|| {
            RigError::Configuration("press_keyboard needs a keyboard locator".to_string())
        })?;
        let typed = self.type_keys(locator.as_mut(), keyboard, text, &keys);
        self.keyboard = Some(locator);
        typed
    }

    fn type_keys(
        &mut self,
        locator: &mut dyn KeyLocator,
        keyboard: &str,
        text: &str,
        keys: &[String],
    ) -> RigResult<bool> {
        self.detour(ScriptAction::PressKeyboard, None, Region::FULL)?;
        let photo = self.snapshot(ActionKind::PressKeyboard)?;
        let params = json!([keyboard, text]);

        let found = locator.locate_keyboard(keyboard, &photo)?;
        self.last_match = found;
        self.last_widget = None;

        let area = KeyboardArea::from_match(&found);
        let screen = self.robot.screen();
        if !(self.settings.threshold.accepts(found.similarity)
            && area.is_inside(screen.width, screen.height))
        {
            self.record(ScriptAction::PressKeyboard, params, vec![found], None);
            return self.hard_failure(ScriptAction::PressKeyboard, keyboard);
        }

        let mut positions = Vec::with_capacity(keys.len());
        for key in keys {
            let position = locator
                .key_position(keyboard, key, area)?
                .ok_or_else(|| RigError::UnknownKey {
                    keyboard: keyboard.to_string(),
                    key: key.clone(),
                })?;
            positions.push(position);
        }

        self.record(
            ScriptAction::PressKeyboard,
            params,
            vec![found],
            Some(positions.clone()),
        );
        for (x, y) in positions {
            self.robot.click(x, y)?;
        }
        info!(keyboard, keys = keys.len(), "Typed on keyboard");
        Ok(true)
    }

    /// Move the arm by centimetres.
    pub fn move_by(&mut self, lx: f64, ly: f64) -> RigResult<()> {
        self.detour(ScriptAction::Move, None, Region::FULL)?;
        self.robot.move_by_cm(lx, ly)
    }

    /// Hover over screen pixel `(x, y)`.
    pub fn move_to(&mut self, x: f64, y: f64) -> RigResult<()> {
        self.detour(ScriptAction::MoveTo, None, Region::FULL)?;
        self.robot.move_to(x, y)
    }

    /// Hover over `widget`.
    pub fn move_to_widget(&mut self, widget: &str, region: Region) -> RigResult<bool> {
        self.detour(ScriptAction::MoveTo, None, region)?;
        if !self.check_widget(widget, region)? {
            self.record(ScriptAction::MoveTo, json!([widget]), vec![self.last_match], None);
            return self.hard_failure(ScriptAction::MoveTo, widget);
        }
        let target = self.last_match;
        self.record(
            ScriptAction::MoveTo,
            json!([widget]),
            vec![target],
            Some(vec![(target.x, target.y)]),
        );
        self.robot.move_to(target.x, target.y)?;
        Ok(true)
    }

    pub fn pen_down(&mut self) -> RigResult<()> {
        self.detour(ScriptAction::PenDown, None, Region::FULL)?;
        self.robot.pen_down()
    }

    pub fn pen_up(&mut self) -> RigResult<()> {
        self.detour(ScriptAction::PenUp, None, Region::FULL)?;
        self.robot.pen_up()
    }

    pub fn move_outside_of_screen(&mut self) -> RigResult<()> {
        self.robot.move_outside_of_screen()
    }

    /// Pause the script. Skipped in virtual debug.
    pub fn sleep(&mut self, duration: Duration) {
        if !self.robot.is_virtual() {
            thread::sleep(duration);
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Photograph the final screen and send the arm home.
    pub fn reset_arms(&mut self) -> RigResult<()> {
        if self.robot.has_monitor() || self.robot.is_virtual() {
            self.snapshot(ActionKind::Reset)?;
        }
        self.robot.reset()
    }

    /// End the run: write the action log in virtual debug, otherwise home the
    /// arm if needed and release the rig. Idempotent.
    pub fn finish(&mut self) -> RigResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if self.robot.is_virtual() {
            return self.write_action_log();
        }
        let reset = if self.robot.needs_reset() {
            self.reset_arms()
        } else {
            Ok(())
        };
        let release = self.robot.release();
        info!("Test script finished");
        match (reset, release) {
            (Ok(()), release) => release,
            (Err(e), Ok(())) => Err(e),
            (Err(a), Err(b)) => Err(RigError::ShutdownFailed(vec![a, b])),
        }
    }

    /// Safe-state a failed hard action.
    fn hard_failure(&mut self, action: ScriptAction, widget: &str) -> RigResult<bool> {
        let similarity = self.last_match.similarity;
        if self.robot.is_virtual() {
            warn!(action = action.as_str(), widget, similarity, "Widget not found");
            return Ok(false);
        }

        warn!(action = action.as_str(), widget, similarity, "Widget not found; resetting the rig");
        if let Err(e) = self.reset_arms() {
            warn!(error = %e, "Reset after a failed action reported an error");
        }
        if let Err(e) = self.robot.release() {
            warn!(error = %e, "Release after a failed action reported an error");
        }
        self.finished = true;
        Err(RigError::WidgetNotFound {
            widget: widget.to_string(),
            similarity,
        })
    }

    // ---------------------------------------------------------------------
    // Virtual-debug action log
    // ---------------------------------------------------------------------

    fn record_query(&mut self, action: ScriptAction, widget: &str, region: Region, found: bool) {
        let result = self.last_match;
        let positions = found.then(|| vec![(result.x, result.y)]);
        self.record(action, json!([widget, region.0]), vec![result], positions);
    }

    fn record(
        &mut self,
        action: ScriptAction,
        params: serde_json::Value,
        matches: Vec<MatchResult>,
        positions: Option<Vec<(f64, f64)>>,
    ) {
        if !self.robot.is_virtual() {
            return;
        }
        self.action_log.push(ActionRecord {
            action: action.as_str(),
            params,
            matches,
            positions,
        });
    }

    fn write_action_log(&self) -> RigResult<()> {
        let Some(path) = &self.settings.action_log else {
            return Ok(());
        };
        let screen = self.robot.screen();
        let document = json!({
            "dev_pos": [screen.x, screen.y, screen.x + screen.width, screen.y + screen.height],
            "actions": self.action_log,
        });
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
        info!(path = %path.display(), actions = self.action_log.len(), "Wrote action log");
        Ok(())
    }
}

impl<M: Matcher> Drop for TestScript<M> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "Finishing the script on drop failed");
        }
    }
}

/// Poll period of `wait`.
const WAIT_POLL: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::command_queue::{CommandQueue, QueueSettings};
    use crate::config::RobotConfig;
    use crate::geometry::ScreenRect;
    use crate::monitor::{mock::MockCamera, MonitorSettings, SutMonitor};
    use crate::transport::{self, mock::MockFirmware};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays canned results and remembers which photos it was shown.
    #[derive(Default, Clone)]
    struct ScriptedMatcher {
        replies: Arc<Mutex<VecDeque<MatchResult>>>,
        seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ScriptedMatcher {
        fn push(&self, similarity: f64, x: f64, y: f64) {
            self.replies.lock().push_back(MatchResult {
                similarity,
                x,
                y,
                w: 10.0,
                h: 10.0,
            });
        }

        fn seen(&self) -> Vec<PathBuf> {
            self.seen.lock().clone()
        }
    }

    impl Matcher for ScriptedMatcher {
        fn locate(&mut self, _template: &str, photo: &Path, _region: Region) -> RigResult<MatchResult> {
            self.seen.lock().push(photo.to_path_buf());
            Ok(self.replies.lock().pop_front().unwrap_or_default())
        }
    }

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

    fn settings(action_log: Option<PathBuf>) -> ScriptSettings {
        ScriptSettings {
            threshold: MatchThreshold {
                relation: ThresholdRelation::GreaterOrEqual,
                value: 0.8,
            },
            press_time: Duration::from_millis(200),
            wait_time_s: 2,
            action_log,
        }
    }

    fn rig(fw: &MockFirmware, dir: &Path) -> Robot {
        let queue = CommandQueue::open(
            transport::shared(fw.clone()),
            QueueSettings {
                poll_interval: Duration::from_millis(5),
                idle_recheck: Duration::from_millis(5),
                close_grace: Duration::from_millis(5),
                ..QueueSettings::default()
            },
        )
        .unwrap();
        let monitor = SutMonitor::start(
            Box::new(MockCamera::new(8, 8).with_interval(Duration::from_millis(2))),
            None,
            MonitorSettings {
                detour_pre_sleep: Duration::ZERO,
                ..MonitorSettings::default()
            },
        )
        .unwrap();
        Robot::new(&RobotConfig::default(), &calibration(), Some(queue), Some(monitor), dir)
    }

    #[test]
    fn test_start_leaves_origin() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let mut script =
            TestScript::start(rig(&fw, dir.path()), ScriptedMatcher::default(), settings(None))
                .unwrap();
        script.finish().unwrap();

        let sent = fw.sent_lines();
        // max(|-2000 - 1000|, |-2000 + 1000|) / 5000 steps/s
        assert_eq!(sent.first().map(String::as_str), Some("XM,600,-2000,-1000"));
        assert!(fw.is_closed());
    }

    #[test]
    fn test_click_found_widget() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let matcher = ScriptedMatcher::default();
        matcher.push(0.95, 100.0, 200.0);

        let mut script = TestScript::start(rig(&fw, dir.path()), matcher.clone(), settings(None))
            .unwrap();
        assert!(script.click("ok_button", Region::FULL).unwrap());

        assert_eq!(script.screen_shot_index(), 1);
        let photo = script.last_photo().unwrap().to_path_buf();
        assert_eq!(photo, dir.path().join("1.png"));
        assert!(photo.exists());
        assert_eq!(matcher.seen(), vec![photo]);
        // Arm sits on the widget: (100, 200) px at 40 steps per pixel.
        assert_eq!(script.robot().position(), StepVector::new(4000, 8000));
        script.finish().unwrap();
    }

    #[test]
    fn test_click_missing_widget_safe_states_the_rig() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let matcher = ScriptedMatcher::default();
        matcher.push(0.3, 100.0, 200.0);

        let mut script = TestScript::start(rig(&fw, dir.path()), matcher, settings(None)).unwrap();
        let err = script.click("ok_button", Region::FULL).unwrap_err();

        match err {
            RigError::WidgetNotFound { widget, similarity } => {
                assert_eq!(widget, "ok_button");
                assert!((similarity - 0.3).abs() < 1e-9);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(script.robot().is_released());
        assert!(fw.is_closed());
        // Nothing but the origin detour and the reset reached the controller.
        assert!(!fw.sent_lines().iter().any(|l| l.starts_with("SC,")));
    }

    #[test]
    fn test_soft_queries_report_absence() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let matcher = ScriptedMatcher::default();
        matcher.push(0.1, 0.0, 0.0);
        matcher.push(0.1, 0.0, 0.0);

        let mut script = TestScript::start(rig(&fw, dir.path()), matcher, settings(None)).unwrap();
        assert!(!script.assert_exist("banner", Region::FULL).unwrap());
        assert!(script.assert_not_exist("banner", Region::FULL).unwrap());
        assert!(!script.robot().is_released());
        script.finish().unwrap();
    }

    #[test]
    fn test_match_during_detour_steps() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let matcher = ScriptedMatcher::default();
        matcher.push(0.95, 100.0, 200.0);
        matcher.push(0.9, 150.0, 100.0);

        let mut script = TestScript::start(rig(&fw, dir.path()), matcher.clone(), settings(None))
            .unwrap();
        script.click("ok_button", Region::FULL).unwrap();
        assert!(script.robot().is_blocking(Region::FULL));

        assert!(script.matches("ok_button", Region::FULL).unwrap());
        // Found on the first detour step; no full photo was needed.
        assert_eq!(matcher.seen().last(), Some(&dir.path().join("detour.png")));
        assert_eq!(script.screen_shot_index(), 1);
        assert_eq!(script.last_match().x, 150.0);
        // From x = 4000 toward the parking line at -2000, stopping 2000 short.
        assert!(fw.sent_lines().contains(&"XM,800,-4000,0".to_string()));
        assert_eq!(script.robot().position(), StepVector::new(0, 8000));

        // The widget just matched is clicked without another photo.
        script.click("ok_button", Region::FULL).unwrap();
        assert_eq!(matcher.seen().len(), 2);
        assert_eq!(script.robot().position(), StepVector::new(6000, 4000));
        script.finish().unwrap();
    }

    #[test]
    fn test_virtual_run_writes_action_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out").join("actions.json");
        let matcher = ScriptedMatcher::default();
        matcher.push(0.9, 50.0, 60.0);
        matcher.push(0.2, 0.0, 0.0);

        let robot = Robot::virtual_debug(&RobotConfig::default(), &calibration(), dir.path());
        let mut script = TestScript::start(robot, matcher, settings(Some(log.clone()))).unwrap();
        assert!(script.click("ok_button", Region::FULL).unwrap());
        // Virtual runs never safe-state the rig.
        assert!(!script.double_click("missing", Region::FULL).unwrap());
        let trace = script.swipe(SwipeDirection::Up, Region::FULL).unwrap();
        assert_eq!(trace.delta.0, 0);
        assert_eq!(script.action_log().len(), 3);
        script.finish().unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&log).unwrap()).unwrap();
        assert_eq!(doc["dev_pos"], json!([100.0, 50.0, 300.0, 450.0]));
        let actions = doc["actions"].as_array().unwrap();
        assert_eq!(actions[0]["action"], "click");
        assert_eq!(actions[0]["positions"], json!([[50.0, 60.0]]));
        assert_eq!(actions[1]["action"], "double_click");
        assert!(actions[1]["positions"].is_null());
        assert_eq!(actions[2]["action"], "swipe");
    }

    /// Keyboard at a fixed spot with two keys: `a` on the left, `Enter` on
    /// the right.
    struct TwoKeys(MatchResult);

    impl KeyLocator for TwoKeys {
        fn locate_keyboard(&mut self, _keyboard: &str, _photo: &Path) -> RigResult<MatchResult> {
            Ok(self.0)
        }

        fn key_position(
            &self,
            _keyboard: &str,
            key: &str,
            area: KeyboardArea,
        ) -> RigResult<Option<(f64, f64)>> {
            Ok(match key {
                "a" => Some(area.point(0.25, 0.5)),
                "Enter" => Some(area.point(0.75, 0.5)),
                _ => None,
            })
        }
    }

    fn keyboard_at(similarity: f64, x: f64) -> TwoKeys {
        TwoKeys(MatchResult {
            similarity,
            x,
            y: 300.0,
            w: 160.0,
            h: 80.0,
        })
    }

    fn taps(fw: &MockFirmware) -> usize {
        fw.sent_lines().iter().filter(|l| l.starts_with("SC,5,")).count()
    }

    #[test]
    fn test_press_keyboard_taps_each_key() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let mut script =
            TestScript::start(rig(&fw, dir.path()), ScriptedMatcher::default(), settings(None))
                .unwrap()
                .with_keyboard(keyboard_at(0.9, 100.0));

        assert!(script.press_keyboard("qwerty", "a[Enter]").unwrap());
        assert_eq!(taps(&fw), 2);
        assert_eq!(script.screen_shot_index(), 1);
        // Keyboard box (20, 260) 160 x 80; Enter at (140, 300) px.
        assert_eq!(script.robot().position(), StepVector::new(5600, 12000));
        script.finish().unwrap();
    }

    #[test]
    fn test_press_keyboard_unknown_key_types_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        let mut script =
            TestScript::start(rig(&fw, dir.path()), ScriptedMatcher::default(), settings(None))
                .unwrap()
                .with_keyboard(keyboard_at(0.9, 100.0));

        let err = script.press_keyboard("qwerty", "a[Tab]").unwrap_err();
        assert!(matches!(err, RigError::UnknownKey { ref key, .. } if key == "Tab"));
        assert_eq!(taps(&fw), 0);
        assert!(!script.robot().is_released());

        // The locator is still attached after a failure.
        assert!(script.press_keyboard("qwerty", "a").unwrap());
        assert_eq!(taps(&fw), 1);
        script.finish().unwrap();
    }

    #[test]
    fn test_press_keyboard_off_screen_safe_states_the_rig() {
        let dir = tempfile::tempdir().unwrap();
        let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
        // Box from x = -70: matched, but hanging off the left edge.
        let mut script =
            TestScript::start(rig(&fw, dir.path()), ScriptedMatcher::default(), settings(None))
                .unwrap()
                .with_keyboard(keyboard_at(0.95, 10.0));

        let err = script.press_keyboard("qwerty", "a").unwrap_err();
        assert!(matches!(err, RigError::WidgetNotFound { ref widget, .. } if widget == "qwerty"));
        assert!(script.robot().is_released());
        assert!(fw.is_closed());
        assert_eq!(taps(&fw), 0);
    }

    #[test]
    fn test_press_keyboard_needs_a_visible_keyboard() {
        let dir = tempfile::tempdir().unwrap();
        let robot = Robot::virtual_debug(&RobotConfig::default(), &calibration(), dir.path());
        let mut script =
            TestScript::start(robot, ScriptedMatcher::default(), settings(None)).unwrap();
        assert!(matches!(
            script.press_keyboard("qwerty", "a"),
            Err(RigError::Configuration(_))
        ));
        assert!(matches!(
            script.press_keyboard("qwerty", "a[Ent"),
            Err(RigError::InvalidKeyText(_))
        ));

        // A poor match is a soft failure in virtual debug.
        let mut script = script.with_keyboard(keyboard_at(0.2, 100.0));
        assert!(!script.press_keyboard("qwerty", "a").unwrap());
        assert_eq!(script.action_log().len(), 1);
        assert_eq!(script.action_log()[0].action, "press_keyboard");
    }

    #[test]
    fn test_requires_detour() {
        assert!(ScriptAction::Click.requires_detour());
        assert!(ScriptAction::TakeScreenPhoto.requires_detour());
        assert!(!ScriptAction::Swipe.requires_detour());
        assert!(!ScriptAction::PenUp.requires_detour());
    }
}
