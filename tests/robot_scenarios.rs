//! Motion planner scenarios against the simulated controller.

use nalgebra::Vector2;
use proptest::prelude::*;
use std::time::Duration;
use stylus_rig::calibration::CalibrationRecord;
use stylus_rig::command::ActionKind;
use stylus_rig::command_queue::{CommandQueue, QueueSettings};
use stylus_rig::config::{RigConfig, RobotConfig};
use stylus_rig::error::RigError;
use stylus_rig::geometry::{Region, ScreenRect, StepVector};
use stylus_rig::monitor::mock::MockCamera;
use stylus_rig::robot::detour::Evadability;
use stylus_rig::robot::timing::DurationModel;
use stylus_rig::robot::Robot;
use stylus_rig::transport::{self, mock::MockFirmware};

fn calibration(screen: ScreenRect) -> CalibrationRecord {
    CalibrationRecord {
        pixel_to_physical: 20.0,
        direction_matrix: [[1.0, 0.0], [0.0, 1.0]],
        tip_height: 3000,
        origin_detour: [2000, 1000],
        screen,
        calibrated_at: chrono::Utc::now(),
    }
}

fn phone() -> ScreenRect {
    ScreenRect::new(100.0, 50.0, 200.0, 400.0)
}

fn rig(fw: &MockFirmware, screen: ScreenRect) -> Robot {
    let queue = CommandQueue::open(
        transport::shared(fw.clone()),
        QueueSettings {
            poll_interval: Duration::from_millis(5),
            idle_recheck: Duration::from_millis(5),
            close_grace: Duration::from_millis(5),
            ..QueueSettings::default()
        },
    )
    .expect("Failed to open command queue");
    Robot::new(
        &RobotConfig::default(),
        &calibration(screen),
        Some(queue),
        None,
        std::env::temp_dir(),
    )
}

#[test]
fn test_click_sequence_and_estimate() {
    let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
    let mut robot = rig(&fw, phone());

    robot.click(50.0, 100.0).unwrap();
    let queue = robot.command_queue().unwrap();
    queue.wait_drained().unwrap();

    // Approach: (2000, 4000) steps keeps motor A busy for 6000 steps at
    // 5000 steps/s. Pen batch: fall 3000 units from 16000 takes 300 ms.
    assert_eq!(
        fw.sent_lines(),
        [
            "XM,1200,2000,4000",
            "XM,100,0,0",
            "SC,5,19000",
            "SP,0,300",
            "SC,4,16000",
            "SP,1,350",
            "XM,100,0,0",
        ]
    );

    // The seven commands are chained back to back, so the projected end is
    // the first start plus every embedded duration.
    let history = queue.history();
    assert_eq!(history.len(), 7);
    let embedded: Duration = history.iter().map(|c| c.estimated_duration).sum();
    assert_eq!(embedded, Duration::from_millis(2050));
    let expected_end =
        history[0].estimated_start + chrono::Duration::from_std(embedded).unwrap();
    assert_eq!(queue.estimated_queue_end_time(), expected_end);
    for pair in history.windows(2) {
        assert_eq!(pair[1].estimated_start, pair[0].estimated_end());
    }

    assert!(robot.last_action_duration() > Duration::ZERO);
    assert_eq!(robot.position(), StepVector::new(2000, 4000));

    robot.release().unwrap();
    assert_eq!(fw.step_position(), (2000, 4000));
}

#[test]
fn test_detour_on_oversized_screen_is_fatal() {
    let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
    // 50 cm square: wider than the arm on both axes.
    let mut robot = rig(&fw, ScreenRect::new(0.0, 0.0, 1000.0, 1000.0));
    assert!(!robot.evadability().any());

    let err = robot.move_outside_of_screen().unwrap_err();
    assert!(matches!(err, RigError::DetourImpossible));
    assert!(err.is_fatal());
    assert!(fw.sent_lines().is_empty());
    assert!(robot.is_released());
    assert!(fw.is_closed());
}

#[test]
fn test_step_detour_uncovers_region() {
    let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
    let mut robot = rig(&fw, phone());
    robot.click(150.0, 300.0).unwrap();
    assert!(robot.is_blocking(Region::FULL));

    let mut steps = 0;
    while robot.is_blocking(Region::FULL) {
        robot.step_detour().unwrap();
        steps += 1;
        assert!(steps < 10, "detour did not converge");
    }
    // x = 6000 is right of centre, so the arm leaves through the far side.
    // The 4000-step remainder is within the step threshold and taken at once.
    assert_eq!(steps, 1);
    assert_eq!(robot.position(), StepVector::new(10000, 12000));

    // Coverage is judged against the region's size: a quarter-size region
    // (2000 x 4000 steps) is clear of an arm sitting exactly on its corner.
    robot.click(50.0, 100.0).unwrap();
    assert!(robot.is_blocking(Region::FULL));
    assert!(!robot.is_blocking(Region([0.0, 0.0, 0.25, 0.25])));
    robot.release().unwrap();
}

fn rig_config(dir: &std::path::Path) -> RigConfig {
    let calibration_path = dir.join("calibration.json");
    calibration(phone()).save(&calibration_path).unwrap();

    let mut config = RigConfig::default();
    config.application.output_dir = dir.join("out");
    config.application.calibration_path = calibration_path;
    config.queue.capacity = 2;
    config.queue.poll_interval_ms = 5;
    config.queue.idle_recheck_ms = 5;
    config.queue.close_grace_ms = 5;
    config.monitor.detour_pre_sleep_ms = 0;
    config
}

#[test]
fn test_rig_from_config_wires_every_section() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = rig_config(dir.path());
    config.monitor.record_video = true;
    config.monitor.rotation_degrees = 90;

    let fw = MockFirmware::new("2.7.0").with_time_scale(0.01);
    fw.set_pen_down(true);
    let camera = MockCamera::new(16, 12).with_interval(Duration::from_millis(2));
    let mut robot =
        Robot::from_config(&config, transport::shared(fw.clone()), Some(Box::new(camera)))
            .unwrap();

    assert!(!robot.is_virtual());
    assert!(robot.has_monitor());
    assert_eq!(robot.screen(), phone());
    assert_eq!(robot.command_queue().map(CommandQueue::capacity), Some(2));
    // The pen was lowered at connect and is lifted before anything else.
    assert_eq!(fw.sent_lines(), ["SP,1"]);

    let photo = robot.take_photo(ActionKind::Photo).unwrap();
    assert_eq!(photo.path, dir.path().join("out").join("1.png"));
    let saved = image::open(&photo.path).unwrap();
    assert_eq!((saved.width(), saved.height()), (12, 16));

    robot.release().unwrap();
    assert!(fw.is_closed());
    let frames = std::fs::read_dir(dir.path().join("out").join("video"))
        .unwrap()
        .count();
    assert!(frames > 0);
}

#[test]
fn test_virtual_rig_from_config_leaves_controller_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = rig_config(dir.path());
    config.application.virtual_debug = true;

    let fw = MockFirmware::new("2.7.0");
    let mut robot = Robot::from_config(&config, transport::shared(fw.clone()), None).unwrap();
    assert!(robot.is_virtual());
    robot.click(50.0, 100.0).unwrap();
    assert_eq!(robot.position(), StepVector::new(2000, 4000));
    assert!(fw.events().is_empty());
}

#[test]
fn test_rig_from_config_needs_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = rig_config(dir.path());
    config.application.calibration_path = dir.path().join("missing.json");

    let fw = MockFirmware::new("2.7.0");
    assert!(Robot::from_config(&config, transport::shared(fw.clone()), None).is_err());
    assert!(fw.events().is_empty());
}

#[test]
fn test_evadability_boundary_is_inclusive() {
    let range = Vector2::new(24000.0, 16800.0);
    let margin = Vector2::new(5600.0, 4000.0);

    let fits = Evadability::analyze(Vector2::new(18400.0, 12800.0), range, margin);
    assert!(fits.x && fits.y);

    let too_big = Evadability::analyze(Vector2::new(18401.0, 12801.0), range, margin);
    assert!(!too_big.x && !too_big.y);
    assert!(!too_big.any());

    // Each axis is judged by its own extent.
    let wide = Evadability::analyze(Vector2::new(18401.0, 100.0), range, margin);
    assert!(!wide.x && wide.y);
    let tall = Evadability::analyze(Vector2::new(100.0, 12801.0), range, margin);
    assert!(tall.x && !tall.y);
}

proptest! {
    #[test]
    fn prop_estimates_grow_with_travel_and_press(
        short in 0i64..20_000,
        extra in 0i64..20_000,
        press_ms in 0u64..3000,
        more_ms in 0u64..3000,
    ) {
        let model = DurationModel { motor_speed: 5000.0, drag_speed: 10_000.0 };
        let near = StepVector::new(short, short / 2);
        let far = StepVector::new(short + extra, (short + extra) / 2);
        let press = Duration::from_millis(press_ms);
        let longer = Duration::from_millis(press_ms + more_ms);

        for kind in [ActionKind::Drag, ActionKind::Swipe, ActionKind::PressDrag, ActionKind::Move] {
            prop_assert!(
                model.estimate(kind, 3000, near, press) <= model.estimate(kind, 3000, far, press)
            );
        }
        prop_assert!(
            model.estimate(ActionKind::LongPress, 3000, near, press)
                <= model.estimate(ActionKind::LongPress, 3000, near, longer)
        );
    }
}
