//! Rig configuration using Figment
//!
//! Strongly-typed configuration for the serial link, the command queue, the
//! motion planner, the capture monitor and template matching.
//! Configuration is loaded from:
//! 1. `config/rig.toml` (base configuration)
//! 2. Environment variables (prefixed with `STYLUS_RIG_`)
//!
//! # Environment Variable Overrides
//!
//! Key paths are separated by a double underscore so that field names keep
//! their own underscores:
//!
//! ```text
//! STYLUS_RIG_APPLICATION__LOG_LEVEL=debug
//! STYLUS_RIG_SERIAL__PORT=/dev/ttyUSB0
//! STYLUS_RIG_QUEUE__POLL_INTERVAL_MS=50
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stylus_rig::config::RigConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RigConfig::load()?;
//!     println!("Rig: {}", config.application.name);
//!     println!("FIFO poll: {:?}", config.queue.poll_interval());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::RigError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::LoadError(e) => crate::error::RigError::Config(e),
            ConfigError::ValidationError(msg) => crate::error::RigError::Configuration(msg),
        }
    }
}

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link to the motor controller
    #[serde(default)]
    pub serial: SerialConfig,
    /// Command queue pacing
    #[serde(default)]
    pub queue: QueueConfig,
    /// Motion planner constants
    #[serde(default)]
    pub robot: RobotConfig,
    /// Capture monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Template matching acceptance
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Rig name used in logs
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,
    /// Plan motion without talking to hardware
    #[serde(default)]
    pub virtual_debug: bool,
    /// Directory for photos, detour frames and video
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Calibration record location
    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Explicit port; when absent the port is found by manufacturer
    #[serde(default)]
    pub port: Option<String>,
    /// Substring of the USB manufacturer string of the controller
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
}

/// Command queue pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending commands allowed ahead of the firmware
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Sleep between FIFO polls while the firmware buffer is full
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Re-check period for motor idleness when no new work arrives
    #[serde(default = "default_idle_recheck")]
    pub idle_recheck_ms: u64,
    /// Double the FIFO poll interval on every consecutive full reply
    #[serde(default)]
    pub poll_backoff: bool,
    /// Upper bound for the backed-off poll interval
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Send attempts per command before the queue faults
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    /// Drain wait limit; absent means wait forever
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
    /// How long `open` watches the worker for an early exit
    #[serde(default = "default_startup_probe")]
    pub startup_probe_ms: u64,
    /// Extra sleep after the estimated end time during close
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
}

/// Motion planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Motor steps per centimetre of travel
    #[serde(default = "default_one_cm_steps")]
    pub one_cm_steps: f64,
    /// Travel speed in steps per second
    #[serde(default = "default_motor_speed")]
    pub motor_speed: f64,
    /// Speed used while the pen is down (drag, swipe)
    #[serde(default = "default_drag_speed")]
    pub drag_speed: f64,
    /// Mechanical travel range in centimetres, X then Y
    #[serde(default = "default_arm_range")]
    pub arm_range_cm: [f64; 2],
    /// Servo position with the pen lifted
    #[serde(default = "default_pen_initial_height")]
    pub pen_initial_height: i64,
    /// Height sag across the travel range, X then Y
    #[serde(default)]
    pub height_error: [f64; 2],
    /// Long-press dwell in seconds
    #[serde(default = "default_press_time")]
    pub press_time_s: f64,
    /// Interval between the taps of a double click, in seconds
    #[serde(default = "default_double_click_time")]
    pub double_click_time_s: f64,
    /// Remaining distance (steps) above which a detour is split into steps
    #[serde(default = "default_detour_step_threshold")]
    pub detour_step_threshold: i64,
    /// Size of a single detour step in steps
    #[serde(default = "default_detour_step_distance")]
    pub detour_step_distance: i64,
    /// Safety margin subtracted from the arm range, X then Y, in centimetres
    #[serde(default = "default_evade_margin")]
    pub evade_margin_cm: [f64; 2],
    /// How far past the screen edge the arm parks on X, in steps
    #[serde(default = "default_outside_distance")]
    pub outside_distance: i64,
    /// Offset from the far screen edge used as the Y parking line, in steps
    #[serde(default = "default_y_side_offset")]
    pub y_side_offset: i64,
}

/// Capture monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Write every frame to the video sink
    #[serde(default)]
    pub record_video: bool,
    /// How long startup waits for the first frame
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,
    /// Sleep before grabbing a detour frame
    #[serde(default = "default_detour_pre_sleep")]
    pub detour_pre_sleep_ms: u64,
    /// Throw away one frame before saving a photo
    #[serde(default = "default_true")]
    pub discard_frame_before_photo: bool,
    /// Clockwise rotation applied to every frame (0, 90, 180, 270)
    #[serde(default)]
    pub rotation_degrees: u32,
}

/// How a similarity score is compared with the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdRelation {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl ThresholdRelation {
    /// Whether `score` is acceptable against `threshold`.
    pub fn accepts(self, score: f64, threshold: f64) -> bool {
        match self {
            ThresholdRelation::Greater => score > threshold,
            ThresholdRelation::GreaterOrEqual => score >= threshold,
            ThresholdRelation::Less => score < threshold,
            ThresholdRelation::LessOrEqual => score <= threshold,
        }
    }
}

/// Template matching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_relation")]
    pub relation: ThresholdRelation,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Seconds `wait` keeps looking for a widget
    #[serde(default = "default_wait_time")]
    pub wait_time_s: u64,
}

fn default_app_name() -> String {
    "stylus-rig".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("config/calibration.json")
}

fn default_manufacturer() -> String {
    "SchmalzHaus".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_serial_timeout() -> u64 {
    500
}

fn default_capacity() -> usize {
    3
}

fn default_poll_interval() -> u64 {
    100
}

fn default_idle_recheck() -> u64 {
    100
}

fn default_max_poll_interval() -> u64 {
    1000
}

fn default_send_retries() -> u32 {
    3
}

fn default_startup_probe() -> u64 {
    100
}

fn default_close_grace() -> u64 {
    100
}

fn default_one_cm_steps() -> f64 {
    800.0
}

fn default_motor_speed() -> f64 {
    5000.0
}

fn default_drag_speed() -> f64 {
    10_000.0
}

fn default_arm_range() -> [f64; 2] {
    [30.0, 21.0]
}

fn default_pen_initial_height() -> i64 {
    16000
}

fn default_press_time() -> f64 {
    1.0
}

fn default_double_click_time() -> f64 {
    0.1
}

fn default_detour_step_threshold() -> i64 {
    4000
}

fn default_detour_step_distance() -> i64 {
    2000
}

fn default_evade_margin() -> [f64; 2] {
    [7.0, 5.0]
}

fn default_outside_distance() -> i64 {
    2000
}

fn default_y_side_offset() -> i64 {
    1500
}

fn default_startup_grace() -> u64 {
    2000
}

fn default_detour_pre_sleep() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_relation() -> ThresholdRelation {
    ThresholdRelation::GreaterOrEqual
}

fn default_threshold() -> f64 {
    0.8
}

fn default_wait_time() -> u64 {
    5
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            json_logs: false,
            virtual_debug: false,
            output_dir: default_output_dir(),
            calibration_path: default_calibration_path(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            manufacturer: default_manufacturer(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            poll_interval_ms: default_poll_interval(),
            idle_recheck_ms: default_idle_recheck(),
            poll_backoff: false,
            max_poll_interval_ms: default_max_poll_interval(),
            send_retries: default_send_retries(),
            drain_timeout_ms: None,
            startup_probe_ms: default_startup_probe(),
            close_grace_ms: default_close_grace(),
        }
    }
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            one_cm_steps: default_one_cm_steps(),
            motor_speed: default_motor_speed(),
            drag_speed: default_drag_speed(),
            arm_range_cm: default_arm_range(),
            pen_initial_height: default_pen_initial_height(),
            height_error: [0.0, 0.0],
            press_time_s: default_press_time(),
            double_click_time_s: default_double_click_time(),
            detour_step_threshold: default_detour_step_threshold(),
            detour_step_distance: default_detour_step_distance(),
            evade_margin_cm: default_evade_margin(),
            outside_distance: default_outside_distance(),
            y_side_offset: default_y_side_offset(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            record_video: false,
            startup_grace_ms: default_startup_grace(),
            detour_pre_sleep_ms: default_detour_pre_sleep(),
            discard_frame_before_photo: true,
            rotation_degrees: 0,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            relation: default_relation(),
            threshold: default_threshold(),
            wait_time_s: default_wait_time(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    ///
    /// Configuration is loaded in this order of precedence (highest to lowest):
    /// 1. Environment variables (`STYLUS_RIG_` prefix)
    /// 2. `config/rig.toml`
    /// 3. Built-in defaults
    ///
    /// After loading, configuration is validated.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STYLUS_RIG_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue.capacity must be at least 1".to_string(),
            ));
        }

        if self.queue.poll_interval_ms == 0 || self.queue.idle_recheck_ms == 0 {
            return Err(ConfigError::ValidationError(
                "queue poll and idle re-check intervals must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_poll_interval_ms < self.queue.poll_interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "queue.max_poll_interval_ms ({}) is below queue.poll_interval_ms ({})",
                self.queue.max_poll_interval_ms, self.queue.poll_interval_ms
            )));
        }

        if self.queue.send_retries == 0 {
            return Err(ConfigError::ValidationError(
                "queue.send_retries must be at least 1".to_string(),
            ));
        }

        let robot = &self.robot;
        for (name, value) in [
            ("one_cm_steps", robot.one_cm_steps),
            ("motor_speed", robot.motor_speed),
            ("drag_speed", robot.drag_speed),
            ("arm_range_cm[0]", robot.arm_range_cm[0]),
            ("arm_range_cm[1]", robot.arm_range_cm[1]),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "robot.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        // EBB step generation tops out at 25 kSteps/s per motor
        if robot.motor_speed > 25_000.0 || robot.drag_speed > 25_000.0 {
            return Err(ConfigError::ValidationError(
                "robot speeds must not exceed 25000 steps/s".to_string(),
            ));
        }

        if robot.press_time_s < 0.0 || robot.double_click_time_s < 0.0 {
            return Err(ConfigError::ValidationError(
                "robot press and double click times must not be negative".to_string(),
            ));
        }

        if robot.detour_step_distance <= 0 || robot.detour_step_threshold < 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid detour stepping (threshold {}, distance {})",
                robot.detour_step_threshold, robot.detour_step_distance
            )));
        }

        // A step longer than the threshold can overshoot the remaining
        // distance and oscillate around the target.
        if robot.detour_step_distance > robot.detour_step_threshold {
            return Err(ConfigError::ValidationError(format!(
                "robot.detour_step_distance ({}) exceeds robot.detour_step_threshold ({})",
                robot.detour_step_distance, robot.detour_step_threshold
            )));
        }

        if self.monitor.rotation_degrees % 90 != 0 || self.monitor.rotation_degrees >= 360 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid monitor.rotation_degrees {}. Must be 0, 90, 180 or 270",
                self.monitor.rotation_degrees
            )));
        }

        if self.monitor.startup_grace_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.startup_grace_ms must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.matching.threshold) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid matching.threshold {}. Must be within 0.0-1.0",
                self.matching.threshold
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.capacity, 3);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(100));
        assert!(config.queue.drain_timeout().is_none());
    }

    #[test]
    fn test_detour_step_longer_than_threshold() {
        let mut config = RigConfig::default();
        config.robot.detour_step_threshold = 4000;
        config.robot.detour_step_distance = 4000;
        assert!(config.validate().is_ok());

        config.robot.detour_step_distance = 4001;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("detour_step_distance"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "verbose".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = RigConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_ceiling_below_interval_rejected() {
        let mut config = RigConfig::default();
        config.queue.poll_interval_ms = 200;
        config.queue.max_poll_interval_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_rotation() {
        let mut config = RigConfig::default();
        config.monitor.rotation_degrees = 45;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("rotation_degrees"));

        config.monitor.rotation_degrees = 270;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_positive_speed_rejected() {
        let mut config = RigConfig::default();
        config.robot.motor_speed = 0.0;
        assert!(config.validate().is_err());

        config.robot.motor_speed = 30_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_relation() {
        assert!(ThresholdRelation::Greater.accepts(0.9, 0.8));
        assert!(!ThresholdRelation::Greater.accepts(0.8, 0.8));
        assert!(ThresholdRelation::GreaterOrEqual.accepts(0.8, 0.8));
        assert!(ThresholdRelation::Less.accepts(0.1, 0.2));
        assert!(ThresholdRelation::LessOrEqual.accepts(0.2, 0.2));
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench-3"
log_level = "debug"

[serial]
port = "/dev/ttyACM0"

[queue]
poll_interval_ms = 50
max_poll_interval_ms = 400
drain_timeout_ms = 30000

[robot]
one_cm_steps = 1000.0
height_error = [3.0, 2.0]

[matching]
relation = ">"
threshold = 0.75
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench-3");
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.queue.poll_interval_ms, 50);
        assert_eq!(config.queue.capacity, 3);
        assert_eq!(
            config.queue.drain_timeout(),
            Some(Duration::from_millis(30000))
        );
        assert_eq!(config.robot.one_cm_steps, 1000.0);
        assert_eq!(config.robot.height_error, [3.0, 2.0]);
        assert_eq!(config.matching.relation, ThresholdRelation::Greater);
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nrotation_degrees = 100").unwrap();
        assert!(matches!(
            RigConfig::load_from(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_example_config_loads() {
        let config =
            RigConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/rig.example.toml"))
                .unwrap();
        assert_eq!(config.application.name, "bench-1");
        assert_eq!(config.queue.capacity, 3);
        assert_eq!(config.matching.relation, ThresholdRelation::GreaterOrEqual);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\ncapacity = 2").unwrap();

        std::env::set_var("STYLUS_RIG_QUEUE__CAPACITY", "1");
        std::env::set_var("STYLUS_RIG_APPLICATION__VIRTUAL_DEBUG", "true");
        let config = RigConfig::load_from(file.path());
        std::env::remove_var("STYLUS_RIG_QUEUE__CAPACITY");
        std::env::remove_var("STYLUS_RIG_APPLICATION__VIRTUAL_DEBUG");

        let config = config.unwrap();
        assert_eq!(config.queue.capacity, 1);
        assert!(config.application.virtual_debug);
    }
}
