//! Rig Configuration System
//!
//! Configuration management for the rig using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `STYLUS_RIG_`
//! 2. TOML configuration file (default: `config/rig.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use stylus_rig::config::RigConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from default location
//!     let config = RigConfig::load()?;
//!
//!     // Or load from custom location
//!     let config = RigConfig::load_from("bench/rig.toml")?;
//!
//!     println!("Rig name: {}", config.application.name);
//!     println!("Queue capacity: {}", config.queue.capacity);
//!     Ok(())
//! }
//! ```

mod rig_config;

pub use rig_config::{
    ApplicationConfig, ConfigError, MatchingConfig, MonitorConfig, QueueConfig, RigConfig,
    RobotConfig, SerialConfig, ThresholdRelation,
};
