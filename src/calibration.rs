//! Persisted rig calibration.
//!
//! Produced once per mounting by the calibration procedure and read at the
//! start of every run. The file format is JSON-serialized [`CalibrationRecord`].

use crate::error::RigResult;
use crate::geometry::{DirectionMatrix, PixelScale, ScreenRect};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Camera and arm calibration for one rig mounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Camera pixels per centimetre on the screen plane.
    pub pixel_to_physical: f64,
    /// Rows of the screen-to-arm direction matrix.
    pub direction_matrix: [[f64; 2]; 2],
    /// Pen-fall servo height that just touches the screen.
    pub tip_height: i64,
    /// Steps from the screen origin to the parked position, X then Y.
    pub origin_detour: [i64; 2],
    /// Screen outline in camera pixels.
    pub screen: ScreenRect,
    #[serde(default = "Utc::now")]
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    pub fn direction(&self) -> DirectionMatrix {
        DirectionMatrix::from_rows(self.direction_matrix)
    }

    pub fn scale(&self, steps_per_cm: f64) -> PixelScale {
        PixelScale::new(self.pixel_to_physical, steps_per_cm)
    }

    /// Load a record from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let record: CalibrationRecord = serde_json::from_str(&contents)?;
        info!(
            path = %path.display(),
            calibrated_at = %record.calibrated_at,
            "Loaded calibration"
        );
        Ok(record)
    }

    /// Save to `path`, replacing any existing file atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> RigResult<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), "Saved calibration");
        Ok(())
    }
}
