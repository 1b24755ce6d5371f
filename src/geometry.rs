//! Camera-pixel to motor-step geometry.
//!
//! The camera looks at the device screen from an arbitrary mounting angle, so
//! a pixel-space intent has to be scaled to steps and then rotated or flipped
//! into the arm's two-motor frame by a calibrated 2×2 direction matrix. Every
//! motion the planner issues goes through [`DirectionMatrix::apply`].

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Position or displacement in the arm's step frame.
pub type StepVector = Vector2<i64>;

/// Calibrated mapping from screen-aligned steps to arm steps.
///
/// Applied to a row vector: `[x, y] = [sx, sy] · M`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionMatrix(pub Matrix2<f64>);

impl DirectionMatrix {
    pub fn identity() -> Self {
        Self(Matrix2::identity())
    }

    /// Build from rows as stored in the calibration record.
    pub fn from_rows(rows: [[f64; 2]; 2]) -> Self {
        Self(Matrix2::new(rows[0][0], rows[0][1], rows[1][0], rows[1][1]))
    }

    pub fn rows(&self) -> [[f64; 2]; 2] {
        [[self.0[(0, 0)], self.0[(0, 1)]], [self.0[(1, 0)], self.0[(1, 1)]]]
    }

    /// Rotate a screen-aligned step vector into the arm frame.
    pub fn apply(&self, sx: f64, sy: f64) -> Vector2<f64> {
        self.0.transpose() * Vector2::new(sx, sy)
    }

    /// [`apply`](Self::apply) truncated to whole steps.
    pub fn apply_steps(&self, sx: i64, sy: i64) -> StepVector {
        let v = self.apply(sx as f64, sy as f64);
        StepVector::new(v.x as i64, v.y as i64)
    }
}

impl Default for DirectionMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// Pixel ↔ step conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelScale {
    /// Camera pixels per centimetre on the screen plane.
    pub pixels_per_cm: f64,
    /// Motor steps per centimetre of arm travel.
    pub steps_per_cm: f64,
}

impl PixelScale {
    pub fn new(pixels_per_cm: f64, steps_per_cm: f64) -> Self {
        Self {
            pixels_per_cm,
            steps_per_cm,
        }
    }

    /// Pixels to whole steps, truncated toward zero.
    pub fn to_steps(&self, pixels: f64) -> i64 {
        (pixels / self.pixels_per_cm * self.steps_per_cm) as i64
    }

    /// Pixels to fractional steps.
    pub fn to_steps_f64(&self, pixels: f64) -> f64 {
        pixels / self.pixels_per_cm * self.steps_per_cm
    }

    /// Steps back to whole pixels, truncated toward zero.
    pub fn to_pixels(&self, steps: i64) -> i64 {
        (steps as f64 / self.steps_per_cm * self.pixels_per_cm) as i64
    }

    /// Centimetres to whole steps.
    pub fn cm_to_steps(&self, cm: f64) -> i64 {
        (cm * self.steps_per_cm) as i64
    }
}

/// Device screen outline in camera pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Centre relative to the screen's top-left corner, which is the arm origin.
    pub fn center(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }

    /// Absolute pixel outline of `region` within the camera image.
    pub fn region_rect(&self, region: Region) -> ScreenRect {
        let [x0, y0, x1, y1] = region.0;
        ScreenRect::new(
            self.x + self.width * x0,
            self.y + self.height * y0,
            self.width * (x1 - x0),
            self.height * (y1 - y0),
        )
    }
}

/// Sub-area of the screen as fractions `[x0, y0, x1, y1]` of its outline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region(pub [f64; 4]);

impl Region {
    pub const FULL: Region = Region([0.0, 0.0, 1.0, 1.0]);

    /// Accept `fractions` if every entry lies in `[0, 1]`, otherwise fall back
    /// to the whole screen.
    pub fn normalized(fractions: [f64; 4]) -> Region {
        if fractions.iter().all(|f| (0.0..=1.0).contains(f)) {
            Region(fractions)
        } else {
            Region::FULL
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Region::FULL
    }
}

/// Direction of a swipe across a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}
