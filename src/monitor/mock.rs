//! Simulated camera for tests and dry runs.

use super::FrameSource;
use crate::error::{RigError, RigResult};
use image::{Rgb, RgbImage};
use std::thread;
use std::time::Duration;

/// Frame source producing solid frames whose red channel counts frames.
pub struct MockCamera {
    width: u32,
    height: u32,
    interval: Duration,
    fail_after: Option<u64>,
    produced: u64,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_millis(10),
            fail_after: None,
            produced: 0,
        }
    }

    /// Time between frames.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fail every read once `frames` frames have been produced.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl FrameSource for MockCamera {
    fn read_frame(&mut self) -> RigResult<RgbImage> {
        if self.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(RigError::Capture("camera disconnected".to_string()));
        }
        thread::sleep(self.interval);
        let shade = (self.produced % 256) as u8;
        self.produced += 1;
        Ok(RgbImage::from_pixel(self.width, self.height, Rgb([shade, 0, 0])))
    }
}
