use super::VideoSink;
use crate::error::RigResult;
use image::RgbImage;
use std::path::PathBuf;

/// Records video as numbered PNG frames in a directory.
pub struct ImageSequenceSink {
    dir: PathBuf,
    next_index: u64,
}

impl ImageSequenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> RigResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, next_index: 0 })
    }

    pub fn frames_written(&self) -> u64 {
        self.next_index
    }
}

impl VideoSink for ImageSequenceSink {
    fn write_frame(&mut self, frame: &RgbImage) -> RigResult<()> {
        let path = self.dir.join(format!("frame_{:06}.png", self.next_index));
        frame.save(path)?;
        self.next_index += 1;
        Ok(())
    }
}
