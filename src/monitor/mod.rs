//! Camera monitor for the system under test.
//!
//! A background thread owns the [`FrameSource`] and reads frames as fast as
//! the camera delivers them. Every frame is rotated into screen orientation,
//! offered to the optional [`VideoSink`], and published as the latest frame.
//!
//! Two rendezvous are served on top of that stream:
//!
//! - **Photo**: the caller drains the command queue first, so the arm is
//!   still; the thread writes the next frame (optionally skipping one to let
//!   exposure settle) to the requested path and wakes the caller.
//! - **Detour frame**: no drain; the caller sleeps briefly and takes the
//!   next fresh frame so matching can run while a step detour is still moving.
//!
//! A monitor that sees no frame within its startup grace shuts its thread
//! down and fails. A read failure while running marks the monitor failed and
//! every pending or later request gets the error.

pub mod mock;
mod sink;

pub use sink::ImageSequenceSink;

use crate::config::MonitorConfig;
use crate::error::{RigError, RigResult};
use image::{imageops, RgbImage};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Live camera feed.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> RigResult<RgbImage>;
}

/// Receiver of every frame the monitor reads.
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> RigResult<()>;
    /// Flush and close the recording.
    fn finish(&mut self) -> RigResult<()> {
        Ok(())
    }
}

/// Clockwise quarter turns applied to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// From a degree count; anything that is not a multiple of 90 is rejected.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }

    pub fn apply(self, frame: RgbImage) -> RgbImage {
        match self {
            Rotation::None => frame,
            Rotation::Cw90 => imageops::rotate90(&frame),
            Rotation::Cw180 => imageops::rotate180(&frame),
            Rotation::Cw270 => imageops::rotate270(&frame),
        }
    }
}

/// Timing and behavior of a [`SutMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub startup_grace: Duration,
    pub detour_pre_sleep: Duration,
    pub discard_frame_before_photo: bool,
    pub rotation: Rotation,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            detour_pre_sleep: Duration::from_millis(100),
            discard_frame_before_photo: true,
            rotation: Rotation::None,
        }
    }
}

impl TryFrom<&MonitorConfig> for MonitorSettings {
    type Error = RigError;

    fn try_from(config: &MonitorConfig) -> RigResult<Self> {
        let rotation = Rotation::from_degrees(config.rotation_degrees).ok_or_else(|| {
            RigError::Configuration(format!(
                "rotation_degrees must be a multiple of 90, got {}",
                config.rotation_degrees
            ))
        })?;
        Ok(Self {
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            detour_pre_sleep: Duration::from_millis(config.detour_pre_sleep_ms),
            discard_frame_before_photo: config.discard_frame_before_photo,
            rotation,
        })
    }
}

struct PhotoRequest {
    path: PathBuf,
    skip: u8,
}

#[derive(Default)]
struct MonitorState {
    frames_read: u64,
    latest: Option<Arc<RgbImage>>,
    photo: Option<PhotoRequest>,
    photo_result: Option<Result<(), String>>,
    failure: Option<String>,
    stop: bool,
    exited: bool,
}

struct Shared {
    state: Mutex<MonitorState>,
    /// Signalled on every new frame and on exit.
    frame: Condvar,
    /// Signalled when a photo request completes.
    photo: Condvar,
}

impl Shared {
    fn notify_all(&self) {
        self.frame.notify_all();
        self.photo.notify_all();
    }
}

/// Background frame reader with photo and detour-frame rendezvous.
pub struct SutMonitor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    settings: MonitorSettings,
}

impl SutMonitor {
    /// Start the reader thread and wait for the first frame.
    pub fn start(
        source: Box<dyn FrameSource>,
        sink: Option<Box<dyn VideoSink>>,
        settings: MonitorSettings,
    ) -> RigResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(MonitorState::default()),
            frame: Condvar::new(),
            photo: Condvar::new(),
        });

        let span = info_span!("sut_monitor");
        let worker_shared = Arc::clone(&shared);
        let rotation = settings.rotation;
        let handle = thread::Builder::new()
            .name("sut-monitor".to_string())
            .spawn(move || span.in_scope(|| run_reader(worker_shared, source, sink, rotation)))?;

        let monitor = Self {
            shared,
            worker: Mutex::new(Some(handle)),
            settings,
        };

        let deadline = Instant::now() + monitor.settings.startup_grace;
        {
            let mut st = monitor.shared.state.lock();
            while st.frames_read == 0 && !st.exited {
                if monitor.shared.frame.wait_until(&mut st, deadline).timed_out() {
                    break;
                }
            }
            if st.frames_read > 0 {
                info!("SUT monitor started");
                drop(st);
                return Ok(monitor);
            }
        }

        error!(
            grace_ms = monitor.settings.startup_grace.as_millis() as u64,
            "No frame from the camera"
        );
        monitor.shutdown();
        Err(RigError::CaptureUnavailable(monitor.settings.startup_grace))
    }

    /// Save the next frame to `path`.
    ///
    /// The caller is responsible for the arm being still.
    pub fn take_photo(&self, path: &Path) -> RigResult<()> {
        let mut st = self.shared.state.lock();
        Self::check_running(&st)?;

        st.photo_result = None;
        st.photo = Some(PhotoRequest {
            path: path.to_path_buf(),
            skip: u8::from(self.settings.discard_frame_before_photo),
        });

        loop {
            if let Some(result) = st.photo_result.take() {
                return result.map_err(RigError::Capture);
            }
            if let Err(e) = Self::check_running(&st) {
                st.photo = None;
                return Err(e);
            }
            self.shared.photo.wait(&mut st);
        }
    }

    /// Sleep briefly, then save the next fresh frame to `path`.
    pub fn detour_frame(&self, path: &Path) -> RigResult<()> {
        thread::sleep(self.settings.detour_pre_sleep);

        let frame = {
            let mut st = self.shared.state.lock();
            Self::check_running(&st)?;
            let seen = st.frames_read;
            while st.frames_read == seen {
                Self::check_running(&st)?;
                self.shared.frame.wait(&mut st);
            }
            st.latest
                .clone()
                .ok_or_else(|| RigError::Capture("no frame available".to_string()))?
        };

        frame.save(path)?;
        debug!(path = %path.display(), "Saved detour frame");
        Ok(())
    }

    /// Stop the reader thread and finish the video. Idempotent.
    pub fn close(&self) -> RigResult<()> {
        self.shutdown();
        match self.shared.state.lock().failure.clone() {
            Some(reason) => Err(RigError::Capture(reason)),
            None => Ok(()),
        }
    }

    /// Frames read since start.
    pub fn frames_read(&self) -> u64 {
        self.shared.state.lock().frames_read
    }

    pub fn is_running(&self) -> bool {
        let st = self.shared.state.lock();
        !st.exited && !st.stop
    }

    fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        {
            let mut st = self.shared.state.lock();
            st.stop = true;
            self.shared.notify_all();
        }
        if handle.join().is_err() {
            error!("SUT monitor thread panicked");
        }
        info!("SUT monitor closed");
    }

    fn check_running(st: &MonitorState) -> RigResult<()> {
        if let Some(reason) = &st.failure {
            return Err(RigError::Capture(reason.clone()));
        }
        if st.exited || st.stop {
            return Err(RigError::Capture("monitor is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for SutMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_reader(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    mut sink: Option<Box<dyn VideoSink>>,
    rotation: Rotation,
) {
    loop {
        if shared.state.lock().stop {
            break;
        }

        let frame = match source.read_frame() {
            Ok(frame) => Arc::new(rotation.apply(frame)),
            Err(e) => {
                error!(error = %e, "Camera read failed");
                shared.state.lock().failure = Some(e.to_string());
                break;
            }
        };

        if let Some(s) = sink.as_mut() {
            if let Err(e) = s.write_frame(&frame) {
                warn!(error = %e, "Video sink failed; recording disabled");
                sink = None;
            }
        }

        let photo = {
            let mut st = shared.state.lock();
            st.frames_read += 1;
            st.latest = Some(Arc::clone(&frame));
            shared.frame.notify_all();

            match st.photo.as_mut() {
                Some(request) if request.skip > 0 => {
                    request.skip -= 1;
                    None
                }
                Some(_) => st.photo.take(),
                None => None,
            }
        };

        // Encoding runs unlocked so callers are not held up by the PNG write.
        if let Some(request) = photo {
            let result = frame.save(&request.path).map_err(|e| e.to_string());
            debug!(path = %request.path.display(), ok = result.is_ok(), "Photo taken");
            shared.state.lock().photo_result = Some(result);
            shared.photo.notify_all();
        }
    }

    if let Some(mut s) = sink {
        if let Err(e) = s.finish() {
            warn!(error = %e, "Finishing the video failed");
        }
    }

    let mut st = shared.state.lock();
    st.exited = true;
    shared.notify_all();
}
