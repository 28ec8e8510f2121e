//! The capture loop: read, resize, track, until interrupted or the stream ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::camera::FrameSource;
use crate::system::MonocularSlam;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Error opening the video capture.")]
    CameraOpen,

    #[error("{0:#}")]
    Tracking(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The running flag was cleared.
    Interrupted,
    /// The source produced an empty frame.
    EmptyFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub stop_reason: StopReason,
}

/// Process exit status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    CameraOpenFailure,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::CameraOpenFailure => -1,
        }
    }
}

impl From<&Result<RunSummary, SessionError>> for ExitStatus {
    fn from(result: &Result<RunSummary, SessionError>) -> Self {
        match result {
            Ok(_) => ExitStatus::Success,
            Err(SessionError::CameraOpen) => ExitStatus::CameraOpenFailure,
            Err(SessionError::Tracking(_)) => ExitStatus::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Report resize and track times to the engine.
    pub register_times: bool,
}

pub struct Session {
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Feed frames from `source` to `engine` while `running` is set.
    ///
    /// The source is released and the engine shut down on every path except
    /// a source that failed to open, where only the source is released.
    pub fn run<S, E>(&self, source: &mut S, engine: &mut E, running: &AtomicBool) -> Result<RunSummary, SessionError>
    where
        S: FrameSource + ?Sized,
        E: MonocularSlam + ?Sized,
    {
        if !source.is_opened() {
            error!("Error opening the video capture.");
            release(source);
            return Err(SessionError::CameraOpen);
        }

        let mut frames = 0usize;
        let outcome = self.frame_loop(source, engine, running, &mut frames);

        release(source);
        engine.shutdown();

        match outcome {
            Ok(stop_reason) => {
                info!(frames, ?stop_reason, "Session finished");
                Ok(RunSummary { frames, stop_reason })
            }
            Err(e) => {
                error!("Error caught, exiting: {e:#}");
                Err(SessionError::Tracking(e))
            }
        }
    }

    fn frame_loop<S, E>(
        &self,
        source: &mut S,
        engine: &mut E,
        running: &AtomicBool,
        frames: &mut usize,
    ) -> Result<StopReason>
    where
        S: FrameSource + ?Sized,
        E: MonocularSlam + ?Sized,
    {
        let scale = engine.image_scale();
        let mut frame = Mat::default();
        let mut resized = Mat::default();

        while running.load(Ordering::SeqCst) {
            if !source.read(&mut frame)? || frame.empty() {
                info!("Frame is empty, breaking...");
                return Ok(StopReason::EmptyFrame);
            }
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("System clock is before the Unix epoch")?
                .as_secs_f64();

            let mut resize_ms = 0.0;
            let image = if scale != 1.0 {
                let start = Instant::now();
                let size = Size::new(
                    (frame.cols() as f64 * scale) as i32,
                    (frame.rows() as f64 * scale) as i32,
                );
                imgproc::resize(&frame, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR)
                    .context("Failed to resize frame")?;
                resize_ms = start.elapsed().as_secs_f64() * 1000.0;
                if self.config.register_times {
                    engine.insert_resize_time(resize_ms);
                }
                &resized
            } else {
                &frame
            };

            let start = Instant::now();
            let state = engine.track_monocular(image, timestamp)?;
            let track_ms = start.elapsed().as_secs_f64() * 1000.0;
            if self.config.register_times {
                engine.insert_track_time(resize_ms + track_ms);
            }

            *frames += 1;
            debug!(frame = *frames, %state, track_ms, "Frame tracked");
        }

        Ok(StopReason::Interrupted)
    }
}

fn release<S: FrameSource + ?Sized>(source: &mut S) {
    if let Err(e) = source.release() {
        warn!("{e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::TrackingState;
    use anyhow::bail;
    use opencv::core::{CV_8UC3, Scalar};

    struct FakeSource {
        opened: bool,
        frames_left: usize,
        fail_read: bool,
        released: usize,
        /// Cleared after this many reads, standing in for SIGINT.
        stop_after: Option<(usize, &'static AtomicBool)>,
        reads: usize,
    }

    impl FakeSource {
        fn new(frames: usize) -> Self {
            Self {
                opened: true,
                frames_left: frames,
                fail_read: false,
                released: 0,
                stop_after: None,
                reads: 0,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn is_opened(&self) -> bool {
            self.opened
        }

        fn read(&mut self, frame: &mut Mat) -> Result<bool> {
            self.reads += 1;
            if let Some((n, flag)) = self.stop_after {
                if self.reads >= n {
                    flag.store(false, Ordering::SeqCst);
                }
            }
            if self.fail_read {
                bail!("device unplugged");
            }
            if self.frames_left == 0 {
                *frame = Mat::default();
                return Ok(true);
            }
            self.frames_left -= 1;
            *frame = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(10.0))?;
            Ok(true)
        }

        fn release(&mut self) -> Result<()> {
            self.released += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        scale: f64,
        fail_at: Option<usize>,
        tracked: Vec<(i32, i32, f64)>,
        resize_times: usize,
        track_times: usize,
        shutdowns: usize,
    }

    impl FakeEngine {
        fn with_scale(scale: f64) -> Self {
            Self {
                scale,
                ..Default::default()
            }
        }
    }

    impl MonocularSlam for FakeEngine {
        fn image_scale(&self) -> f64 {
            self.scale
        }

        fn track_monocular(&mut self, image: &Mat, timestamp: f64) -> Result<TrackingState> {
            if self.fail_at == Some(self.tracked.len()) {
                bail!("tracking exploded");
            }
            self.tracked.push((image.cols(), image.rows(), timestamp));
            Ok(TrackingState::NotInitialized)
        }

        fn insert_resize_time(&mut self, _ms: f64) {
            self.resize_times += 1;
        }

        fn insert_track_time(&mut self, _ms: f64) {
            self.track_times += 1;
        }

        fn shutdown(&mut self) {
            self.shutdowns += 1;
        }
    }

    #[test]
    fn test_empty_frame_ends_session() {
        let mut source = FakeSource::new(3);
        let mut engine = FakeEngine::with_scale(1.0);
        let running = AtomicBool::new(true);

        let result = Session::new(SessionConfig::default()).run(&mut source, &mut engine, &running);
        let summary = result.as_ref().unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.stop_reason, StopReason::EmptyFrame);
        assert_eq!(ExitStatus::from(&result).code(), 0);
        assert_eq!(source.released, 1);
        assert_eq!(engine.shutdowns, 1);
        assert_eq!(engine.track_times, 0);
        assert!(engine.tracked.windows(2).all(|w| w[0].2 <= w[1].2));
    }

    #[test]
    fn test_timestamps_are_epoch_seconds() {
        let mut source = FakeSource::new(1);
        let mut engine = FakeEngine::with_scale(1.0);
        let running = AtomicBool::new(true);
        Session::new(SessionConfig::default())
            .run(&mut source, &mut engine, &running)
            .unwrap();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64();
        let timestamp = engine.tracked[0].2;
        assert!(timestamp > 1.0e9 && timestamp <= now, "timestamp {timestamp}");
    }

    #[test]
    fn test_frames_are_resized_and_timed() {
        let mut source = FakeSource::new(2);
        let mut engine = FakeEngine::with_scale(0.5);
        let running = AtomicBool::new(true);
        let session = Session::new(SessionConfig { register_times: true });

        session.run(&mut source, &mut engine, &running).unwrap();
        assert_eq!(engine.tracked.len(), 2);
        assert_eq!((engine.tracked[0].0, engine.tracked[0].1), (32, 24));
        assert_eq!(engine.resize_times, 2);
        assert_eq!(engine.track_times, 2);
    }

    #[test]
    fn test_interrupt_stops_loop() {
        static RUNNING: AtomicBool = AtomicBool::new(true);
        let mut source = FakeSource::new(1000);
        source.stop_after = Some((4, &RUNNING));
        let mut engine = FakeEngine::with_scale(1.0);

        let summary = Session::new(SessionConfig::default())
            .run(&mut source, &mut engine, &RUNNING)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(summary.frames, 4);
        assert_eq!(engine.shutdowns, 1);
    }

    #[test]
    fn test_camera_open_failure() {
        let mut source = FakeSource::new(1);
        source.opened = false;
        let mut engine = FakeEngine::with_scale(1.0);
        let running = AtomicBool::new(true);

        let result = Session::new(SessionConfig::default()).run(&mut source, &mut engine, &running);
        assert!(matches!(result, Err(SessionError::CameraOpen)));
        assert_eq!(ExitStatus::from(&result).code(), -1);
        assert_eq!(source.released, 1);
        assert_eq!(engine.shutdowns, 0);
        assert!(engine.tracked.is_empty());
    }

    #[test]
    fn test_tracking_error_cleans_up() {
        let mut source = FakeSource::new(10);
        let mut engine = FakeEngine {
            scale: 1.0,
            fail_at: Some(2),
            ..Default::default()
        };
        let running = AtomicBool::new(true);

        let result = Session::new(SessionConfig::default()).run(&mut source, &mut engine, &running);
        match &result {
            Err(SessionError::Tracking(e)) => assert!(e.to_string().contains("tracking exploded")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ExitStatus::from(&result).code(), 1);
        assert_eq!(source.released, 1);
        assert_eq!(engine.shutdowns, 1);
    }

    #[test]
    fn test_read_error_is_a_tracking_error() {
        let mut source = FakeSource::new(10);
        source.fail_read = true;
        let mut engine = FakeEngine::with_scale(1.0);
        let running = AtomicBool::new(true);

        let result = Session::new(SessionConfig::default()).run(&mut source, &mut engine, &running);
        assert_eq!(ExitStatus::from(&result), ExitStatus::Failure);
        assert_eq!(engine.shutdowns, 1);
    }
}
