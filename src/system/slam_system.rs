//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs Tracking on the caller's thread and spawns
//! the Local Mapping thread.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, bounded};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::{info, warn};

use crate::io::{Settings, TrajectoryEntry, save_trajectory_euroc, save_trajectory_tum};
use crate::local_mapping::LocalMapper;
use crate::tracking::frame::{CameraModel, OrbExtractor};
use crate::tracking::{Tracker, TrackingState};
use crate::viz::RerunVisualizer;
use crate::vocabulary::OrbVocabulary;

use super::engine::MonocularSlam;
use super::messages::NewKeyFrameMsg;
use super::sensor::Sensor;
use super::shared_state::SharedState;
use super::timing::TimingRegister;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// When the channel is full, Tracking will block briefly.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Main SLAM system orchestrating Tracking and Local Mapping.
pub struct SlamSystem {
    /// Shared state (Atlas, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the caller's thread.
    tracker: Tracker,

    extractor: OrbExtractor,
    settings: Settings,

    /// Handle to the Local Mapping thread.
    local_mapping_handle: Option<JoinHandle<()>>,

    timing: TimingRegister,
    viewer: Option<RerunVisualizer>,
    is_shutdown: bool,
}

impl SlamSystem {
    /// Load the vocabulary and settings and start Local Mapping.
    pub fn new(
        vocabulary_path: impl AsRef<Path>,
        settings_path: impl AsRef<Path>,
        sensor: Sensor,
        use_viewer: bool,
    ) -> Result<Self> {
        if sensor != Sensor::Monocular {
            bail!("{sensor} input is not supported, only Monocular");
        }

        let vocabulary_path = vocabulary_path.as_ref();
        info!("Loading ORB vocabulary from {}", vocabulary_path.display());
        let vocabulary = OrbVocabulary::load_from_text(vocabulary_path)
            .with_context(|| format!("Failed to load vocabulary {}", vocabulary_path.display()))?;
        info!(words = vocabulary.num_words(), "Vocabulary loaded");

        let settings_path = settings_path.as_ref();
        let settings = Settings::load(settings_path)
            .with_context(|| format!("Failed to load settings {}", settings_path.display()))?;
        let camera = settings.tracking_camera();
        info!(
            fx = camera.fx,
            fy = camera.fy,
            cx = camera.cx,
            cy = camera.cy,
            width = camera.width,
            height = camera.height,
            image_scale = settings.image_scale(),
            "Camera calibration"
        );

        let extractor = OrbExtractor::new(settings.orb)?;
        let shared = SharedState::new(Arc::new(vocabulary), extractor.pyramid().clone());

        // Create bounded channel for keyframe communication
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let tracker = Tracker::new(camera, settings.fps, shared.clone(), kf_sender);

        let local_mapping_handle = Self::spawn_local_mapping(shared.clone(), kf_receiver, camera)?;

        let viewer = if use_viewer {
            match RerunVisualizer::new("mono_mbot") {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Viewer disabled: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            shared,
            tracker,
            extractor,
            settings,
            local_mapping_handle: Some(local_mapping_handle),
            timing: TimingRegister::new(),
            viewer,
            is_shutdown: false,
        })
    }

    /// Spawn the Local Mapping thread.
    fn spawn_local_mapping(
        shared: Arc<SharedState>,
        kf_receiver: Receiver<NewKeyFrameMsg>,
        camera: CameraModel,
    ) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("local_mapping".into())
            .spawn(move || {
                let mut local_mapper = LocalMapper::new(camera);
                local_mapper.run(kf_receiver, shared);
            })
            .context("Failed to spawn Local Mapping thread")
    }

    /// Get a reference to the shared state for visualization.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Keyframes in the active map.
    pub fn num_keyframes(&self) -> usize {
        self.shared.atlas.read().active_map().num_keyframes()
    }

    /// Map points in the active map.
    pub fn num_map_points(&self) -> usize {
        self.shared.atlas.read().active_map().num_map_points()
    }

    /// Poses of every frame tracked OK, re-anchored on their reference keyframes.
    pub fn frame_trajectory(&self) -> Vec<TrajectoryEntry> {
        let atlas = self.shared.atlas.read();
        self.tracker
            .trajectory()
            .iter()
            .filter_map(|record| {
                let kf = atlas
                    .all_maps()
                    .iter()
                    .find_map(|m| m.get_keyframe(record.reference))?;
                Some(TrajectoryEntry {
                    timestamp: record.timestamp,
                    pose: kf.pose.compose(&record.relative),
                })
            })
            .collect()
    }

    /// Poses of all keyframes in the atlas, by timestamp.
    pub fn keyframe_trajectory(&self) -> Vec<TrajectoryEntry> {
        let atlas = self.shared.atlas.read();
        let mut entries: Vec<TrajectoryEntry> = atlas
            .all_maps()
            .iter()
            .flat_map(|m| m.keyframes())
            .filter(|kf| !kf.is_bad)
            .map(|kf| TrajectoryEntry {
                timestamp: kf.timestamp,
                pose: kf.pose.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        entries
    }

    pub fn save_trajectory_euroc(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.frame_trajectory();
        info!(frames = entries.len(), "Saving trajectory to {}", path.as_ref().display());
        save_trajectory_euroc(path, &entries)
    }

    pub fn save_trajectory_tum(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.frame_trajectory();
        info!(frames = entries.len(), "Saving trajectory to {}", path.as_ref().display());
        save_trajectory_tum(path, &entries)
    }

    pub fn save_keyframe_trajectory_euroc(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.keyframe_trajectory();
        info!(keyframes = entries.len(), "Saving keyframe trajectory to {}", path.as_ref().display());
        save_trajectory_euroc(path, &entries)
    }

    pub fn save_keyframe_trajectory_tum(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.keyframe_trajectory();
        info!(keyframes = entries.len(), "Saving keyframe trajectory to {}", path.as_ref().display());
        save_trajectory_tum(path, &entries)
    }
}

impl MonocularSlam for SlamSystem {
    fn image_scale(&self) -> f64 {
        self.settings.image_scale()
    }

    fn track_monocular(&mut self, image: &Mat, timestamp: f64) -> Result<TrackingState> {
        if self.is_shutdown {
            bail!("SLAM system has been shut down");
        }

        let gray = to_grayscale(image, self.settings.rgb)?;
        let gray = fit_to_size(gray, self.settings.tracking_size())?;
        let features = self
            .extractor
            .extract(&gray, self.tracker.camera())
            .context("ORB extraction failed")?;
        let result = self.tracker.track(timestamp, features)?;

        if let Some(viewer) = self.viewer.as_mut() {
            viewer.log_frame(&gray, &result, &self.shared);
        }
        Ok(result.state)
    }

    fn insert_resize_time(&mut self, ms: f64) {
        self.timing.insert_resize(ms);
    }

    fn insert_track_time(&mut self, ms: f64) {
        self.timing.insert_track(ms);
    }

    /// Signals the Local Mapping thread to finish and waits for it.
    fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.is_shutdown = true;
        info!("Shutting down SLAM system");

        // Local Mapping checks the flag between receive timeouts.
        self.shared.request_shutdown();
        if let Some(handle) = self.local_mapping_handle.take() {
            if handle.join().is_err() {
                warn!("Local Mapping thread panicked");
            }
        }

        let atlas = self.shared.atlas.read();
        info!(
            maps = atlas.num_maps(),
            keyframes = atlas.total_keyframes(),
            "SLAM system stopped"
        );
        drop(atlas);
        self.timing.log_report();
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resize `image` to `(width, height)` unless it already has that size.
fn fit_to_size(image: Mat, (width, height): (u32, u32)) -> Result<Mat> {
    if image.cols() == width as i32 && image.rows() == height as i32 {
        return Ok(image);
    }
    let mut resized = Mat::default();
    let size = Size::new(width as i32, height as i32);
    imgproc::resize(&image, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR)
        .context("Failed to resize frame to the tracking size")?;
    Ok(resized)
}

/// Single-channel copy of a BGR(A)/RGB(A) or grayscale image.
fn to_grayscale(image: &Mat, rgb: bool) -> Result<Mat> {
    let code = match (image.channels(), rgb) {
        (1, _) => return Ok(image.try_clone()?),
        (3, false) => imgproc::COLOR_BGR2GRAY,
        (3, true) => imgproc::COLOR_RGB2GRAY,
        (4, false) => imgproc::COLOR_BGRA2GRAY,
        (4, true) => imgproc::COLOR_RGBA2GRAY,
        (n, _) => bail!("unsupported image with {n} channels"),
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(image, &mut gray, code).context("Color conversion failed")?;
    Ok(gray)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{CV_8UC1, CV_8UC3, Scalar};
    use std::io::Write;

    const SETTINGS: &str = "%YAML:1.0\nCamera.fx: 450.0\nCamera.fy: 450.0\nCamera.cx: 320.0\nCamera.cy: 240.0\nCamera.width: 640\nCamera.height: 480\nCamera.newWidth: 320\nCamera.newHeight: 240\nCamera.fps: 10\n";

    fn vocabulary_text() -> String {
        let line = |byte: u8| {
            let desc: Vec<String> = (0..32).map(|_| byte.to_string()).collect();
            format!("0 1 {} 1.0", desc.join(" "))
        };
        ["2 1 0 0".to_string(), line(0x00), line(0xFF)].join("\n")
    }

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_only_monocular_is_supported() {
        let err = SlamSystem::new("voc.txt", "settings.yaml", Sensor::Stereo, false)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Stereo"));
    }

    #[test]
    fn test_missing_vocabulary() {
        let settings = write_temp(SETTINGS);
        let err = SlamSystem::new("/nonexistent/voc.txt", settings.path(), Sensor::Monocular, false)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("vocabulary"));
    }

    #[test]
    fn test_track_then_shutdown() {
        let vocabulary = write_temp(&vocabulary_text());
        let settings = write_temp(SETTINGS);
        let mut system =
            SlamSystem::new(vocabulary.path(), settings.path(), Sensor::Monocular, false).unwrap();
        assert_eq!(system.image_scale(), 1.0);

        let image = Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).unwrap();
        let state = system.track_monocular(&image, 0.0).unwrap();
        assert_eq!(state, TrackingState::NotInitialized);
        assert_eq!(system.tracking_state(), TrackingState::NotInitialized);
        assert_eq!(system.num_keyframes(), 0);

        system.insert_track_time(3.0);
        system.shutdown();
        system.shutdown();
        assert!(system.track_monocular(&image, 0.1).is_err());
        assert!(system.frame_trajectory().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let kf_path = dir.path().join("kf.txt");
        system.save_keyframe_trajectory_tum(&kf_path).unwrap();
        assert!(std::fs::read_to_string(&kf_path).unwrap().is_empty());
    }

    #[test]
    fn test_frames_fit_to_tracking_size() {
        let gray = Mat::new_rows_cols_with_default(480, 752, CV_8UC1, Scalar::all(5.0)).unwrap();
        let fitted = fit_to_size(gray, (600, 350)).unwrap();
        assert_eq!((fitted.cols(), fitted.rows()), (600, 350));

        let same = Mat::new_rows_cols_with_default(350, 600, CV_8UC1, Scalar::all(5.0)).unwrap();
        let kept = fit_to_size(same, (600, 350)).unwrap();
        assert_eq!((kept.cols(), kept.rows()), (600, 350));
    }

    #[test]
    fn test_grayscale_conversion() {
        let bgr = Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::all(90.0)).unwrap();
        let gray = to_grayscale(&bgr, false).unwrap();
        assert_eq!(gray.channels(), 1);
        assert_eq!((gray.rows(), gray.cols()), (4, 6));
        assert_eq!(*gray.at_2d::<u8>(0, 0).unwrap(), 90);

        let mono = Mat::new_rows_cols_with_default(4, 6, CV_8UC1, Scalar::all(7.0)).unwrap();
        assert_eq!(to_grayscale(&mono, true).unwrap().channels(), 1);
    }
}
