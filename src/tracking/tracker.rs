//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! - Two-view initialization of a fresh map
//! - Pose prediction with the constant-velocity model, falling back to BoW
//!   matching against the reference KeyFrame
//! - Track Local Map: projection search of local map points + PnP refinement
//! - BoW relocalization while recently lost
//! - KeyFrame decision; new keyframes go to Local Mapping via channel

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::{PnpParams, SE3, TwoViewParams, solve_pnp_ransac};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::TrackingState;
use crate::tracking::frame::{CameraModel, FeatureSet};
use crate::tracking::initializer::{Initialization, MonocularInitializer};
use crate::tracking::keyframe_decision::KeyFrameDecision;
use crate::tracking::local_map::LocalMap;
use crate::tracking::matching::{ProjectionParams, search_by_bow, search_by_projection};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::result::{TrackingMetrics, TrackingResult};
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::FEATURE_VECTOR_LEVELS_UP;

/// Maps with more keyframes than this are relocalized instead of reset.
const MIN_KEYFRAMES_TO_KEEP_MAP: usize = 10;
/// Seconds spent in RecentlyLost before giving up.
const MAX_RECENTLY_LOST_SECS: f64 = 5.0;
const MIN_INLIERS: usize = 30;
const MIN_INLIERS_AFTER_REINIT: usize = 15;
const MIN_INITIAL_MAP_POINTS: usize = 50;
const MIN_RELOCALIZATION_INLIERS: usize = 50;

/// Pose of a tracked frame relative to its reference keyframe.
#[derive(Debug, Clone)]
pub struct TrajectoryRecord {
    pub timestamp: f64,
    pub reference: KeyFrameId,
    /// T_ref_cam.
    pub relative: SE3,
}

/// Main tracking structure.
pub struct Tracker {
    camera: CameraModel,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    initializer: MonocularInitializer,
    motion_model: MotionModel,
    kf_decision: KeyFrameDecision,
    max_frames: u64,

    state: TrackingState,
    next_frame_id: u64,
    last_frame: Option<Frame>,
    reference_kf: Option<KeyFrameId>,
    /// Id of the last frame that initialized or relocalized.
    last_reinit_frame: u64,
    lost_since: Option<f64>,

    trajectory: Vec<TrajectoryRecord>,
}

impl Tracker {
    pub fn new(
        camera: CameraModel,
        fps: f64,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Self {
        Self {
            camera,
            shared,
            kf_sender,
            initializer: MonocularInitializer::new(TwoViewParams::default()),
            motion_model: MotionModel::new(),
            kf_decision: KeyFrameDecision::new(fps),
            max_frames: fps.round().max(1.0) as u64,
            state: TrackingState::NoImagesYet,
            next_frame_id: 0,
            last_frame: None,
            reference_kf: None,
            last_reinit_frame: 0,
            lost_since: None,
            trajectory: Vec::new(),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn trajectory(&self) -> &[TrajectoryRecord] {
        &self.trajectory
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Track one frame given its extracted features.
    pub fn track(&mut self, timestamp: f64, features: FeatureSet) -> Result<TrackingResult> {
        let start = Instant::now();
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let mut frame = Frame::new(
            frame_id,
            timestamp,
            features,
            self.camera.width as f64,
            self.camera.height as f64,
        );
        let mut metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..Default::default()
        };

        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }
        if self.state == TrackingState::Lost {
            self.handle_lost();
        }

        match self.state {
            TrackingState::NotInitialized => {
                if let Some(init) = self.initializer.try_initialize(&frame, &self.camera) {
                    if self.create_initial_map(init, &mut frame)? {
                        self.state = TrackingState::Ok;
                        metrics.n_inliers = frame.num_matches();
                        self.record_tracked_frame(&frame);
                    }
                }
            }
            TrackingState::Ok | TrackingState::RecentlyLost => {
                let ok = self.track_frame(&mut frame, &mut metrics)?;
                self.update_state(ok, timestamp);
                if ok {
                    self.record_tracked_frame(&frame);
                    metrics.new_keyframe = self.maybe_create_keyframe(&frame, metrics.n_inliers)?;
                }
            }
            TrackingState::NoImagesYet | TrackingState::Lost => {}
        }

        metrics.n_matches = frame.num_matches();
        metrics.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let result = TrackingResult {
            frame_id,
            timestamp,
            state: self.state,
            pose: if self.state.is_ok() { frame.pose.clone() } else { None },
            metrics,
            features: frame.features.iter().map(|f| f.raw).collect(),
            matched: frame
                .map_point_matches
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.map(|_| i))
                .collect(),
        };

        self.last_frame = Some(frame);
        Ok(result)
    }

    /// Pose estimation for a frame while the map is initialized.
    fn track_frame(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) -> Result<bool> {
        let mut ok = if self.state == TrackingState::Ok {
            let mut ok = false;
            if self.motion_model.has_velocity() {
                ok = self.track_with_motion_model(frame)?;
            }
            if !ok {
                frame.clear_matches();
                ok = self.track_reference_keyframe(frame)?;
            }
            ok
        } else {
            let ok = self.relocalize(frame)?;
            if ok {
                self.last_reinit_frame = frame.id;
            }
            ok
        };

        if ok {
            let inliers = self.track_local_map(frame)?;
            metrics.n_inliers = inliers;
            ok = inliers >= self.min_inliers(frame.id);
        }
        Ok(ok)
    }

    fn update_state(&mut self, ok: bool, timestamp: f64) {
        let previous = self.state;
        if ok {
            if previous == TrackingState::RecentlyLost {
                tracing::info!("Relocalized");
            }
            self.state = TrackingState::Ok;
            self.lost_since = None;
            return;
        }

        self.motion_model.clear_velocity();
        match previous {
            TrackingState::Ok => {
                let kfs = self.shared.atlas.read().active_map().num_keyframes();
                if kfs > MIN_KEYFRAMES_TO_KEEP_MAP {
                    tracing::warn!(keyframes = kfs, "Tracking lost, attempting relocalization");
                    self.state = TrackingState::RecentlyLost;
                    self.lost_since = Some(timestamp);
                } else {
                    tracing::warn!(keyframes = kfs, "Tracking lost with a small map");
                    self.state = TrackingState::Lost;
                }
            }
            TrackingState::RecentlyLost => {
                let since = *self.lost_since.get_or_insert(timestamp);
                if timestamp - since > MAX_RECENTLY_LOST_SECS {
                    tracing::warn!("Relocalization timed out");
                    self.state = TrackingState::Lost;
                }
            }
            _ => {}
        }
    }

    fn min_inliers(&self, frame_id: u64) -> usize {
        if frame_id < self.last_reinit_frame + self.max_frames {
            MIN_INLIERS_AFTER_REINIT
        } else {
            MIN_INLIERS
        }
    }

    /// Reset the active map when small, otherwise retire it and start a new one.
    fn handle_lost(&mut self) {
        {
            let mut atlas = self.shared.atlas.write();
            if atlas.active_map().num_keyframes() <= MIN_KEYFRAMES_TO_KEEP_MAP {
                tracing::info!("Resetting active map");
                atlas.reset_active_map();
            } else {
                tracing::info!("Storing map and creating a new one");
                atlas.create_new_map();
            }
            self.shared.bump_map_generation();
        }

        self.initializer.reset();
        self.motion_model.reset();
        self.kf_decision.reset();
        self.reference_kf = None;
        self.last_frame = None;
        self.lost_since = None;
        self.state = TrackingState::NotInitialized;
    }

    /// Build the first two keyframes and map points of a new map.
    fn create_initial_map(&mut self, init: Initialization, frame: &mut Frame) -> Result<bool> {
        let (w, h) = (self.camera.width as f64, self.camera.height as f64);
        let reference = init.reference;
        let mut atlas = self.shared.atlas.write();
        let map_idx = atlas.active_map_index();

        let map = atlas.active_map_mut();
        let kf0 = map.create_keyframe(
            reference.timestamp,
            SE3::identity(),
            reference.features.clone(),
            reference.descriptors.clone(),
            w,
            h,
        );
        let kf1 = map.create_keyframe(
            frame.timestamp,
            init.pose_21.inverse(),
            frame.features.clone(),
            frame.descriptors.clone(),
            w,
            h,
        );

        let mut mp_ids: Vec<MapPointId> = Vec::with_capacity(init.points.len());
        for (i1, i2, p) in &init.points {
            let mp = map.create_map_point(*p, reference.descriptors[*i1], kf0);
            map.associate(kf0, *i1, mp);
            map.associate(kf1, *i2, mp);
            map.update_map_point_descriptor(mp);
            mp_ids.push(mp);
        }

        let median_depth = map.median_scene_depth(kf0).unwrap_or(0.0);
        let tracked = map.get_keyframe(kf1).map_or(0, |kf| kf.num_map_points());
        if median_depth <= 0.0 || tracked < MIN_INITIAL_MAP_POINTS {
            tracing::warn!(median_depth, tracked, "Wrong initialization, resetting");
            atlas.reset_active_map();
            self.shared.bump_map_generation();
            self.initializer.reset();
            return Ok(false);
        }

        // Normalize so the median scene depth is 1.
        let inv_median = 1.0 / median_depth;
        if let Some(kf) = map.get_keyframe_mut(kf1) {
            kf.pose.translation *= inv_median;
        }
        for mp_id in &mp_ids {
            if let Some(mp) = map.get_map_point_mut(*mp_id) {
                mp.position *= inv_median;
            }
        }
        for (mp_id, (_, i2, _)) in mp_ids.iter().zip(init.points.iter()) {
            map.update_map_point_normal_and_depth(*mp_id);
            frame.map_point_matches[*i2] = Some(*mp_id);
        }

        let pose1 = map
            .get_keyframe(kf1)
            .map(|kf| kf.pose.clone())
            .context("initial keyframe vanished")?;

        for kf_id in [kf0, kf1] {
            let Some(kf) = atlas.active_map_mut().get_keyframe_mut(kf_id) else {
                continue;
            };
            let (bow, fv) = self
                .shared
                .vocabulary
                .transform(&kf.descriptors, FEATURE_VECTOR_LEVELS_UP);
            kf.set_bow(bow.clone(), fv);
            atlas.keyframe_db.add(kf_id, &bow, map_idx);
        }
        drop(atlas);

        tracing::info!(map_points = mp_ids.len(), map_index = map_idx, "New map created");

        frame.pose = Some(pose1.clone());
        self.reference_kf = Some(kf1);
        self.motion_model.reset();
        self.motion_model.update(&pose1);
        self.kf_decision.reset();
        self.last_reinit_frame = frame.id;
        Ok(true)
    }

    fn track_with_motion_model(&mut self, frame: &mut Frame) -> Result<bool> {
        let Some(predicted) = self.motion_model.predict() else {
            return Ok(false);
        };
        let candidates: Vec<MapPointId> = match &self.last_frame {
            Some(last) if last.pose.is_some() => last.map_point_matches.iter().flatten().copied().collect(),
            _ => return Ok(false),
        };

        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        let pose_cw = predicted.inverse();

        let (mut n, _) = search_by_projection(
            frame,
            map,
            &candidates,
            &pose_cw,
            &self.camera,
            &ProjectionParams::motion(15.0),
        );
        if n < 20 {
            frame.clear_matches();
            n = search_by_projection(
                frame,
                map,
                &candidates,
                &pose_cw,
                &self.camera,
                &ProjectionParams::motion(30.0),
            )
            .0;
        }
        if n < 20 {
            return Ok(false);
        }

        let inliers = optimize_pose(&self.camera, frame, map, Some(&predicted), &PnpParams::default())?;
        Ok(inliers >= 10)
    }

    fn track_reference_keyframe(&mut self, frame: &mut Frame) -> Result<bool> {
        let Some(ref_id) = self.reference_kf else {
            return Ok(false);
        };
        let (_, fv) = self
            .shared
            .vocabulary
            .transform(&frame.descriptors, FEATURE_VECTOR_LEVELS_UP);

        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        let Some(kf) = map.get_keyframe(ref_id) else {
            return Ok(false);
        };

        let matches = search_by_bow(kf, map, frame, &fv, 0.7);
        if matches.iter().flatten().count() < 15 {
            return Ok(false);
        }
        frame.map_point_matches = matches;

        let prior = self
            .last_frame
            .as_ref()
            .and_then(|f| f.pose.clone())
            .unwrap_or_else(|| kf.pose.clone());
        let inliers = optimize_pose(&self.camera, frame, map, Some(&prior), &PnpParams::default())?;
        Ok(inliers >= 10)
    }

    /// Search more matches in the local map and refine the pose. Returns the inlier count.
    fn track_local_map(&mut self, frame: &mut Frame) -> Result<usize> {
        let Some(pose) = frame.pose.clone() else {
            return Ok(0);
        };
        let th = if frame.id < self.last_reinit_frame + 2 { 5.0 } else { 1.0 };

        let (inliers, visible) = {
            let atlas = self.shared.atlas.read();
            let map = atlas.active_map();

            let local = LocalMap::build(map, &frame.map_point_matches);
            if let Some(reference) = local.reference {
                self.reference_kf = Some(reference);
            }

            let mut visible: Vec<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();
            let (_, in_frustum) = search_by_projection(
                frame,
                map,
                &local.map_points,
                &pose.inverse(),
                &self.camera,
                &ProjectionParams::local_map(th),
            );
            visible.extend(in_frustum);

            let inliers = optimize_pose(&self.camera, frame, map, Some(&pose), &PnpParams::default())?;
            (inliers, visible)
        };

        let mut atlas = self.shared.atlas.write();
        let map = atlas.active_map_mut();
        for mp_id in visible {
            if let Some(mp) = map.get_map_point_mut(mp_id) {
                mp.increase_visible(1);
            }
        }
        for mp_id in frame.map_point_matches.iter().flatten() {
            if let Some(mp) = map.get_map_point_mut(*mp_id) {
                mp.increase_found(1);
            }
        }
        Ok(inliers)
    }

    fn relocalize(&mut self, frame: &mut Frame) -> Result<bool> {
        let (bow, fv) = self
            .shared
            .vocabulary
            .transform(&frame.descriptors, FEATURE_VECTOR_LEVELS_UP);

        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        let candidates = atlas
            .keyframe_db
            .detect_relocalization_candidates(&bow, atlas.active_map_index());
        if candidates.is_empty() {
            return Ok(false);
        }

        let reloc_pnp = PnpParams {
            iterations: 300,
            ..PnpParams::default()
        };

        for cand in candidates {
            let Some(kf) = map.get_keyframe(cand.keyframe_id) else {
                continue;
            };
            frame.clear_matches();
            frame.pose = None;

            let matches = search_by_bow(kf, map, frame, &fv, 0.75);
            if matches.iter().flatten().count() < 15 {
                continue;
            }
            frame.map_point_matches = matches;

            let mut inliers = optimize_pose(&self.camera, frame, map, None, &reloc_pnp)?;
            if inliers < 10 {
                continue;
            }

            if inliers < MIN_RELOCALIZATION_INLIERS {
                let Some(pose) = frame.pose.clone() else {
                    continue;
                };
                let mut local_kfs = vec![kf.id];
                local_kfs.extend(kf.best_covisibles(10));
                let points = map.map_points_from_keyframes(&local_kfs);
                search_by_projection(
                    frame,
                    map,
                    &points,
                    &pose.inverse(),
                    &self.camera,
                    &ProjectionParams {
                        radius: 10.0,
                        widen_oblique: false,
                        nn_ratio: 0.9,
                    },
                );
                inliers = optimize_pose(&self.camera, frame, map, Some(&pose), &PnpParams::default())?;
            }

            if inliers >= MIN_RELOCALIZATION_INLIERS {
                tracing::debug!(keyframe = %kf.id, inliers, "Relocalization candidate accepted");
                self.reference_kf = Some(kf.id);
                return Ok(true);
            }
        }

        frame.clear_matches();
        frame.pose = None;
        Ok(false)
    }

    fn record_tracked_frame(&mut self, frame: &Frame) {
        let (Some(pose), Some(reference)) = (&frame.pose, self.reference_kf) else {
            return;
        };
        self.motion_model.update(pose);

        let atlas = self.shared.atlas.read();
        if let Some(kf) = atlas.active_map().get_keyframe(reference) {
            self.trajectory.push(TrajectoryRecord {
                timestamp: frame.timestamp,
                reference,
                relative: kf.pose.inverse().compose(pose),
            });
        }
    }

    /// Run the keyframe decision and hand the frame to Local Mapping.
    fn maybe_create_keyframe(&mut self, frame: &Frame, tracked: usize) -> Result<bool> {
        let Some(pose) = frame.pose.clone() else {
            return Ok(false);
        };
        let reference_points = {
            let atlas = self.shared.atlas.read();
            let map = atlas.active_map();
            let min_obs = if map.num_keyframes() <= 2 { 2 } else { 3 };
            self.reference_kf
                .and_then(|id| map.get_keyframe(id))
                .map_or(0, |kf| tracked_map_points(map, kf.map_point_indices().map(|(_, id)| id), min_obs))
        };

        let busy = self.shared.should_stop_keyframe_creation();
        if !self.kf_decision.should_create_keyframe(tracked, reference_points, busy) {
            return Ok(false);
        }

        let msg = NewKeyFrameMsg {
            map_generation: self.shared.map_generation(),
            timestamp: frame.timestamp,
            pose,
            features: frame.features.clone(),
            descriptors: frame.descriptors.clone(),
            matched_map_points: frame.map_point_matches.clone(),
            img_width: self.camera.width as f64,
            img_height: self.camera.height as f64,
        };
        self.kf_sender
            .send(msg)
            .context("Local Mapping thread is not receiving keyframes")?;
        tracing::debug!(frame = frame.id, tracked, reference_points, "New keyframe requested");
        Ok(true)
    }
}

fn tracked_map_points(map: &Map, ids: impl Iterator<Item = MapPointId>, min_obs: usize) -> usize {
    ids.filter(|id| {
        map.get_map_point(*id)
            .is_some_and(|mp| !mp.is_bad && mp.num_observations() >= min_obs)
    })
    .count()
}

/// PnP over the frame's current matches. Outlier matches are dropped and the
/// frame pose updated. Returns the inlier count.
fn optimize_pose(
    camera: &CameraModel,
    frame: &mut Frame,
    map: &Map,
    prior: Option<&SE3>,
    params: &PnpParams,
) -> Result<usize> {
    let mut indices = Vec::new();
    let mut pts3d = Vec::new();
    let mut pts2d = Vec::new();
    for (idx, m) in frame.map_point_matches.iter().enumerate() {
        let Some(mp) = m.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        indices.push(idx);
        pts3d.push(mp.position);
        pts2d.push(frame.features[idx].pt);
    }

    let Some(result) = solve_pnp_ransac(&pts3d, &pts2d, camera, prior, params)? else {
        frame.clear_matches();
        return Ok(0);
    };

    for (k, idx) in indices.iter().enumerate() {
        if !result.inlier_mask[k] {
            frame.map_point_matches[*idx] = None;
        }
    }
    frame.pose = Some(result.pose);
    Ok(result.num_inliers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::ScalePyramid;
    use crate::tracking::initializer::tests::synthetic_pair;
    use crate::vocabulary::two_word_vocabulary;
    use crossbeam_channel::bounded;

    fn tracker() -> (Tracker, Arc<SharedState>, crossbeam_channel::Receiver<NewKeyFrameMsg>) {
        let camera = CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480);
        let shared = SharedState::new(Arc::new(two_word_vocabulary()), ScalePyramid::new(1.2, 8));
        let (tx, rx) = bounded(5);
        (Tracker::new(camera, 10.0, shared.clone(), tx), shared, rx)
    }

    fn feature_set(frame: &Frame) -> FeatureSet {
        FeatureSet {
            features: frame.features.clone(),
            descriptors: frame.descriptors.clone(),
        }
    }

    #[test]
    fn test_first_frame_leaves_no_images_yet() {
        let (mut tracker, _, _) = tracker();
        assert_eq!(tracker.state(), TrackingState::NoImagesYet);
        let result = tracker.track(0.0, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert!(result.pose.is_none());
    }

    #[test]
    fn test_initializes_map_with_unit_median_depth() {
        let (f1, f2, _, _) = synthetic_pair(200);
        let (mut tracker, shared, _rx) = tracker();

        tracker.track(f1.timestamp, feature_set(&f1)).unwrap();
        let result = tracker.track(f2.timestamp, feature_set(&f2)).unwrap();

        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.pose.is_some());
        assert_eq!(tracker.trajectory().len(), 1);

        let atlas = shared.atlas.read();
        let map = atlas.active_map();
        assert_eq!(map.num_keyframes(), 2);
        assert!(map.num_map_points() >= 150);
        let kf0 = map.keyframe_ids()[0];
        let median = map.median_scene_depth(kf0).unwrap();
        assert!((median - 1.0).abs() < 1e-9);
        assert_eq!(atlas.keyframe_db.len(), 2);
    }

    #[test]
    fn test_lost_small_map_resets() {
        let (f1, f2, _, _) = synthetic_pair(200);
        let (mut tracker, shared, _rx) = tracker();
        tracker.track(f1.timestamp, feature_set(&f1)).unwrap();
        tracker.track(f2.timestamp, feature_set(&f2)).unwrap();

        // A featureless frame cannot be tracked against a 2-keyframe map.
        let result = tracker.track(0.2, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::Lost);

        let generation = shared.map_generation();
        let result = tracker.track(0.3, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert_eq!(shared.map_generation(), generation + 1);
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 0);
    }

    /// Initialize on the synthetic pair, then add `extra` copies of the
    /// second keyframe observing the same map points.
    fn tracker_with_large_map(
        extra: usize,
    ) -> (Tracker, Arc<SharedState>, crossbeam_channel::Receiver<NewKeyFrameMsg>, Frame, Frame) {
        let (f1, f2, _, _) = synthetic_pair(200);
        let (mut tracker, shared, rx) = tracker();
        tracker.track(0.0, feature_set(&f1)).unwrap();
        assert_eq!(tracker.track(0.1, feature_set(&f2)).unwrap().state, TrackingState::Ok);

        {
            let mut atlas = shared.atlas.write();
            let map = atlas.active_map_mut();
            let source = map.last_keyframe_id().unwrap();
            let (pose, features, descriptors, links) = {
                let kf = map.get_keyframe(source).unwrap();
                let links: Vec<(usize, MapPointId)> = kf.map_point_indices().collect();
                (kf.pose.clone(), kf.features.clone(), kf.descriptors.clone(), links)
            };
            for i in 0..extra {
                let id = map.create_keyframe(
                    0.1 + 0.01 * (i + 1) as f64,
                    pose.clone(),
                    features.clone(),
                    descriptors.clone(),
                    640.0,
                    480.0,
                );
                for (idx, mp) in &links {
                    map.associate(id, *idx, *mp);
                }
            }
        }
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 2 + extra);
        (tracker, shared, rx, f1, f2)
    }

    #[test]
    fn test_lost_large_map_becomes_recently_lost() {
        let (mut tracker, shared, _rx, _, _) = tracker_with_large_map(10);

        let result = tracker.track(1.0, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::RecentlyLost);
        assert!(result.pose.is_none());
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 12);
    }

    #[test]
    fn test_relocalizes_against_keyframe_database() {
        let (mut tracker, shared, _rx, _, f2) = tracker_with_large_map(10);
        tracker.track(1.0, FeatureSet::default()).unwrap();
        assert_eq!(tracker.state(), TrackingState::RecentlyLost);
        let recorded = tracker.trajectory().len();

        let result = tracker.track(1.5, feature_set(&f2)).unwrap();
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.metrics.n_inliers >= MIN_RELOCALIZATION_INLIERS);
        assert_eq!(tracker.trajectory().len(), recorded + 1);

        let atlas = shared.atlas.read();
        let map = atlas.active_map();
        let kf1 = map.get_keyframe(map.keyframe_ids()[1]).unwrap();
        let pose = result.pose.unwrap();
        assert!((pose.translation - kf1.pose.translation).norm() < 1e-2);
        assert!(pose.rotation.angle_to(&kf1.pose.rotation) < 1e-2);
    }

    #[test]
    fn test_recently_lost_times_out() {
        let (mut tracker, _shared, _rx, _, _) = tracker_with_large_map(10);
        tracker.track(1.0, FeatureSet::default()).unwrap();

        let result = tracker.track(3.0, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::RecentlyLost);

        let result = tracker.track(1.0 + MAX_RECENTLY_LOST_SECS + 0.5, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::Lost);
    }

    #[test]
    fn test_lost_large_map_starts_new_map() {
        let (mut tracker, shared, _rx, f1, f2) = tracker_with_large_map(10);
        tracker.track(1.0, FeatureSet::default()).unwrap();
        tracker.track(6.5, FeatureSet::default()).unwrap();
        assert_eq!(tracker.state(), TrackingState::Lost);

        let generation = shared.map_generation();
        let result = tracker.track(6.6, FeatureSet::default()).unwrap();
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert_eq!(shared.map_generation(), generation + 1);
        let last_old_id = {
            let atlas = shared.atlas.read();
            assert_eq!(atlas.num_maps(), 2);
            assert_eq!(atlas.active_map_index(), 1);
            assert_eq!(atlas.active_map().num_keyframes(), 0);
            assert_eq!(atlas.all_maps()[0].num_keyframes(), 12);
            atlas.all_maps()[0].last_keyframe_id().unwrap()
        };

        tracker.track(7.0, feature_set(&f1)).unwrap();
        let result = tracker.track(7.1, feature_set(&f2)).unwrap();
        assert_eq!(result.state, TrackingState::Ok);

        let atlas = shared.atlas.read();
        let ids = atlas.active_map().keyframe_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| *id > last_old_id));
        assert_eq!(atlas.total_keyframes(), 14);
    }
}
