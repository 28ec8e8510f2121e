//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Inserts keyframe into the map and the keyframe database
//! 2. Associates matched map points
//! 3. Updates covisibility graph (automatic via associate)
//! 4. Triangulates new map points against neighbor keyframes
//! 5. Map point culling (removes recently created low-quality points)

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::CameraModel;
use crate::vocabulary::FEATURE_VECTOR_LEVELS_UP;

use super::triangulation::{TriangulationConfig, triangulate_from_neighbors};

/// Flow control threshold: if queue has more than this many keyframes,
/// signal Tracking to stop creating new ones.
const MAX_QUEUE_SIZE: usize = 3;

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Recent map points seen by this many keyframes or fewer are culled.
const CULL_MIN_OBSERVATIONS: usize = 2;

/// Local Mapping thread state.
pub struct LocalMapper {
    /// Camera model for triangulation.
    camera: CameraModel,

    /// Map points created recently, still on probation.
    recent_map_points: Vec<MapPointId>,

    /// Map generation of the points in `recent_map_points`.
    generation: u64,

    processed: usize,
}

impl LocalMapper {
    pub fn new(camera: CameraModel) -> Self {
        Self {
            camera,
            recent_map_points: Vec::new(),
            generation: 0,
            processed: 0,
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        info!("Local Mapping started");
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            // Update flow control based on queue size
            let queue_len = kf_receiver.len();
            shared.set_stop_keyframe_creation(queue_len > MAX_QUEUE_SIZE);

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.process_keyframe(msg, &shared),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        shared.set_stop_keyframe_creation(false);
        info!(keyframes = self.processed, "Local Mapping finished");
    }

    /// Process a single keyframe message.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &Arc<SharedState>) {
        // Step 1: Insert keyframe into the map
        let Some(kf_id) = self.insert_keyframe(&msg, shared) else {
            debug!(
                "[LocalMapping] dropped keyframe from generation {} (current {})",
                msg.map_generation,
                shared.map_generation()
            );
            return;
        };
        self.processed += 1;

        // Step 2: Associate existing map point matches
        self.associate_matched_points(&msg, kf_id, shared);

        // Step 3: Triangulate new map points against neighbors
        self.triangulate_from_neighbors(kf_id, shared);

        // Step 4: Cull recent map points
        self.cull_map_points(kf_id, shared);
    }

    /// Insert the keyframe into the map.
    ///
    /// Returns `None` when the keyframe was tracked against a map that has
    /// since been reset or replaced.
    fn insert_keyframe(&mut self, msg: &NewKeyFrameMsg, shared: &Arc<SharedState>) -> Option<KeyFrameId> {
        let (bow, feat) = shared
            .vocabulary
            .transform(&msg.descriptors, FEATURE_VECTOR_LEVELS_UP);

        let mut atlas = shared.atlas.write();
        // The tracker bumps the generation under the same lock.
        let generation = shared.map_generation();
        if msg.map_generation != generation {
            return None;
        }
        if generation != self.generation {
            self.recent_map_points.clear();
            self.generation = generation;
        }

        let map_idx = atlas.active_map_index();
        let map = atlas.active_map_mut();
        let kf_id = map.create_keyframe(
            msg.timestamp,
            msg.pose.clone(),
            msg.features.clone(),
            msg.descriptors.clone(),
            msg.img_width,
            msg.img_height,
        );
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.set_bow(bow.clone(), feat);
        }
        atlas.keyframe_db.add(kf_id, &bow, map_idx);

        Some(kf_id)
    }

    /// Associate map points that were matched during tracking.
    fn associate_matched_points(&self, msg: &NewKeyFrameMsg, kf_id: KeyFrameId, shared: &Arc<SharedState>) {
        let mut atlas = shared.atlas.write();
        let map = atlas.active_map_mut();

        for (feat_idx, mp_id_opt) in msg.matched_map_points.iter().enumerate() {
            let Some(mp_id) = mp_id_opt else {
                continue;
            };
            if !map.get_map_point(*mp_id).is_some_and(|mp| !mp.is_bad) {
                continue;
            }
            // Create bidirectional association (also updates covisibility)
            if map.associate(kf_id, feat_idx, *mp_id) {
                map.update_map_point_normal_and_depth(*mp_id);
                map.update_map_point_descriptor(*mp_id);
            }
        }
    }

    /// Multi-frame triangulation with geometric validation.
    fn triangulate_from_neighbors(&mut self, kf_id: KeyFrameId, shared: &Arc<SharedState>) {
        let config = TriangulationConfig::default();

        let mut atlas = shared.atlas.write();
        let map = atlas.active_map_mut();

        let result = triangulate_from_neighbors(map, kf_id, &self.camera, &config);
        self.recent_map_points.extend(result.new_points);
    }

    /// Cull recently created map points that are rarely found or observed.
    fn cull_map_points(&mut self, current_kf_id: KeyFrameId, shared: &Arc<SharedState>) {
        let mut atlas = shared.atlas.write();
        let map = atlas.active_map_mut();

        let num_culled =
            map.cull_recent_map_points(&mut self.recent_map_points, current_kf_id, CULL_MIN_OBSERVATIONS);

        if num_culled > 0 {
            debug!(
                "[MapCulling] Removed {} bad map points (remaining: {})",
                num_culled,
                map.num_map_points()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::ScalePyramid;
    use crate::tracking::initializer::tests::synthetic_pair;
    use crate::tracking::tracking_frame::Frame;
    use crate::vocabulary::two_word_vocabulary;

    fn message(frame: &Frame, pose: SE3, generation: u64) -> NewKeyFrameMsg {
        NewKeyFrameMsg {
            map_generation: generation,
            timestamp: frame.timestamp,
            pose,
            features: frame.features.clone(),
            descriptors: frame.descriptors.clone(),
            matched_map_points: vec![None; frame.num_features()],
            img_width: 640.0,
            img_height: 480.0,
        }
    }

    fn shared() -> Arc<SharedState> {
        SharedState::new(Arc::new(two_word_vocabulary()), ScalePyramid::new(1.2, 8))
    }

    #[test]
    fn test_keyframes_are_inserted_and_triangulated() {
        let (f1, f2, camera, pose_21) = synthetic_pair(100);
        let shared = shared();
        let mut mapper = LocalMapper::new(camera);

        mapper.process_keyframe(message(&f1, SE3::identity(), 0), &shared);
        mapper.process_keyframe(message(&f2, pose_21.inverse(), 0), &shared);

        let atlas = shared.atlas.read();
        assert_eq!(atlas.active_map().num_keyframes(), 2);
        assert_eq!(atlas.keyframe_db.len(), 2);
        assert!(atlas.active_map().num_map_points() >= 50);
        assert!(atlas.active_map().keyframes().all(|kf| kf.bow_vector().is_some()));
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let (f1, _, camera, _) = synthetic_pair(20);
        let shared = shared();
        shared.bump_map_generation();
        let mut mapper = LocalMapper::new(camera);

        mapper.process_keyframe(message(&f1, SE3::identity(), 0), &shared);
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 0);

        mapper.process_keyframe(message(&f1, SE3::identity(), 1), &shared);
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 1);
    }

    #[test]
    fn test_tracked_matches_are_associated() {
        let (f1, f2, camera, pose_21) = synthetic_pair(40);
        let shared = shared();
        let mp = {
            let mut atlas = shared.atlas.write();
            let map = atlas.active_map_mut();
            let kf = map.create_keyframe(0.0, SE3::identity(), f1.features.clone(), f1.descriptors.clone(), 640.0, 480.0);
            let mp = map.create_map_point(nalgebra::Vector3::new(0.0, 0.0, 5.0), f1.descriptors[0], kf);
            map.associate(kf, 0, mp);
            mp
        };

        let mut mapper = LocalMapper::new(camera);
        let mut msg = message(&f2, pose_21.inverse(), 0);
        msg.matched_map_points[0] = Some(mp);
        mapper.process_keyframe(msg, &shared);

        let atlas = shared.atlas.read();
        let point = atlas.active_map().get_map_point(mp).unwrap();
        assert_eq!(point.num_observations(), 2);
    }

    #[test]
    fn test_run_exits_when_channel_closes() {
        let (tx, rx) = crossbeam_channel::bounded::<NewKeyFrameMsg>(5);
        drop(tx);
        let shared = shared();
        let mut mapper = LocalMapper::new(CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480));
        mapper.run(rx, shared.clone());
        assert!(!shared.should_stop_keyframe_creation());
    }
}
