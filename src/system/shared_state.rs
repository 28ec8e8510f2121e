//! Shared state between Tracking and Local Mapping threads.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::atlas::atlas::Atlas;
use crate::tracking::frame::ScalePyramid;
use crate::vocabulary::OrbVocabulary;

/// Shared state accessible by both Tracking and Local Mapping threads.
pub struct SharedState {
    /// The Atlas containing all maps, keyframes, and map points.
    /// Tracking mostly reads, Local Mapping writes.
    pub atlas: RwLock<Atlas>,

    pub vocabulary: Arc<OrbVocabulary>,

    /// Flow control: when true, Tracking should not create new keyframes.
    /// Set by Local Mapping when the keyframe queue is too long.
    stop_keyframe_creation: AtomicBool,

    /// Bumped whenever the active map is reset or replaced. Keyframes queued
    /// for an older generation are dropped by Local Mapping.
    map_generation: AtomicU64,

    /// Request Local Mapping to finish processing and exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(vocabulary: Arc<OrbVocabulary>, pyramid: ScalePyramid) -> Arc<Self> {
        Arc::new(Self {
            atlas: RwLock::new(Atlas::new(pyramid)),
            vocabulary,
            stop_keyframe_creation: AtomicBool::new(false),
            map_generation: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst)
    }

    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }

    pub fn map_generation(&self) -> u64 {
        self.map_generation.load(Ordering::SeqCst)
    }

    /// Returns the new generation.
    pub fn bump_map_generation(&self) -> u64 {
        self.map_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
