//! Tracking state machine.

use std::fmt;

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame has been processed yet.
    #[default]
    NoImagesYet,
    /// Waiting for a two-view initialization to succeed.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Lost tracking recently, attempting relocalization.
    RecentlyLost,
    /// Lost; the map will be reset or retired on the next frame.
    Lost,
}

impl TrackingState {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoImagesYet => "NO_IMAGES_YET",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Ok => "OK",
            Self::RecentlyLost => "RECENTLY_LOST",
            Self::Lost => "LOST",
        };
        f.write_str(s)
    }
}
