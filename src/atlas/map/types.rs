//! Handle types for map entities.

/// Identifier of a KeyFrame.
///
/// Assigned by the Atlas so that ids stay unique across all of its maps,
/// which lets the keyframe database key entries by id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a MapPoint (3D landmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(KeyFrameId::new(7).to_string(), "KF7");
        assert_eq!(MapPointId::new(123).to_string(), "MP123");
    }

    #[test]
    fn test_ordering() {
        assert!(KeyFrameId::new(1) < KeyFrameId::new(2));
        let mut ids = vec![MapPointId::new(3), MapPointId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![MapPointId::new(1), MapPointId::new(3)]);
    }
}
