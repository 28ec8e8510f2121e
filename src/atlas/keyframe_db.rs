//! KeyFrameDatabase - inverted word index for relocalization.
//!
//! Every KeyFrame inserted by Local Mapping registers its BoW words here.
//! A lost frame queries the database for KeyFrames of the active map that
//! share enough words with it, scored with the vocabulary L1 similarity.

use std::collections::{BTreeMap, HashMap};

use crate::atlas::map::KeyFrameId;
use crate::vocabulary::{BowVector, OrbVocabulary};

use super::atlas::MapIndex;

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

pub struct KeyFrameDatabase {
    /// word id -> KeyFrames containing the word.
    inverted: HashMap<u32, Vec<KeyFrameId>>,
    entries: BTreeMap<KeyFrameId, (BowVector, MapIndex)>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted: HashMap::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector, map_idx: MapIndex) {
        self.erase(&kf_id);
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().push(kf_id);
        }
        self.entries.insert(kf_id, (bow.clone(), map_idx));
    }

    pub fn erase(&mut self, kf_id: &KeyFrameId) {
        if let Some((bow, _)) = self.entries.remove(kf_id) {
            for word in bow.keys() {
                if let Some(list) = self.inverted.get_mut(word) {
                    list.retain(|id| id != kf_id);
                }
            }
        }
    }

    /// Relocalization candidates from the given map, best first.
    ///
    /// KeyFrames must share at least 80% of the best common-word count, and
    /// only those scoring at least 75% of the best score are returned.
    pub fn detect_relocalization_candidates(
        &self,
        query: &BowVector,
        map_idx: MapIndex,
    ) -> Vec<Candidate> {
        let mut common: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for word in query.keys() {
            if let Some(kfs) = self.inverted.get(word) {
                for kf_id in kfs {
                    if self.entries.get(kf_id).is_some_and(|(_, m)| *m == map_idx) {
                        *common.entry(*kf_id).or_insert(0) += 1;
                    }
                }
            }
        }

        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let min_common = (max_common as f64 * 0.8) as usize;

        let mut cands: Vec<Candidate> = common
            .into_iter()
            .filter(|(_, n)| *n >= min_common)
            .filter_map(|(kf_id, _)| {
                let (bow, _) = self.entries.get(&kf_id)?;
                Some(Candidate {
                    keyframe_id: kf_id,
                    score: OrbVocabulary::score(query, bow),
                })
            })
            .collect();

        let best = cands.iter().map(|c| c.score).fold(0.0, f64::max);
        cands.retain(|c| c.score >= 0.75 * best);
        cands.sort_by(|a, b| b.score.total_cmp(&a.score));
        cands
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[(u32, f64)]) -> BowVector {
        words.iter().copied().collect()
    }

    #[test]
    fn test_candidates_ranked_and_filtered_by_map() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(0), &bow(&[(1, 0.5), (2, 0.5)]), 0);
        db.add(KeyFrameId::new(1), &bow(&[(1, 0.6), (2, 0.4)]), 0);
        db.add(KeyFrameId::new(2), &bow(&[(1, 0.5), (2, 0.5)]), 1);
        db.add(KeyFrameId::new(3), &bow(&[(9, 1.0)]), 0);

        let query = bow(&[(1, 0.5), (2, 0.5)]);
        let cands = db.detect_relocalization_candidates(&query, 0);

        let ids: Vec<u64> = cands.iter().map(|c| c.keyframe_id.0).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!((cands[0].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_erase_removes_from_index() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(0), &bow(&[(1, 1.0)]), 0);
        db.erase(&KeyFrameId::new(0));
        assert!(db.is_empty());
        assert!(db
            .detect_relocalization_candidates(&bow(&[(1, 1.0)]), 0)
            .is_empty());
    }
}
