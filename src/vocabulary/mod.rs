//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! Loads a DBoW2 text vocabulary (hierarchical k-means tree over ORB
//! descriptors) and quantizes descriptor sets into:
//!
//! - [`BowVector`]: word id -> L1-normalized TF-IDF weight, used for scoring
//!   relocalization candidates
//! - [`FeatureVector`]: tree node -> feature indices, used to restrict
//!   descriptor matching to features that fall under the same node

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::tracking::frame::{Descriptor, descriptor_distance};

/// Bag-of-Words vector: word_id -> TF-IDF weight.
pub type BowVector = BTreeMap<u32, f64>;

/// Feature vector: node_id -> list of feature indices.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Levels above the leaves at which FeatureVector groups features.
pub const FEATURE_VECTOR_LEVELS_UP: usize = 4;

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("failed to read vocabulary {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("vocabulary parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("vocabulary is empty")]
    Empty,
}

#[derive(Debug, Clone)]
struct VocabNode {
    parent: u32,
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn root() -> Self {
        Self {
            parent: u32::MAX,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// ORB Vocabulary tree (DBoW2 text format).
#[derive(Debug)]
pub struct OrbVocabulary {
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load vocabulary from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] ... desc[31] weight
    /// ...
    /// ```
    ///
    /// Node lines follow in id order (the root is implicit node 0).
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| VocabularyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(BufReader::new(file)).map_err(|e| match e {
            VocabularyError::Io { source, .. } => VocabularyError::Io {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();

        let header = lines.next().ok_or(VocabularyError::Empty)?.map_err(io_err)?;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(VocabularyError::Parse {
                line: 1,
                msg: "expected header `k L [scoring weighting]`".to_string(),
            });
        }
        let k: usize = parse_field(header_parts[0], 1, "k")?;
        let l: usize = parse_field(header_parts[1], 1, "L")?;

        let mut nodes = vec![VocabNode::root()];
        let mut num_words = 0u32;

        for (idx, line) in lines.enumerate() {
            let line_no = idx + 2;
            let line = line.map_err(io_err)?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 35 {
                continue;
            }

            let parent: u32 = parse_field(parts[0], line_no, "parent id")?;
            let is_leaf = parts[1] == "1";
            let mut descriptor = [0u8; 32];
            for (byte, field) in descriptor.iter_mut().zip(&parts[2..34]) {
                *byte = parse_field(field, line_no, "descriptor byte")?;
            }
            let weight: f64 = parse_field(parts[34], line_no, "weight")?;

            let node_id = nodes.len() as u32;
            let word_id = is_leaf.then(|| {
                num_words += 1;
                num_words - 1
            });
            match nodes.get_mut(parent as usize) {
                Some(p) => p.children.push(node_id),
                None => {
                    return Err(VocabularyError::Parse {
                        line: line_no,
                        msg: format!("parent {parent} not defined before child"),
                    });
                }
            }
            nodes.push(VocabNode {
                parent,
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
        }

        if num_words == 0 {
            return Err(VocabularyError::Empty);
        }

        tracing::info!(k, l, nodes = nodes.len(), words = num_words, "Loaded vocabulary");

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        })
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend the tree following the closest child. Returns (word_id, leaf node id).
    fn quantize(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node_id = 0usize;
        while let Some(&first) = self.nodes[node_id].children.first() {
            let mut best_child = first;
            let mut best_dist = descriptor_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }
        (self.nodes[node_id].word_id.unwrap_or(0), node_id as u32)
    }

    fn ancestor(&self, node_id: u32, levels_up: usize) -> u32 {
        let mut id = node_id;
        for _ in 0..levels_up {
            let parent = self.nodes[id as usize].parent;
            if parent == u32::MAX {
                break;
            }
            id = parent;
        }
        id
    }

    /// Quantize a descriptor set into a BowVector and a FeatureVector.
    ///
    /// `levels_up` selects the FeatureVector grouping node relative to the leaves.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id) = self.quantize(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf_id as usize].weight;
            feat.entry(self.ancestor(leaf_id, levels_up))
                .or_default()
                .push(i);
        }

        let sum: f64 = bow.values().map(|v| v.abs()).sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }

        (bow, feat)
    }

    /// L1 similarity: 1 - 0.5 * ||v1 - v2||_1, in [0, 1].
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        1.0 - 0.5 * diff_sum
    }
}

fn io_err(source: std::io::Error) -> VocabularyError {
    VocabularyError::Io {
        path: String::new(),
        source,
    }
}

fn parse_field<T: std::str::FromStr>(s: &str, line: usize, what: &str) -> Result<T, VocabularyError> {
    s.parse().map_err(|_| VocabularyError::Parse {
        line,
        msg: format!("invalid {what} `{s}`"),
    })
}

/// Vocabulary with two leaf words, all-zero and all-one descriptors.
#[cfg(test)]
pub(crate) fn two_word_vocabulary() -> OrbVocabulary {
    let line = |byte: u8| {
        let desc: Vec<String> = (0..32).map(|_| byte.to_string()).collect();
        format!("0 1 {} 1.0", desc.join(" "))
    };
    let text = ["2 1 0 0".to_string(), line(0x00), line(0xFF)].join("\n");
    match OrbVocabulary::from_reader(text.as_bytes()) {
        Ok(vocab) => vocab,
        Err(e) => panic!("test vocabulary: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_line(parent: u32, leaf: bool, byte: u8, weight: f64) -> String {
        let desc: Vec<String> = (0..32).map(|_| byte.to_string()).collect();
        format!("{} {} {} {}", parent, if leaf { 1 } else { 0 }, desc.join(" "), weight)
    }

    /// Two-level tree: root -> {1: 0x00, 2: 0xFF}, 1 -> {3, 4}, 2 -> {5}.
    fn tiny_vocabulary() -> OrbVocabulary {
        let text = [
            "2 2 0 0".to_string(),
            node_line(0, false, 0x00, 0.0),
            node_line(0, false, 0xFF, 0.0),
            node_line(1, true, 0x00, 1.0),
            node_line(1, true, 0x0F, 2.0),
            node_line(2, true, 0xFF, 3.0),
        ]
        .join("\n");
        OrbVocabulary::from_reader(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_from_reader() {
        let vocab = tiny_vocabulary();
        assert_eq!(vocab.params(), (2, 2));
        assert_eq!(vocab.num_nodes(), 6);
        assert_eq!(vocab.num_words(), 3);
    }

    #[test]
    fn test_transform_groups_and_normalizes() {
        let vocab = tiny_vocabulary();
        let descs = [[0x00u8; 32], [0x0Eu8; 32], [0xFFu8; 32]];
        let (bow, feat) = vocab.transform(&descs, 1);

        // Words 0, 1, 2 with weights 1, 2, 3 normalized by 6.
        assert!((bow[&0] - 1.0 / 6.0).abs() < 1e-12);
        assert!((bow[&1] - 2.0 / 6.0).abs() < 1e-12);
        assert!((bow[&2] - 3.0 / 6.0).abs() < 1e-12);

        assert_eq!(feat[&1], vec![0, 1]);
        assert_eq!(feat[&2], vec![2]);
    }

    #[test]
    fn test_bow_score() {
        let v1: BowVector = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let v2 = v1.clone();
        assert!((OrbVocabulary::score(&v1, &v2) - 1.0).abs() < 1e-10);

        let v3: BowVector = [(2, 0.5), (3, 0.5)].into_iter().collect();
        assert!(OrbVocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_rejects_bad_header() {
        let err = OrbVocabulary::from_reader("garbage".as_bytes()).unwrap_err();
        assert!(matches!(err, VocabularyError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = OrbVocabulary::load_from_text("/nonexistent/ORBvoc.txt").unwrap_err();
        assert!(matches!(err, VocabularyError::Io { .. }));
    }
}
