//! Hierarchical visual-word vocabulary for Bag-of-Words place recognition.
//!
//! The vocabulary is trained offline (DBoW2 text format) and loaded once at
//! startup; afterwards it is an immutable, shared resource exposing
//! `transform(descriptors) -> (BowVector, FeatureVector)` and a similarity
//! score between BoW vectors.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::features::{Descriptor, DESCRIPTOR_BYTES};

/// Bag-of-Words vector: word id → L1-normalized TF-IDF weight.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: vocabulary node id → feature indices quantized there.
///
/// Grouping features by a mid-level tree node lets the matcher compare only
/// features that share a node instead of all pairs.
pub type FeatureVector = HashMap<u32, Vec<usize>>;

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary io error: {0}")]
    Io(String),
    #[error("vocabulary parse error: {0}")]
    Parse(String),
}

struct Node {
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
}

/// Vocabulary tree with branching factor `k` and depth `l`.
pub struct Vocabulary {
    nodes: Vec<Node>,
    n_words: usize,
    l: usize,
}

impl Vocabulary {
    /// Load a vocabulary from the DBoW2 text format.
    ///
    /// Header line `k L scoring weighting`, then one line per non-root node:
    /// `parent_id is_leaf byte[0] .. byte[31] weight`.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let file = File::open(path.as_ref()).map_err(|e| VocabularyError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary file".into()))?
            .map_err(|e| VocabularyError::Io(e.to_string()))?;
        let parts: Vec<&str> = header.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(VocabularyError::Parse("header must be `k L ...`".into()));
        }
        let _k: usize = parts[0]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid k".into()))?;
        let l: usize = parts[1]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid L".into()))?;

        let mut nodes = vec![Node {
            children: Vec::new(),
            descriptor: Descriptor([0u8; DESCRIPTOR_BYTES]),
            weight: 0.0,
            word_id: None,
        }];
        let mut n_words = 0usize;

        for (line_num, line) in lines.enumerate() {
            let line = line.map_err(|e| VocabularyError::Io(e.to_string()))?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 + DESCRIPTOR_BYTES + 1 {
                continue; // tolerate trailing blank/short lines
            }

            let parent: u32 = parts[0].parse().map_err(|_| {
                VocabularyError::Parse(format!("invalid parent id at line {}", line_num + 2))
            })?;
            let is_leaf = parts[1] != "0";
            let mut descriptor = [0u8; DESCRIPTOR_BYTES];
            for (i, byte) in descriptor.iter_mut().enumerate() {
                *byte = parts[2 + i].parse().map_err(|_| {
                    VocabularyError::Parse(format!("invalid descriptor at line {}", line_num + 2))
                })?;
            }
            let weight: f64 = parts[2 + DESCRIPTOR_BYTES].parse().map_err(|_| {
                VocabularyError::Parse(format!("invalid weight at line {}", line_num + 2))
            })?;

            let id = nodes.len() as u32;
            if (parent as usize) >= nodes.len() {
                return Err(VocabularyError::Parse(format!(
                    "node {} references unknown parent {}",
                    id, parent
                )));
            }
            nodes[parent as usize].children.push(id);
            let word_id = if is_leaf {
                let w = n_words as u32;
                n_words += 1;
                Some(w)
            } else {
                None
            };
            nodes.push(Node {
                children: Vec::new(),
                descriptor: Descriptor(descriptor),
                weight,
                word_id,
            });
        }

        if n_words == 0 {
            return Err(VocabularyError::Parse("vocabulary has no words".into()));
        }

        Ok(Self { nodes, n_words, l })
    }

    /// Build a flat single-level vocabulary from explicit word descriptors.
    ///
    /// Small flat vocabularies are enough for the plumbing (inverted index,
    /// BoW scores) when no trained tree is available.
    pub fn from_words(words: Vec<Descriptor>) -> Self {
        let mut nodes = vec![Node {
            children: Vec::new(),
            descriptor: Descriptor([0u8; DESCRIPTOR_BYTES]),
            weight: 0.0,
            word_id: None,
        }];
        let n_words = words.len();
        for (i, descriptor) in words.into_iter().enumerate() {
            let id = nodes.len() as u32;
            nodes[0].children.push(id);
            nodes.push(Node {
                children: Vec::new(),
                descriptor,
                weight: 1.0,
                word_id: Some(i as u32),
            });
        }
        Self {
            nodes,
            n_words,
            l: 1,
        }
    }

    /// Number of visual words (leaves).
    pub fn num_words(&self) -> usize {
        self.n_words
    }

    /// Quantize one descriptor: descend the tree by Hamming distance.
    ///
    /// Returns `(word_id, word_weight, grouping_node_id)` where the grouping
    /// node sits `levels_up` levels above the leaf.
    fn quantize(&self, descriptor: &Descriptor, levels_up: usize) -> (u32, f64, u32) {
        let mut node = 0u32;
        let mut path = vec![node];
        while !self.nodes[node as usize].children.is_empty() {
            let best = self.nodes[node as usize]
                .children
                .iter()
                .min_by_key(|&&c| self.nodes[c as usize].descriptor.distance(descriptor))
                .copied()
                .unwrap_or(node);
            node = best;
            path.push(node);
        }
        let leaf = &self.nodes[node as usize];
        let group = path[path.len().saturating_sub(1 + levels_up)];
        (leaf.word_id.unwrap_or(0), leaf.weight, group)
    }

    /// Transform a descriptor set into a BoW vector and feature vector.
    ///
    /// The BoW vector is L1-normalized; features are grouped at level L-2
    /// (or at the leaves for shallow trees).
    pub fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector) {
        let levels_up = if self.l > 2 { 2 } else { 0 };

        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();
        for (idx, d) in descriptors.iter().enumerate() {
            let (word, weight, group) = self.quantize(d, levels_up);
            if weight > 0.0 {
                *bow.entry(word).or_insert(0.0) += weight;
            }
            features.entry(group).or_default().push(idx);
        }

        let norm: f64 = bow.values().sum();
        if norm > 0.0 {
            for w in bow.values_mut() {
                *w /= norm;
            }
        }
        (bow, features)
    }

    /// L1 similarity between two normalized BoW vectors, in `[0, 1]`.
    pub fn score(a: &BowVector, b: &BowVector) -> f64 {
        // 1 - 0.5 * Σ|a_i - b_i|, computed over the union of words.
        let mut sum = 0.0;
        for (word, wa) in a {
            match b.get(word) {
                Some(wb) => sum += (wa - wb).abs() - wa - wb,
                None => {}
            }
        }
        let total_a: f64 = a.values().sum();
        let total_b: f64 = b.values().sum();
        1.0 - 0.5 * (sum + total_a + total_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(fill: u8) -> Descriptor {
        Descriptor([fill; DESCRIPTOR_BYTES])
    }

    #[test]
    fn test_flat_vocabulary_transform() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff), word(0x0f)]);
        assert_eq!(vocab.num_words(), 3);

        let (bow, features) = vocab.transform(&[word(0x00), word(0x01), word(0xfe)]);
        // Two descriptors near word 0, one near word 1.
        assert_eq!(features.values().map(|v| v.len()).sum::<usize>(), 3);
        let norm: f64 = bow.values().sum();
        assert!((norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_self_is_one() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff)]);
        let (bow, _) = vocab.transform(&[word(0x00), word(0xff), word(0xff)]);
        let s = Vocabulary::score(&bow, &bow);
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_disjoint_is_zero() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff)]);
        let (a, _) = vocab.transform(&[word(0x00)]);
        let (b, _) = vocab.transform(&[word(0xff)]);
        let s = Vocabulary::score(&a, &b);
        assert!(s.abs() < 1e-9);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff), word(0xf0)]);
        let descs = [word(0x00), word(0xf0), word(0xff), word(0x01)];
        let (bow1, fv1) = vocab.transform(&descs);
        let (bow2, fv2) = vocab.transform(&descs);
        assert_eq!(bow1.len(), bow2.len());
        for (w, v) in &bow1 {
            assert!((bow2[w] - v).abs() < 1e-15);
        }
        assert_eq!(fv1, fv2);
    }
}
