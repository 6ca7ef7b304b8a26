//! KeyFrameDatabase - per-map inverted index for place recognition.
//!
//! Maps visual words to the keyframes containing them. Queries return
//! keyframes sharing enough words with the query BoW vector, scored with the
//! vocabulary similarity; covisibility-group accumulation happens at the
//! call sites, which hold the map lock anyway.

use std::collections::{HashMap, HashSet};

use crate::vocabulary::{BowVector, Vocabulary};

use super::types::KeyFrameId;

/// A retrieval candidate with its BoW similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

#[derive(Default)]
pub struct KeyFrameDatabase {
    /// word id → keyframes whose BoW vector contains the word.
    inverted: HashMap<u32, HashSet<KeyFrameId>>,
    /// Stored BoW vectors, so scoring needs no access to the arena.
    bows: HashMap<KeyFrameId, BowVector>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector) {
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().insert(kf_id);
        }
        self.bows.insert(kf_id, bow);
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        if let Some(bow) = self.bows.remove(&kf_id) {
            for word in bow.keys() {
                if let Some(set) = self.inverted.get_mut(word) {
                    set.remove(&kf_id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bows.is_empty()
    }

    /// Keyframes sharing visual words with `query`, excluding `exclude`,
    /// scored and filtered.
    ///
    /// Follows the standard two-stage retrieval: only candidates sharing at
    /// least 80% of the maximum common-word count are scored, then those
    /// below `min_score` are dropped. Results are sorted by descending score.
    pub fn query(
        &self,
        query: &BowVector,
        exclude: &HashSet<KeyFrameId>,
        min_score: f64,
    ) -> Vec<Candidate> {
        let mut shared_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            if let Some(kfs) = self.inverted.get(word) {
                for kf in kfs {
                    if !exclude.contains(kf) {
                        *shared_words.entry(*kf).or_insert(0) += 1;
                    }
                }
            }
        }
        if shared_words.is_empty() {
            return Vec::new();
        }

        let max_common = shared_words.values().copied().max().unwrap_or(0);
        let min_common = ((max_common as f64) * 0.8).floor() as usize;

        let mut candidates: Vec<Candidate> = shared_words
            .into_iter()
            .filter(|(_, n)| *n >= min_common.max(1))
            .filter_map(|(kf_id, _)| {
                let bow = self.bows.get(&kf_id)?;
                let score = Vocabulary::score(query, bow);
                (score >= min_score).then_some(Candidate {
                    keyframe_id: kf_id,
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, DESCRIPTOR_BYTES};

    fn word(fill: u8) -> Descriptor {
        Descriptor([fill; DESCRIPTOR_BYTES])
    }

    #[test]
    fn test_query_finds_similar_keyframe() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff), word(0x0f)]);
        let mut db = KeyFrameDatabase::new();

        let (bow_a, _) = vocab.transform(&[word(0x00), word(0x0f)]);
        let (bow_b, _) = vocab.transform(&[word(0xff)]);
        let kf_a = KeyFrameId(1);
        let kf_b = KeyFrameId(2);
        db.add(kf_a, bow_a.clone());
        db.add(kf_b, bow_b);

        let hits = db.query(&bow_a, &HashSet::new(), 0.1);
        assert_eq!(hits[0].keyframe_id, kf_a);
        assert!(hits[0].score > 0.9);
    }

    #[test]
    fn test_query_respects_exclusion() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff)]);
        let mut db = KeyFrameDatabase::new();
        let (bow, _) = vocab.transform(&[word(0x00)]);
        let kf = KeyFrameId(7);
        db.add(kf, bow.clone());

        let mut exclude = HashSet::new();
        exclude.insert(kf);
        assert!(db.query(&bow, &exclude, 0.0).is_empty());
    }

    #[test]
    fn test_erase_removes_all_words() {
        let vocab = Vocabulary::from_words(vec![word(0x00), word(0xff)]);
        let mut db = KeyFrameDatabase::new();
        let (bow, _) = vocab.transform(&[word(0x00), word(0xff)]);
        let kf = KeyFrameId(3);
        db.add(kf, bow.clone());
        db.erase(kf);

        assert!(db.is_empty());
        assert!(db.query(&bow, &HashSet::new(), 0.0).is_empty());
    }
}
