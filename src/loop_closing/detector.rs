//! Revisit-candidate detection with covisibility-group temporal consistency.
//!
//! Candidates come from a keyframe database, excluding the query's direct
//! covisibles, thresholded at the lowest BoW score the query reaches against
//! its own covisible group. A candidate only survives once its covisibility
//! group has been re-detected over enough consecutive keyframes. LoopClosing
//! runs the query against the current map's database; MapMerging points the
//! same mechanism at the databases of the other maps.

use std::collections::HashSet;

use crate::map::{KeyFrameId, Map};
use crate::vocabulary::{BowVector, Vocabulary};

/// Consecutive keyframes that must agree on a candidate group.
pub const CONSISTENCY_THRESHOLD: usize = 3;

/// A candidate group seen recently, with its consistency run length.
struct ConsistentGroup {
    members: HashSet<KeyFrameId>,
    count: usize,
}

/// Tracks candidate groups across consecutive keyframes.
#[derive(Default)]
pub struct ConsistencyChecker {
    groups: Vec<ConsistentGroup>,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Feed this keyframe's raw candidates from `map`; returns those whose
    /// group has been consistent for at least [`CONSISTENCY_THRESHOLD`]
    /// keyframes.
    pub fn check(&mut self, map: &Map, candidates: &[KeyFrameId]) -> Vec<KeyFrameId> {
        let groups = candidates
            .iter()
            .map(|&c| (c, candidate_group(map, c)))
            .collect();
        self.check_groups(groups)
    }

    /// Consistency bookkeeping over pre-expanded candidate groups. Used
    /// directly when candidates span several maps and their groups must be
    /// expanded against each candidate's own map.
    pub fn check_groups(
        &mut self,
        candidates: Vec<(KeyFrameId, HashSet<KeyFrameId>)>,
    ) -> Vec<KeyFrameId> {
        let mut enough_consistent = Vec::new();
        let mut new_groups: Vec<ConsistentGroup> = Vec::new();

        for (candidate, members) in candidates {
            let mut best_count = 0usize;
            for group in &self.groups {
                if !group.members.is_disjoint(&members) {
                    best_count = best_count.max(group.count + 1);
                }
            }

            if best_count >= CONSISTENCY_THRESHOLD {
                enough_consistent.push(candidate);
            }
            new_groups.push(ConsistentGroup {
                members,
                count: best_count,
            });
        }

        self.groups = new_groups;
        enough_consistent
    }
}

/// A candidate's covisibility group: itself plus its direct covisibles.
pub fn candidate_group(map: &Map, candidate: KeyFrameId) -> HashSet<KeyFrameId> {
    let mut members: HashSet<KeyFrameId> = HashSet::new();
    members.insert(candidate);
    if let Some(kf) = map.keyframe(candidate) {
        members.extend(kf.covisibility_weights().keys().copied());
    }
    members
}

/// The retrieval query a keyframe poses: its BoW vector, the keyframes to
/// exclude (itself and its direct covisibles), and the minimum-score floor
/// derived from its own covisible group.
pub struct BowQuery {
    pub bow: BowVector,
    pub exclude: HashSet<KeyFrameId>,
    pub min_score: f64,
}

/// Build the query context for `kf_id`.
///
/// The score floor is the minimum BoW similarity between the keyframe and
/// its covisibles, so a revisit must look at least as similar as the
/// keyframe's own neighborhood.
pub fn bow_query(map: &Map, kf_id: KeyFrameId) -> Option<BowQuery> {
    let kf = map.keyframe(kf_id)?;
    let bow = kf.bow.as_ref()?.clone();

    let mut exclude: HashSet<KeyFrameId> = HashSet::new();
    exclude.insert(kf_id);
    exclude.extend(kf.covisibility_weights().keys().copied());

    let mut min_score = 1.0f64;
    for other_id in kf.covisibility_weights().keys() {
        if let Some(other_bow) = map.keyframe(*other_id).and_then(|o| o.bow.as_ref()) {
            min_score = min_score.min(Vocabulary::score(&bow, other_bow));
        }
    }

    Some(BowQuery {
        bow,
        exclude,
        min_score,
    })
}

/// Query the current map's database for loop candidates of `kf_id`.
pub fn detect_candidates(map: &Map, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
    let Some(query) = bow_query(map, kf_id) else {
        return Vec::new();
    };
    detect_candidates_in_map(&query, map)
}

/// Run a prepared query against (possibly another) map's database.
pub fn detect_candidates_in_map(query: &BowQuery, map: &Map) -> Vec<KeyFrameId> {
    map.keyframe_db
        .query(&query.bow, &query.exclude, query.min_score)
        .into_iter()
        .map(|c| c.keyframe_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, DESCRIPTOR_BYTES};
    use crate::map::MapId;

    #[test]
    fn test_consistency_needs_three_hits() {
        let map = Map::new(MapId::next());
        let mut checker = ConsistencyChecker::new();
        let candidate = KeyFrameId(1000);

        assert!(checker.check(&map, &[candidate]).is_empty());
        assert!(checker.check(&map, &[candidate]).is_empty());
        assert!(checker.check(&map, &[candidate]).is_empty());
        // Fourth consecutive detection carries a run of three behind it.
        let passed = checker.check(&map, &[candidate]);
        assert_eq!(passed, vec![candidate]);
    }

    #[test]
    fn test_interruption_resets_run() {
        let map = Map::new(MapId::next());
        let mut checker = ConsistencyChecker::new();
        let candidate = KeyFrameId(2000);

        checker.check(&map, &[candidate]);
        checker.check(&map, &[candidate]);
        checker.check(&map, &[]); // a keyframe with no candidates
        checker.check(&map, &[candidate]);
        let passed = checker.check(&map, &[candidate]);
        assert!(passed.is_empty());
    }

    fn word(tag: u8) -> Descriptor {
        let mut d = [0u8; DESCRIPTOR_BYTES];
        d[0] = tag;
        d[8] = tag.wrapping_mul(37);
        d[16] = tag.wrapping_mul(101);
        Descriptor(d)
    }

    /// The cross-map query keeps the floor derived from the query keyframe's
    /// own covisible group: a weakly similar foreign keyframe is rejected,
    /// a strong one passes.
    #[test]
    fn test_cross_map_query_applies_score_floor() {
        use crate::features::{Camera, Features, KeyPoint, ScalePyramid};
        use crate::map::{Frame, KeyFrame};
        use crate::vocabulary::Vocabulary;
        use std::sync::Arc;

        let vocab = Arc::new(Vocabulary::from_words(vec![
            word(1),
            word(2),
            word(3),
            word(4),
        ]));
        let camera = Camera {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            width: 640,
            height: 480,
        };
        let make_kf = |map: &mut Map, descriptors: Vec<Descriptor>| {
            let features = Features {
                keypoints: descriptors
                    .iter()
                    .enumerate()
                    .map(|(i, _)| KeyPoint {
                        x: 10.0 * i as f64,
                        y: 10.0,
                        octave: 0,
                        angle: 0.0,
                    })
                    .collect(),
                descriptors,
            };
            let mut frame = Frame::new(0, 0.0, features, camera, ScalePyramid::default());
            frame.ensure_bow(&vocab);
            let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
            map.insert_keyframe(kf)
        };

        // Query keyframe sees words {1, 2}; its covisible sees {1, 3}, which
        // puts the score floor at 0.5.
        let mut map_a = Map::new(MapId::next());
        let query_kf = make_kf(&mut map_a, vec![word(1), word(2)]);
        let cov_kf = make_kf(&mut map_a, vec![word(1), word(3)]);
        map_a
            .keyframe_mut(query_kf)
            .unwrap()
            .add_covisibility(cov_kf, 20);
        map_a
            .keyframe_mut(cov_kf)
            .unwrap()
            .add_covisibility(query_kf, 20);

        // The other map holds one strong candidate (identical words) and one
        // weak candidate sharing a single word out of three.
        let mut map_b = Map::new(MapId::next());
        let strong = make_kf(&mut map_b, vec![word(1), word(2)]);
        let weak = make_kf(&mut map_b, vec![word(2), word(3), word(4)]);
        for kf_id in [strong, weak] {
            let bow = map_b.keyframe(kf_id).unwrap().bow.clone().unwrap();
            map_b.keyframe_db.add(kf_id, bow);
        }

        let query = bow_query(&map_a, query_kf).unwrap();
        assert!((query.min_score - 0.5).abs() < 1e-9);
        assert!(query.exclude.contains(&cov_kf));

        let hits = detect_candidates_in_map(&query, &map_b);
        assert_eq!(hits, vec![strong]);
    }
}
