//! Admissible lower bound for partial assignments.
//!
//! The bound extends a chosen prefix with the relaxation "every remaining
//! sample gets its nearest candidate", then corrects that relaxation for the
//! candidate-code collisions it would cause. At least one sample in every
//! colliding group must settle for its second-best candidate, so no real
//! completion can score below the corrected estimate.

use std::collections::{BTreeMap, HashSet};

use crate::index::CandidateList;

/// Heuristic total for a partial assignment: exact cost of the chosen prefix
/// plus the collision-corrected optimistic cost of the remainder.
///
/// `chosen[i]` is the candidate-list index picked for sample `i`; samples
/// `chosen.len()..` are unassigned. Returns `f64::INFINITY` when the
/// relaxation is infeasible along this branch (some colliding sample has no
/// second-best candidate to fall back to), which callers treat as a pruning
/// signal, not an error.
pub fn lower_bound(lists: &[CandidateList], chosen: &[usize]) -> f64 {
    let prefix_len = chosen.len();

    let mut score = 0.0;
    let mut used: HashSet<u32> = HashSet::with_capacity(prefix_len);
    for (list, &pick) in lists.iter().zip(chosen) {
        score += list[pick].dist_sq;
        used.insert(list[pick].code);
    }

    // Partition the unassigned samples by the code of their nearest candidate.
    // BTreeMap fixes the float accumulation order, so identical inputs always
    // produce bit-identical scores.
    let mut collisions: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (i, list) in lists.iter().enumerate().skip(prefix_len) {
        let Some(nearest) = list.first() else {
            return f64::INFINITY;
        };
        collisions.entry(nearest.code).or_default().push(i);
    }

    for (code, group) in &collisions {
        if used.contains(code) {
            // The prefix owns this code: every sample in the group falls back
            // to its second-best candidate.
            for &i in group {
                match lists[i].get(1) {
                    Some(second) => score += second.dist_sq,
                    None => return f64::INFINITY,
                }
            }
        } else if group.len() == 1 {
            // Common case with a fast path.
            score += lists[group[0]][0].dist_sq;
        } else {
            // Several samples claim the same nearest candidate. Exactly one
            // keeps it; picking the one with the largest gap between best and
            // second-best minimizes the total correction. A sample with no
            // second-best must be the keeper, and there can be only one such.
            let mut max_gap = 0.0_f64;
            let mut keeper_is_forced = false;
            for &i in group {
                let list = &lists[i];
                match list.get(1) {
                    None => {
                        if keeper_is_forced {
                            // Two samples with a single option apiece collide.
                            return f64::INFINITY;
                        }
                        keeper_is_forced = true;
                        score += list[0].dist_sq;
                    }
                    Some(second) => {
                        score += second.dist_sq;
                        let gap = second.dist_sq - list[0].dist_sq;
                        if gap > max_gap {
                            max_gap = gap;
                        }
                    }
                }
            }
            if !keeper_is_forced {
                score -= max_gap;
            }
        }
    }

    score
}
