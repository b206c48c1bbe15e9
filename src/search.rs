//! Best-first branch-and-bound over partial assignments.
//!
//! States are partial assignments (a prefix of candidate-list indices) ordered
//! by their heuristic total; the first terminal state popped is optimal for
//! the candidate lists searched. Two constraints shape the branching: assigned
//! candidate codes must stay pairwise distinct, and wherever the samples'
//! lightness moves with a definite sign, the assigned candidates' lightness
//! must move the same way.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::heuristic::lower_bound;
use crate::index::CandidateList;
use crate::universe::UniformPoint;

/// Sample lightness deltas smaller than this have no defined sign.
const LIGHTNESS_EPS: f64 = 1e-10;

/// Relative slack when comparing boundary lightness values, so that
/// differences attributable to color-space conversion rounding never prune.
const BOUNDARY_REL_EPS: f64 = 1e-10;

/// Direction of the lightness change across a junction between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LightnessSign {
    Down,
    Flat,
    Up,
}

impl LightnessSign {
    fn of(delta: f64) -> Self {
        if delta.abs() < LIGHTNESS_EPS {
            Self::Flat
        } else if delta > 0.0 {
            Self::Up
        } else {
            Self::Down
        }
    }

    fn factor(self) -> f64 {
        match self {
            Self::Up => 1.0,
            Self::Down => -1.0,
            Self::Flat => 0.0,
        }
    }
}

/// The boundary lightness recorded for an equivalence key at a sign-constrained
/// junction, wrapped so the two directional comparisons have names instead of
/// ad hoc float inequalities.
///
/// Two partial assignments with the same equivalence key complete identically
/// except that the last assigned candidate's lightness gates which candidates
/// the next step may use. The assignment whose boundary is more permissive
/// (lower for an upward junction, higher for a downward one) can reach strictly
/// more completions, so the less permissive one is pruned.
#[derive(Debug, Clone, Copy)]
struct BoundaryLightness {
    sign: LightnessSign,
    value: f64,
}

impl BoundaryLightness {
    /// Whether a state arriving at this key with `current` as its boundary is
    /// redundant: every completion it allows was already reachable from the
    /// stored boundary. Comparison carries relative slack so near-tied
    /// boundaries are never pruned on numerical noise.
    fn prunes(&self, current: f64) -> bool {
        self.sign.factor() * (current - self.value) > BOUNDARY_REL_EPS * self.value
    }

    /// Whether the stored boundary already admitted a candidate with this
    /// lightness. A surviving state with a more permissive boundary only needs
    /// to expand the candidates the stored boundary rejected.
    fn admitted(&self, lightness: f64) -> bool {
        self.sign.factor() * (lightness - self.value) > 0.0
    }
}

/// A partial assignment queued for expansion.
///
/// The heap pops the lowest heuristic score first; among equal scores, the
/// lexicographically smallest index sequence. Since candidate lists are sorted
/// nearest-first, that tie rule means "lowest candidate-list index first" and
/// makes the search outcome independent of heap internals.
#[derive(Debug, PartialEq)]
struct State {
    score: f64,
    choices: Vec<usize>,
}

impl Eq for State {}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on both fields: BinaryHeap is a max-heap and we want the
        // smallest (score, choices) on top.
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.choices.cmp(&self.choices))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Optimal assignment for the searched candidate lists, within the bound.
    Solved { choices: Vec<usize>, score: f64 },
    /// The queue emptied: no assignment satisfies the constraints and bound.
    Exhausted,
    /// The iteration budget ran out before a terminal state was popped.
    IterationCapped,
}

/// One search run over fixed candidate lists. Owns its priority queue and
/// equivalence table exclusively for the duration of [`Search::run`]; nothing
/// is shared or retained between runs.
pub struct Search<'a> {
    samples: &'a [UniformPoint],
    lists: &'a [CandidateList],
    bound: f64,
    max_iterations: usize,
}

impl<'a> Search<'a> {
    pub fn new(
        samples: &'a [UniformPoint],
        lists: &'a [CandidateList],
        bound: f64,
        max_iterations: usize,
    ) -> Self {
        debug_assert_eq!(samples.len(), lists.len());
        Self {
            samples,
            lists,
            bound,
            max_iterations,
        }
    }

    pub fn run(&self) -> SearchOutcome {
        let n = self.samples.len();

        let initial = lower_bound(self.lists, &[]);
        if initial > self.bound {
            // No completion can satisfy the bound.
            return SearchOutcome::Exhausted;
        }

        // Equivalence table: (depth, remaining unused reachable codes) mapped
        // to the boundary lightness of the best state seen with that key. The
        // value is meaningless for keys first reached through a flat junction.
        let mut boundaries: HashMap<(usize, Vec<u32>), f64> = HashMap::new();

        let mut heap = BinaryHeap::new();
        heap.push(State {
            score: initial,
            choices: Vec::new(),
        });

        let mut iterations = 0usize;
        while let Some(state) = heap.pop() {
            iterations += 1;
            if iterations >= self.max_iterations {
                return SearchOutcome::IterationCapped;
            }

            let depth = state.choices.len();
            if depth == n {
                return SearchOutcome::Solved {
                    score: state.score,
                    choices: state.choices,
                };
            }

            let assigned: Vec<u32> = self
                .lists
                .iter()
                .zip(&state.choices)
                .map(|(list, &pick)| list[pick].code)
                .collect();

            let (sign, current_l) = if depth > 0 {
                let delta = self.samples[depth].l - self.samples[depth - 1].l;
                let last = self.lists[depth - 1][state.choices[depth - 1]].lightness;
                (LightnessSign::of(delta), last)
            } else {
                (LightnessSign::Flat, 0.0)
            };

            // Equivalence key: which samples remain, and which codes they can
            // still draw from.
            let mut remaining: BTreeSet<u32> = self.lists[depth..]
                .iter()
                .flat_map(|list| list.iter().map(|c| c.code))
                .collect();
            for code in &assigned {
                remaining.remove(code);
            }
            let key = (depth, remaining.into_iter().collect::<Vec<u32>>());

            // For a sign-constrained junction the key dedup must account for
            // the boundary lightness; a flat junction leaves completions
            // unconstrained, so plain key equality decides.
            let mut stored_boundary: Option<BoundaryLightness> = None;
            if sign != LightnessSign::Flat {
                if let Some(&value) = boundaries.get(&key) {
                    let stored = BoundaryLightness { sign, value };
                    if stored.prunes(current_l) {
                        continue;
                    }
                    stored_boundary = Some(stored);
                }
                boundaries.insert(key, current_l);
            } else {
                if boundaries.contains_key(&key) {
                    continue;
                }
                boundaries.insert(key, 0.0);
            }

            for (i, cand) in self.lists[depth].iter().enumerate() {
                if assigned.contains(&cand.code) {
                    continue;
                }
                if sign != LightnessSign::Flat {
                    // Candidate lightness must move in the samples' direction
                    // relative to the previously assigned candidate.
                    if sign.factor() * (cand.lightness - current_l) <= 0.0 {
                        continue;
                    }
                    // The state that recorded the stored boundary already
                    // expanded every candidate that boundary admitted; only
                    // the newly admitted window is fresh work.
                    if let Some(stored) = stored_boundary {
                        if stored.admitted(cand.lightness) {
                            continue;
                        }
                    }
                }

                let mut next = state.choices.clone();
                next.push(i);
                let score = lower_bound(self.lists, &next);
                if score > self.bound {
                    continue;
                }
                heap.push(State {
                    score,
                    choices: next,
                });
            }
        }

        SearchOutcome::Exhausted
    }
}
