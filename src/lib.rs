#![forbid(unsafe_code)]

//! Quantization of perceptually uniform color gradients onto a fixed palette.
//!
//! The input is an ordered sequence of points in a perceptual color space; the
//! output assigns each point a distinct candidate code from a finite universe
//! of display colors, minimizing total squared perceptual error while
//! preserving the direction of every lightness change. A best-first
//! branch-and-bound search does the assignment; an optional second pass
//! certifies that the result is globally optimal.

pub mod error;
pub mod heuristic;
pub mod index;
pub mod search;
pub mod universe;

pub use error::QuantizeError;
pub use index::{CandidateList, Neighbor, SpatialIndex};
pub use universe::{UniformPoint, Universe};

use log::{debug, warn};

use search::{Search, SearchOutcome};

/// Relative slack on the pass-2 bound, guarding against floating-point
/// regressions when re-deriving the pass-1 optimum.
const PROOF_BOUND_SLACK: f64 = 1e-12;

/// Configuration for gradient quantization.
#[derive(Debug, Clone)]
pub struct QuantizeOptions {
    /// Candidates fetched per sample for the first pass.
    pub first_pass_candidates: usize,
    /// Iteration budget per search run (one iteration = one queue pop).
    pub max_iterations: usize,
    /// Whether to run the second pass that certifies global optimality.
    pub prove_optimality: bool,
    /// Largest per-sample candidate list the proof pass will accept; above
    /// this the proof is abandoned and the first-pass result returned.
    pub radius_candidate_ceiling: usize,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            first_pass_candidates: 16,
            max_iterations: 100_000,
            prove_optimality: false,
            radius_candidate_ceiling: 1000,
        }
    }
}

impl QuantizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_pass_candidates(mut self, n: usize) -> Self {
        self.first_pass_candidates = n;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn prove_optimality(mut self, prove: bool) -> Self {
        self.prove_optimality = prove;
        self
    }

    pub fn radius_candidate_ceiling(mut self, n: usize) -> Self {
        self.radius_candidate_ceiling = n;
        self
    }
}

/// Quantization result.
#[derive(Debug, Clone)]
pub struct Quantized {
    codes: Vec<u32>,
    score: f64,
    degraded: bool,
}

impl Quantized {
    /// Assigned candidate code per sample, in sample order.
    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    /// Total squared perceptual distance of the assignment. Always finite.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// True when the search failed and the per-sample nearest candidates were
    /// returned instead, ignoring distinctness and monotonicity.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Consumes the result, yielding the code vector without a copy.
    pub fn into_codes(self) -> Vec<u32> {
        self.codes
    }
}

/// Quantize a gradient onto the indexed candidate universe.
///
/// Pass 1 searches over a small fixed number of nearest candidates per sample
/// with no bound. If it fails, the naive nearest-candidate assignment is
/// returned with `degraded` set. With `prove_optimality`, pass 1's score
/// yields a per-sample radius within which any better assignment would have
/// to live; searching those radius lists either certifies the result or finds
/// the true optimum.
pub fn quantize(
    samples: &[UniformPoint],
    index: &SpatialIndex,
    options: &QuantizeOptions,
) -> Result<Quantized, QuantizeError> {
    validate_inputs(samples, index, options)?;

    // 1. First pass over fixed-size candidate lists
    let k = options.first_pass_candidates.min(index.len());
    let first_lists = index.k_nearest(samples, k);

    let pass1 = Search::new(samples, &first_lists, f64::INFINITY, options.max_iterations).run();
    let (first_choices, first_score) = match pass1 {
        SearchOutcome::Solved { choices, score } => (choices, score),
        outcome => {
            let reason = match outcome {
                SearchOutcome::IterationCapped => "iteration budget exhausted",
                _ => "search space exhausted",
            };
            warn!("no valid assignment found ({reason}); returning nearest-candidate fallback");
            return Ok(naive_fallback(&first_lists));
        }
    };

    let first = Quantized {
        codes: pick_codes(&first_lists, &first_choices),
        score: first_score,
        degraded: false,
    };

    if !options.prove_optimality {
        return Ok(first);
    }

    // 2. Per-sample radius bounds from the pass-1 score. If every sample but
    // one takes its nearest candidate, the remaining sample cannot usefully
    // sit farther than what's left of the score; everything is in squared
    // distance, so the radii feed the index directly.
    let nearest_sq: Vec<f64> = first_lists.iter().map(|list| list[0].dist_sq).collect();
    let total_nearest: f64 = nearest_sq.iter().sum();
    let radii_sq: Vec<f64> = nearest_sq
        .iter()
        .map(|&d| (first_score - (total_nearest - d)).max(d))
        .collect();

    let mut second_lists = index.within_radius(samples, &radii_sq);
    for list in &mut second_lists {
        index::sort_candidates(list);
    }

    let widest = second_lists.iter().map(Vec::len).max().unwrap_or(0);
    if widest <= k {
        debug!("first pass already optimal: widest radius list has {widest} candidates (k = {k})");
        return Ok(first);
    }
    if widest > options.radius_candidate_ceiling {
        warn!(
            "radius query returned up to {widest} candidates per sample (ceiling {}); \
             not attempting to prove optimality",
            options.radius_candidate_ceiling
        );
        return Ok(first);
    }

    // 3. Proof pass, bounded by the pass-1 score plus floating-point slack
    let proof_bound = first_score * (1.0 + PROOF_BOUND_SLACK);
    let pass2 = Search::new(samples, &second_lists, proof_bound, options.max_iterations).run();

    match pass2 {
        SearchOutcome::Solved { choices, score } => {
            if score > first_score {
                warn!(
                    "second pass score {score} exceeds first pass score {first_score}; \
                     distance arithmetic has lost precision"
                );
            }
            Ok(Quantized {
                codes: pick_codes(&second_lists, &choices),
                score,
                degraded: false,
            })
        }
        SearchOutcome::IterationCapped => {
            warn!("optimality proof hit the iteration budget; keeping the first-pass result");
            Ok(first)
        }
        SearchOutcome::Exhausted => {
            warn!("optimality proof exhausted its search space; keeping the first-pass result");
            Ok(first)
        }
    }
}

/// Nearest candidate per sample, ignoring distinctness and monotonicity.
/// Only reached when the constrained search fails outright.
fn naive_fallback(lists: &[CandidateList]) -> Quantized {
    Quantized {
        codes: lists.iter().map(|list| list[0].code).collect(),
        score: lists.iter().map(|list| list[0].dist_sq).sum(),
        degraded: true,
    }
}

fn pick_codes(lists: &[CandidateList], choices: &[usize]) -> Vec<u32> {
    lists
        .iter()
        .zip(choices)
        .map(|(list, &pick)| list[pick].code)
        .collect()
}

fn validate_inputs(
    samples: &[UniformPoint],
    index: &SpatialIndex,
    options: &QuantizeOptions,
) -> Result<(), QuantizeError> {
    if samples.is_empty() {
        return Err(QuantizeError::EmptySamples);
    }
    if index.is_empty() {
        return Err(QuantizeError::EmptyUniverse);
    }
    if options.first_pass_candidates == 0 {
        return Err(QuantizeError::ZeroCandidates);
    }
    if options.max_iterations == 0 {
        return Err(QuantizeError::ZeroIterations);
    }
    Ok(())
}
