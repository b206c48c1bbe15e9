use serde::{Deserialize, Serialize};

use crate::error::QuantizeError;

/// A point in a perceptually uniform color space.
///
/// `l` is lightness; `a` and `b` are the two chromaticity axes. Euclidean
/// distance between points approximates perceived color difference, which is
/// the property the whole quantization search relies on. Which concrete space
/// the coordinates come from (CAM16-UCS, OKLab, ...) is the caller's business;
/// this crate only ever measures squared distances and compares lightness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformPoint {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl UniformPoint {
    pub const fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }

    /// Squared Euclidean distance to another point.
    pub fn distance_sq(self, other: Self) -> f64 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        dl * dl + da * da + db * db
    }

    pub(crate) fn coords(self) -> [f64; 3] {
        [self.l, self.a, self.b]
    }
}

/// The fixed set of discrete display colors a gradient can be quantized to.
///
/// Each candidate pairs an addressable integer code (the value written to the
/// output format) with its coordinate in the perceptual space. The universe is
/// immutable once constructed and is the same for every sample of every
/// gradient quantized against it.
#[derive(Debug, Clone)]
pub struct Universe {
    entries: Vec<(u32, UniformPoint)>,
}

impl Universe {
    /// Validate and take ownership of the candidate set.
    ///
    /// Rejects an empty set and duplicate codes; everything downstream
    /// (index construction, search) assumes both.
    pub fn new(entries: Vec<(u32, UniformPoint)>) -> Result<Self, QuantizeError> {
        if entries.is_empty() {
            return Err(QuantizeError::EmptyUniverse);
        }

        let mut seen = std::collections::HashSet::with_capacity(entries.len());
        for &(code, _) in &entries {
            if !seen.insert(code) {
                return Err(QuantizeError::DuplicateCode(code));
            }
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(u32, UniformPoint)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
