use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use bincode::Options as _;
use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::universe::{UniformPoint, Universe};

/// Bumped whenever the snapshot layout changes; older snapshots read as absent.
const FORMAT_VERSION: u32 = 2;

/// One candidate as seen from a particular sample: its addressable code, its
/// lightness (needed by the monotonicity constraint), and its squared distance
/// to that sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub code: u32,
    pub lightness: f64,
    pub dist_sq: f64,
}

/// Candidates for one sample, nearest first (index 0 = nearest).
pub type CandidateList = Vec<Neighbor>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IndexEntry {
    code: u32,
    point: UniformPoint,
}

/// k-d tree over the candidate universe.
///
/// Built once per universe (or loaded from a cached snapshot) and shared
/// read-only across any number of quantization calls; all queries take
/// `&self`. Distances are squared Euclidean throughout.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpatialIndex {
    tree: ImmutableKdTree<f64, 3>,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    key: String,
    index: SpatialIndex,
}

impl SpatialIndex {
    /// Build the index over a validated universe. Cannot fail: malformed
    /// universes are rejected by [`Universe::new`], and the immutable tree
    /// accepts universes where arbitrarily many candidates share a coordinate
    /// on an axis (a grayscale palette has every candidate at zero chroma).
    pub fn build(universe: &Universe) -> Self {
        let mut coords = Vec::with_capacity(universe.len());
        let mut entries = Vec::with_capacity(universe.len());

        for &(code, point) in universe.entries() {
            coords.push(point.coords());
            entries.push(IndexEntry { code, point });
        }

        Self {
            // Query results carry the slice position, which is the entry index
            tree: ImmutableKdTree::new_from_slice(&coords),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Coordinate of the candidate with the given code, if it exists.
    pub fn coordinate(&self, code: u32) -> Option<UniformPoint> {
        self.entries
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.point)
    }

    /// The `k` nearest candidates for each point, nearest first.
    ///
    /// Exact distance ties are ordered by candidate code so list order (and
    /// everything downstream that depends on it) is deterministic. Always
    /// returns a list per point, even for `k = 1`.
    pub fn k_nearest(&self, points: &[UniformPoint], k: usize) -> Vec<CandidateList> {
        let k = k.min(self.entries.len());
        points
            .iter()
            .map(|p| {
                let mut list: CandidateList = self
                    .tree
                    .nearest_n::<SquaredEuclidean>(&p.coords(), k)
                    .into_iter()
                    .map(|n| self.neighbor(n.item as usize, n.distance))
                    .collect();
                sort_candidates(&mut list);
                list
            })
            .collect()
    }

    /// All candidates within a per-point squared radius. Lists are NOT
    /// distance-sorted; the caller sorts before handing them to the search.
    pub fn within_radius(&self, points: &[UniformPoint], radii_sq: &[f64]) -> Vec<CandidateList> {
        points
            .iter()
            .zip(radii_sq)
            .map(|(p, &r_sq)| {
                self.tree
                    .within_unsorted::<SquaredEuclidean>(&p.coords(), r_sq)
                    .into_iter()
                    .map(|n| self.neighbor(n.item as usize, n.distance))
                    .collect()
            })
            .collect()
    }

    /// Try to load a previously stored snapshot for `key`.
    ///
    /// Any I/O or decode failure, a stale format version, or a key mismatch
    /// all read as "absent"; the caller rebuilds and nothing propagates.
    pub fn load_cached(cache_dir: &Path, key: &str) -> Option<Self> {
        let path = cache_path(cache_dir, key);
        let file = File::open(&path).ok()?;
        let limit = file.metadata().ok()?.len();

        // The byte limit turns a garbage length prefix into a decode error
        // rather than an attempt to allocate whatever the prefix claims.
        let snapshot: Snapshot = match bincode::options()
            .with_limit(limit)
            .deserialize_from(BufReader::new(file))
        {
            Ok(s) => s,
            Err(err) => {
                debug!("unreadable index snapshot at {}: {err}", path.display());
                return None;
            }
        };

        if snapshot.format != FORMAT_VERSION || snapshot.key != key {
            debug!("stale index snapshot at {}", path.display());
            return None;
        }

        Some(snapshot.index)
    }

    /// Best-effort persistence of the index for `key`. Failures are logged,
    /// never returned.
    pub fn store_cached(&self, cache_dir: &Path, key: &str) {
        let path = cache_path(cache_dir, key);
        if let Err(err) = self.try_store(cache_dir, key, &path) {
            warn!(
                "failed to store spatial index snapshot at {}: {err}",
                path.display()
            );
        }
    }

    fn try_store(
        &self,
        cache_dir: &Path,
        key: &str,
        path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        fs::create_dir_all(cache_dir)?;

        // Write to a sibling temp file and rename, so a crash mid-write never
        // leaves a truncated snapshot behind.
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let snapshot = SnapshotRef {
                format: FORMAT_VERSION,
                key,
                index: self,
            };
            bincode::options().serialize_into(BufWriter::new(file), &snapshot)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn neighbor(&self, entry_idx: usize, dist_sq: f64) -> Neighbor {
        let entry = self.entries[entry_idx];
        Neighbor {
            code: entry.code,
            lightness: entry.point.l,
            dist_sq,
        }
    }
}

/// Borrowing twin of `Snapshot` so storing never clones the tree.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: u32,
    key: &'a str,
    index: &'a SpatialIndex,
}

/// Nearest first; exact ties broken by code.
pub(crate) fn sort_candidates(list: &mut CandidateList) {
    list.sort_by(|x, y| x.dist_sq.total_cmp(&y.dist_sq).then(x.code.cmp(&y.code)));
}

fn cache_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{key}_kdtree_v{FORMAT_VERSION}.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lightness_universe(positions: &[f64]) -> Universe {
        let entries = positions
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, UniformPoint::new(l, 0.0, 0.0)))
            .collect();
        Universe::new(entries).unwrap()
    }

    #[test]
    fn k_nearest_sorted_ascending() {
        let index = SpatialIndex::build(&lightness_universe(&[0.0, 0.25, 0.5, 0.75, 1.0]));
        let lists = index.k_nearest(&[UniformPoint::new(0.3, 0.0, 0.0)], 3);

        assert_eq!(lists.len(), 1);
        let list = &lists[0];
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].code, 1); // 0.25 is nearest to 0.3
        assert!(list[0].dist_sq <= list[1].dist_sq);
        assert!(list[1].dist_sq <= list[2].dist_sq);
    }

    #[test]
    fn k_one_still_returns_lists() {
        let index = SpatialIndex::build(&lightness_universe(&[0.1, 0.9]));
        let points = [
            UniformPoint::new(0.0, 0.0, 0.0),
            UniformPoint::new(1.0, 0.0, 0.0),
        ];
        let lists = index.k_nearest(&points, 1);
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].len(), 1);
        assert_eq!(lists[1].len(), 1);
        assert_eq!(lists[0][0].code, 0);
        assert_eq!(lists[1][0].code, 1);
    }

    #[test]
    fn k_clamped_to_universe_size() {
        let index = SpatialIndex::build(&lightness_universe(&[0.2, 0.8]));
        let lists = index.k_nearest(&[UniformPoint::new(0.5, 0.0, 0.0)], 10);
        assert_eq!(lists[0].len(), 2);
    }

    #[test]
    fn within_radius_respects_per_point_radii() {
        let index = SpatialIndex::build(&lightness_universe(&[0.0, 0.1, 0.5, 1.0]));
        let points = [
            UniformPoint::new(0.05, 0.0, 0.0),
            UniformPoint::new(0.95, 0.0, 0.0),
        ];
        // 0.2 squared covers {0.0, 0.1} for the first point, {1.0} for the second
        let lists = index.within_radius(&points, &[0.04, 0.04]);

        let mut codes0: Vec<u32> = lists[0].iter().map(|n| n.code).collect();
        codes0.sort_unstable();
        assert_eq!(codes0, vec![0, 1]);

        let codes1: Vec<u32> = lists[1].iter().map(|n| n.code).collect();
        assert_eq!(codes1, vec![3]);
    }

    #[test]
    fn axis_degenerate_universe_builds() {
        // Every candidate shares a=0 and b=0; well past any per-axis bucket
        let positions: Vec<f64> = (0..64).map(|i| i as f64 / 63.0).collect();
        let index = SpatialIndex::build(&lightness_universe(&positions));
        assert_eq!(index.len(), 64);

        let lists = index.k_nearest(&[UniformPoint::new(0.5, 0.0, 0.0)], 3);
        assert_eq!(lists[0].len(), 3);
        assert!(lists[0][0].dist_sq <= lists[0][1].dist_sq);
    }

    #[test]
    fn coordinate_lookup() {
        let index = SpatialIndex::build(&lightness_universe(&[0.2, 0.8]));
        assert_eq!(index.coordinate(1).unwrap().l, 0.8);
        assert!(index.coordinate(99).is_none());
    }

    #[test]
    fn cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let index = SpatialIndex::build(&lightness_universe(&[0.0, 0.5, 1.0]));

        index.store_cached(dir.path(), "test_universe");
        let loaded = SpatialIndex::load_cached(dir.path(), "test_universe")
            .expect("snapshot should load back");

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.coordinate(1).unwrap().l, 0.5);

        // Queries against the loaded tree behave like the original
        let lists = loaded.k_nearest(&[UniformPoint::new(0.4, 0.0, 0.0)], 2);
        assert_eq!(lists[0][0].code, 1);
    }

    #[test]
    fn cache_key_mismatch_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let index = SpatialIndex::build(&lightness_universe(&[0.0, 1.0]));
        index.store_cached(dir.path(), "universe_a");

        assert!(SpatialIndex::load_cached(dir.path(), "universe_b").is_none());
    }

    #[test]
    fn corrupt_cache_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "broken");
        fs::write(&path, b"not a snapshot").unwrap();

        assert!(SpatialIndex::load_cached(dir.path(), "broken").is_none());
    }

    #[test]
    fn truncated_cache_is_absent() {
        // Cutting a valid snapshot leaves plausible length prefixes pointing
        // past the end of the file; that must decode as absent, not abort
        let dir = tempfile::tempdir().unwrap();
        let index = SpatialIndex::build(&lightness_universe(&[0.0, 0.5, 1.0]));
        index.store_cached(dir.path(), "cut");

        let path = cache_path(dir.path(), "cut");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(SpatialIndex::load_cached(dir.path(), "cut").is_none());
    }

    #[test]
    fn missing_cache_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SpatialIndex::load_cached(dir.path(), "nothing_here").is_none());
    }

    #[test]
    fn index_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SpatialIndex>();
    }
}
