// Binned SAH split search, partitioning, and the fallback splits used for degenerate ranges.

use crate::builders::prim_ref::{PrimInfo, PrimRef};
use crate::builders::settings::MAX_BINS;
use crate::utilities::BoundingBox;
use glam::Vec3A;
use rayon::prelude::*;

/// Ranges at least this large are binned with a parallel reduction.
pub const PARALLEL_BINNING_THRESHOLD: usize = 16 * 1024;
const PARALLEL_BINNING_BLOCK_SIZE: usize = 4096;

// ── Bin mapping ────────────────────────────────────────────────────────────

/// Maps doubled primitive centers to bin indices on all three axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinMapping {
    num: usize,
    ofs: Vec3A,
    scale: Vec3A,
}

impl BinMapping {
    /// Builds a mapping over the range's centroid bounds. Small ranges get fewer bins.
    pub fn new(pinfo: &PrimInfo, bin_count: usize) -> Self {
        let num = bin_count
            .min((4.0 + 0.05 * pinfo.size() as f32) as usize)
            .clamp(1, MAX_BINS);
        let diag = pinfo.cent_bounds.size();
        // The 0.99 keeps the maximum center inside the last bin.
        let scale = Vec3A::select(
            diag.cmpgt(Vec3A::splat(1e-34)),
            Vec3A::splat(0.99 * num as f32) / diag,
            Vec3A::ZERO,
        );
        Self {
            num,
            ofs: pinfo.cent_bounds.min,
            scale,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.num
    }

    /// An axis with no centroid extent cannot be split by binning.
    #[inline]
    pub fn is_degenerate(&self, axis: usize) -> bool {
        self.scale[axis] == 0.0
    }

    /// Bin index of a doubled center on each axis.
    #[inline]
    pub fn bin(&self, center2: Vec3A) -> [usize; 3] {
        let continuous = ((center2 - self.ofs) * self.scale)
            .floor()
            .clamp(Vec3A::ZERO, Vec3A::splat((self.num - 1) as f32));
        [
            continuous.x as usize,
            continuous.y as usize,
            continuous.z as usize,
        ]
    }

    /// Bin index of a doubled center on one axis. Matches [`BinMapping::bin`] exactly.
    #[inline]
    pub fn bin_axis(&self, center2: Vec3A, axis: usize) -> usize {
        self.bin(center2)[axis]
    }
}

// ── Split ──────────────────────────────────────────────────────────────────

/// Best binned split found for a range.
///
/// `sah` is the unnormalized child cost `leftArea·blocks(leftCount) + rightArea·blocks(rightCount)`;
/// dividing by the parent area gives the per-primitive term of the usual SAH formula.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Split {
    pub sah: f32,
    pub axis: usize,
    pub pos: usize,
    pub mapping: BinMapping,
}

impl Split {
    #[inline]
    pub fn invalid(mapping: BinMapping) -> Self {
        Self {
            sah: f32::INFINITY,
            axis: 0,
            pos: 0,
            mapping,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.sah.is_finite()
    }

    /// Whether a primitive falls on the left side of this split.
    #[inline]
    pub fn goes_left(&self, prim: &PrimRef) -> bool {
        self.mapping.bin_axis(prim.center2(), self.axis) < self.pos
    }
}

// ── Bin info ───────────────────────────────────────────────────────────────

/// Per-axis bin bounds and counts for one range.
#[derive(Clone)]
pub struct BinInfo {
    bounds: [[BoundingBox; MAX_BINS]; 3],
    counts: [[usize; MAX_BINS]; 3],
}

impl Default for BinInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl BinInfo {
    pub fn new() -> Self {
        Self {
            bounds: [[BoundingBox::EMPTY; MAX_BINS]; 3],
            counts: [[0; MAX_BINS]; 3],
        }
    }

    /// Accumulates every primitive into its bin on each axis.
    pub fn bin(&mut self, prims: &[PrimRef], mapping: &BinMapping) {
        for prim in prims {
            let bounds = prim.bounds();
            let indices = mapping.bin(prim.center2());
            for axis in 0..3 {
                let bin = indices[axis];
                self.bounds[axis][bin].extend(&bounds);
                self.counts[axis][bin] += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &BinInfo, num: usize) {
        for axis in 0..3 {
            for bin in 0..num {
                self.bounds[axis][bin].extend(&other.bounds[axis][bin]);
                self.counts[axis][bin] += other.counts[axis][bin];
            }
        }
    }

    #[inline]
    pub fn count(&self, axis: usize, bin: usize) -> usize {
        self.counts[axis][bin]
    }

    #[inline]
    pub fn bounds(&self, axis: usize, bin: usize) -> &BoundingBox {
        &self.bounds[axis][bin]
    }

    /// Evaluates every bin boundary on every non-degenerate axis.
    ///
    /// Only splits with primitives on both sides are candidates. Ties keep the first axis in x, y, z order,
    /// then the lowest boundary.
    pub fn best(&self, mapping: &BinMapping, log_block_size: usize) -> Split {
        let num = mapping.size();
        let blocks = |count: usize| ((count + (1 << log_block_size) - 1) >> log_block_size) as f32;
        let mut best = Split::invalid(*mapping);
        if num < 2 {
            return best;
        }

        let mut right_areas = [0.0f32; MAX_BINS];
        let mut right_counts = [0usize; MAX_BINS];
        for axis in 0..3 {
            if mapping.is_degenerate(axis) {
                continue;
            }

            // Suffix sweep from right to left.
            let mut accumulated_bounds = BoundingBox::EMPTY;
            let mut accumulated_count = 0;
            for bin in (1..num).rev() {
                accumulated_bounds.extend(&self.bounds[axis][bin]);
                accumulated_count += self.counts[axis][bin];
                right_areas[bin] = accumulated_bounds.half_area();
                right_counts[bin] = accumulated_count;
            }

            // Prefix sweep from left to right; boundary `pos` puts bins [0, pos) on the left.
            let mut left_bounds = BoundingBox::EMPTY;
            let mut left_count = 0;
            for pos in 1..num {
                left_bounds.extend(&self.bounds[axis][pos - 1]);
                left_count += self.counts[axis][pos - 1];
                let right_count = right_counts[pos];
                if left_count == 0 || right_count == 0 {
                    continue;
                }
                let sah = left_bounds.half_area() * blocks(left_count)
                    + right_areas[pos] * blocks(right_count);
                if sah < best.sah {
                    best.sah = sah;
                    best.axis = axis;
                    best.pos = pos;
                }
            }
        }
        best
    }
}

// ── Heuristic ──────────────────────────────────────────────────────────────

/// Finds and applies splits for the binned SAH builder.
#[derive(Clone, Copy, Debug)]
pub struct HeuristicBinning {
    pub bin_count: usize,
    pub log_block_size: usize,
}

impl HeuristicBinning {
    pub fn new(bin_count: usize, log_block_size: usize) -> Self {
        Self {
            bin_count,
            log_block_size,
        }
    }

    /// Finds the lowest-cost binned split of `prims`, which `pinfo` summarizes.
    /// Returns an invalid split when no axis has a boundary with primitives on both sides.
    pub fn find(&self, prims: &[PrimRef], pinfo: &PrimInfo, parallel: bool) -> Split {
        let mapping = BinMapping::new(pinfo, self.bin_count);
        if pinfo.has_degenerate_centroids() {
            return Split::invalid(mapping);
        }
        let binner = if parallel && prims.len() >= PARALLEL_BINNING_THRESHOLD {
            prims
                .par_chunks(PARALLEL_BINNING_BLOCK_SIZE)
                .map(|chunk| {
                    let mut local = BinInfo::new();
                    local.bin(chunk, &mapping);
                    local
                })
                .reduce(BinInfo::new, |mut a, b| {
                    a.merge(&b, mapping.size());
                    a
                })
        } else {
            let mut binner = BinInfo::new();
            binner.bin(prims, &mapping);
            binner
        };
        binner.best(&mapping, self.log_block_size)
    }

    /// Partitions `prims` in place.
    ///
    /// Tries the binned split, then a spatial median on the widest centroid axis, then an object median.
    /// The returned position is the start of the right half; both halves are always non-empty for two or more
    /// primitives.
    pub fn split(&self, prims: &mut [PrimRef], pinfo: &PrimInfo, split: &Split) -> SplitResult {
        debug_assert!(prims.len() >= 2, "Cannot split fewer than two primitives.");
        if split.is_valid() {
            let result = partition(prims, |prim| split.goes_left(prim));
            if result.is_proper() {
                return result;
            }
            tracing::trace!(
                count = prims.len(),
                "binned split left one side empty; falling back"
            );
        }
        if !pinfo.has_degenerate_centroids() {
            if let Some(result) = split_spatial_median(prims, pinfo) {
                return result;
            }
        }
        tracing::trace!(count = prims.len(), "object median fallback");
        split_object_median(prims)
    }
}

/// Outcome of splitting a range in place.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitResult {
    /// Offset of the first right-side primitive, relative to the split slice.
    pub mid: usize,
    pub left: PrimInfo,
    pub right: PrimInfo,
}

impl SplitResult {
    #[inline]
    pub fn is_proper(&self) -> bool {
        self.left.size() > 0 && self.right.size() > 0
    }
}

/// Unstable in-place partition. Primitives satisfying `goes_left` end up in front.
pub fn partition<F>(prims: &mut [PrimRef], goes_left: F) -> SplitResult
where
    F: Fn(&PrimRef) -> bool,
{
    let mut left = PrimInfo::EMPTY;
    let mut right = PrimInfo::EMPTY;
    let mut begin = 0;
    let mut end = prims.len();
    while begin < end {
        if goes_left(&prims[begin]) {
            left.add(&prims[begin]);
            begin += 1;
        } else {
            end -= 1;
            prims.swap(begin, end);
            right.add(&prims[end]);
        }
    }
    SplitResult {
        mid: begin,
        left,
        right,
    }
}

/// Splits at the middle of the centroid bounds on the widest centroid axis.
/// Returns `None` when one side would be empty.
pub fn split_spatial_median(prims: &mut [PrimRef], pinfo: &PrimInfo) -> Option<SplitResult> {
    let axis = pinfo.cent_bounds.widest_axis();
    let center = pinfo.cent_bounds.center()[axis];
    let result = partition(prims, |prim| prim.center2()[axis] < center);
    result.is_proper().then_some(result)
}

/// Splits the range in half by position, ignoring geometry.
pub fn split_object_median(prims: &mut [PrimRef]) -> SplitResult {
    let mid = prims.len() / 2;
    SplitResult {
        mid,
        left: PrimInfo::from_prims_serial(&prims[..mid]),
        right: PrimInfo::from_prims_serial(&prims[mid..]),
    }
}
