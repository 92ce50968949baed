// Generic parallel binned SAH builder.
//
// The recursion is shared by every node encoding: a `NodeEncoding` allocates and finalizes inner nodes,
// a `CreateLeaf` turns terminal ranges into leaves. The builder itself only partitions the primitive array.

use crate::builders::heuristic_binning::{split_object_median, HeuristicBinning, Split};
use crate::builders::prim_ref::{PrimInfo, PrimRef};
use crate::builders::progress::ProgressMonitor;
use crate::builders::settings::{Settings, LARGE_LEAF_DEPTH_SLACK, MAX_BRANCHING_FACTOR};
use crate::error::{BuildError, Result};
use crate::utilities::memory::{Arena, ThreadAllocator, WorkerAllocators};
use rayon::prelude::*;
use smallvec::{smallvec, SmallVec};
use std::sync::atomic::{AtomicBool, Ordering};

/// Children gathered for one inner node.
pub type ChildRecords = SmallVec<[BuildRecord; MAX_BRANCHING_FACTOR]>;

/// A `[begin, end)` range of the primitive array with its summary and depth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildRecord {
    pub begin: usize,
    pub end: usize,
    pub depth: usize,
    pub pinfo: PrimInfo,
}

impl BuildRecord {
    #[inline]
    pub fn new(begin: usize, end: usize, depth: usize, pinfo: PrimInfo) -> Self {
        debug_assert_eq!(end - begin, pinfo.size());
        Self {
            begin,
            end,
            depth,
            pinfo,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn half_area(&self) -> f32 {
        self.pinfo.half_area()
    }
}

/// Node encoding used by the shared recursion.
///
/// `create_inner` runs before the children are built and may only depend on the child ranges.
/// `update_inner` runs after every child has returned and back-patches child references (and any bounds the
/// children report), producing the value handed to the parent.
pub trait NodeEncoding: Sync {
    /// Value produced for every subtree.
    type Output: Copy + Send;
    /// Handle to a node between `create_inner` and `update_inner`.
    type Pending;

    /// Maximum number of children this encoding can store.
    const BRANCHING_FACTOR: usize;

    fn create_inner(
        &self,
        children: &[BuildRecord],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Self::Pending>;

    fn update_inner(
        &self,
        node: Self::Pending,
        children: &[BuildRecord],
        outputs: &[Self::Output],
    ) -> Self::Output;
}

/// Converts a terminal range into a leaf.
///
/// `prims` is exactly the record's range of the primitive array and is never empty.
pub trait CreateLeaf<Output>: Sync {
    fn create_leaf(
        &self,
        record: &BuildRecord,
        prims: &[PrimRef],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Output>;
}

impl<F, Output> CreateLeaf<Output> for F
where
    F: Fn(&BuildRecord, &[PrimRef], &mut ThreadAllocator<'_>) -> Result<Output> + Sync,
{
    #[inline]
    fn create_leaf(
        &self,
        record: &BuildRecord,
        prims: &[PrimRef],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Output> {
        self(record, prims, alloc)
    }
}

/// Builds a hierarchy over `prims`, reordering the array in place.
///
/// `pinfo` must summarize all of `prims`, which must not be empty. Nodes and leaves are allocated from `arena`.
/// On error nothing is returned; whatever was allocated stays owned by the arena until it is cleared.
pub fn build_binned_sah<E, L, P>(
    arena: &Arena,
    encoding: &E,
    create_leaf: &L,
    progress: &P,
    prims: &mut [PrimRef],
    pinfo: &PrimInfo,
    settings: &Settings,
) -> Result<E::Output>
where
    E: NodeEncoding,
    L: CreateLeaf<E::Output>,
    P: ProgressMonitor,
{
    settings.validate()?;
    if settings.branching_factor > E::BRANCHING_FACTOR {
        return Err(BuildError::InvalidSettings(format!(
            "branching factor {} exceeds the node width {}",
            settings.branching_factor,
            E::BRANCHING_FACTOR
        )));
    }
    if prims.is_empty() || pinfo.size() != prims.len() {
        return Err(BuildError::InvalidSettings(format!(
            "primitive summary covers {} primitives but the array holds {}",
            pinfo.size(),
            prims.len()
        )));
    }

    let builder = BinnedSahBuilder {
        workers: WorkerAllocators::new(arena),
        encoding,
        create_leaf,
        progress,
        settings,
        heuristic: HeuristicBinning::new(settings.bin_count, settings.log_block_size),
        cancelled: AtomicBool::new(false),
    };
    let root = BuildRecord::new(0, prims.len(), 1, *pinfo);
    builder.recurse_parallel(root, prims)
}

struct BinnedSahBuilder<'a, E, L, P> {
    workers: WorkerAllocators<'a>,
    encoding: &'a E,
    create_leaf: &'a L,
    progress: &'a P,
    settings: &'a Settings,
    heuristic: HeuristicBinning,
    cancelled: AtomicBool,
}

impl<'a, E, L, P> BinnedSahBuilder<'a, E, L, P>
where
    E: NodeEncoding,
    L: CreateLeaf<E::Output>,
    P: ProgressMonitor,
{
    /// Cooperative cancellation point.
    fn check_cancelled(&self) -> Result<()> {
        let token_cancelled = self
            .settings
            .cancel
            .as_ref()
            .is_some_and(|token| token.is_cancelled());
        if token_cancelled || self.cancelled.load(Ordering::Relaxed) {
            self.cancelled.store(true, Ordering::Relaxed);
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    fn report_progress(&self, primitives: usize) -> Result<()> {
        if !self.progress.progress(primitives) {
            self.cancelled.store(true, Ordering::Relaxed);
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    /// Builds the subtree for `record` while the recursion is still fanning out in parallel.
    ///
    /// Children larger than the single-thread threshold are built as separate rayon tasks. Allocations go
    /// through the calling worker's allocator, which is only held for the duration of one allocation.
    fn recurse_parallel(&self, record: BuildRecord, prims: &mut [PrimRef]) -> Result<E::Output> {
        debug_assert_eq!(record.size(), prims.len());
        self.check_cancelled()?;
        let settings = self.settings;
        if record.size() <= settings.single_thread_threshold {
            self.report_progress(record.size())?;
            return self
                .workers
                .with_current(|alloc| self.recurse(record, prims, alloc));
        }

        if record.size() <= settings.min_leaf_size || record.depth >= settings.max_depth {
            return self
                .workers
                .with_current(|alloc| self.create_large_leaf(record, prims, alloc));
        }

        let split = self.heuristic.find(prims, &record.pinfo, true);
        if self.prefers_leaf(&record, &split) {
            return self
                .workers
                .with_current(|alloc| self.create_large_leaf(record, prims, alloc));
        }

        let mut children = self.split_into_children(record, prims, split)?;
        children.sort_unstable_by_key(|child| child.begin);

        let node = self
            .workers
            .with_current(|alloc| self.encoding.create_inner(&children, alloc))?;
        let jobs: Vec<(BuildRecord, &mut [PrimRef])> = children
            .iter()
            .copied()
            .zip(split_child_slices(prims, record.begin, &children))
            .collect();
        let outputs: SmallVec<[E::Output; MAX_BRANCHING_FACTOR]> = jobs
            .into_par_iter()
            .map(|(child, slice)| self.recurse_parallel(child, slice))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .collect();
        Ok(self.encoding.update_inner(node, &children, &outputs))
    }

    /// Builds the subtree for `record` on the current thread. `prims` is exactly the record's range.
    fn recurse(
        &self,
        record: BuildRecord,
        prims: &mut [PrimRef],
        alloc: &mut ThreadAllocator<'a>,
    ) -> Result<E::Output> {
        debug_assert_eq!(record.size(), prims.len());
        let settings = self.settings;
        if record.size() <= settings.min_leaf_size || record.depth >= settings.max_depth {
            return self.create_large_leaf(record, prims, alloc);
        }

        let split = self.heuristic.find(prims, &record.pinfo, false);
        if self.prefers_leaf(&record, &split) {
            return self.create_large_leaf(record, prims, alloc);
        }

        let mut children = self.split_into_children(record, prims, split)?;
        children.sort_unstable_by_key(|child| child.begin);

        let node = self.encoding.create_inner(&children, alloc)?;
        let mut outputs: SmallVec<[E::Output; MAX_BRANCHING_FACTOR]> = SmallVec::new();
        for child in &children {
            let slice = &mut prims[child.begin - record.begin..child.end - record.begin];
            outputs.push(self.recurse(*child, slice, alloc)?);
        }
        Ok(self.encoding.update_inner(node, &children, &outputs))
    }

    /// Leaf-versus-split SAH comparison. Ranges above the leaf size limit always split.
    fn prefers_leaf(&self, record: &BuildRecord, split: &Split) -> bool {
        let settings = self.settings;
        let leaf_sah = settings.int_cost * record.half_area() * settings.blocks(record.size()) as f32;
        let split_sah = settings.trav_cost * record.half_area() + settings.int_cost * split.sah;
        record.size() <= settings.max_leaf_size && leaf_sah <= split_sah
    }

    /// Splits `record` and keeps splitting the child with the largest surface area until the node is full.
    fn split_into_children(
        &self,
        record: BuildRecord,
        prims: &mut [PrimRef],
        split: Split,
    ) -> Result<ChildRecords> {
        let depth = record.depth + 1;
        let mut children: ChildRecords = smallvec![];
        let (left, right) = self.split_record(&record, prims, record.begin, &split, depth);
        children.push(left);
        children.push(right);

        while children.len() < self.settings.branching_factor {
            let mut best_child = None;
            let mut best_area = f32::NEG_INFINITY;
            for (i, child) in children.iter().enumerate() {
                if child.size() <= self.settings.min_leaf_size {
                    continue;
                }
                if child.half_area() > best_area {
                    best_area = child.half_area();
                    best_child = Some(i);
                }
            }
            let Some(best_child) = best_child else {
                break;
            };

            let child = children[best_child];
            let slice = &mut prims[child.begin - record.begin..child.end - record.begin];
            let child_split = self.heuristic.find(slice, &child.pinfo, false);
            let (left, right) = self.split_record(&child, slice, child.begin, &child_split, depth);
            children[best_child] = left;
            children.push(right);
        }
        Ok(children)
    }

    fn split_record(
        &self,
        record: &BuildRecord,
        prims: &mut [PrimRef],
        begin: usize,
        split: &Split,
        depth: usize,
    ) -> (BuildRecord, BuildRecord) {
        let result = self.heuristic.split(prims, &record.pinfo, split);
        let mid = begin + result.mid;
        (
            BuildRecord::new(begin, mid, depth, result.left),
            BuildRecord::new(mid, record.end, depth, result.right),
        )
    }

    /// Creates a leaf, or a subtree of positional splits when the range is larger than a leaf may be.
    fn create_large_leaf(
        &self,
        record: BuildRecord,
        prims: &mut [PrimRef],
        alloc: &mut ThreadAllocator<'a>,
    ) -> Result<E::Output> {
        if record.depth > self.settings.max_depth + LARGE_LEAF_DEPTH_SLACK {
            return Err(BuildError::DepthLimitReached {
                depth: record.depth,
            });
        }
        if record.size() <= self.settings.max_leaf_size {
            return self.create_leaf.create_leaf(&record, prims, alloc);
        }

        let depth = record.depth + 1;
        let mut children: ChildRecords = smallvec![record];
        while children.len() < self.settings.branching_factor {
            let mut best_child = None;
            let mut best_size = self.settings.max_leaf_size;
            for (i, child) in children.iter().enumerate() {
                if child.size() > best_size {
                    best_size = child.size();
                    best_child = Some(i);
                }
            }
            let Some(best_child) = best_child else {
                break;
            };

            let child = children[best_child];
            let slice = &mut prims[child.begin - record.begin..child.end - record.begin];
            let result = split_object_median(slice);
            let mid = child.begin + result.mid;
            children[best_child] = BuildRecord::new(child.begin, mid, depth, result.left);
            children.push(BuildRecord::new(mid, child.end, depth, result.right));
        }
        for child in children.iter_mut() {
            child.depth = depth;
        }
        children.sort_unstable_by_key(|child| child.begin);

        let node = self.encoding.create_inner(&children, alloc)?;
        let mut outputs: SmallVec<[E::Output; MAX_BRANCHING_FACTOR]> = SmallVec::new();
        for child in &children {
            let slice = &mut prims[child.begin - record.begin..child.end - record.begin];
            outputs.push(self.create_large_leaf(*child, slice, alloc)?);
        }
        Ok(self.encoding.update_inner(node, &children, &outputs))
    }
}

/// Cuts `prims` (which starts at absolute offset `base`) into the disjoint ranges of `children`,
/// which must be sorted and tile the slice.
fn split_child_slices<'p>(
    prims: &'p mut [PrimRef],
    base: usize,
    children: &[BuildRecord],
) -> Vec<&'p mut [PrimRef]> {
    let mut slices = Vec::with_capacity(children.len());
    let mut rest = prims;
    let mut offset = base;
    for child in children {
        debug_assert_eq!(child.begin, offset, "Child ranges must tile the parent range.");
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(child.size());
        slices.push(head);
        rest = tail;
        offset = child.end;
    }
    debug_assert!(rest.is_empty());
    slices
}
