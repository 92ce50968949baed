// Builder front-ends: bind the shared binned SAH recursion to each node encoding and publish the result.

use crate::builders::{
    build_binned_sah, BuildRecord, CreateLeaf, NodeEncoding, PrimInfo, PrimRef, ProgressMonitor,
    Settings,
};
use crate::bvh::aligned_node::CreateAlignedNode;
use crate::bvh::bvh::{Bvh, LeafKind, NodeKind};
use crate::bvh::leaf::{create_motion_leaf, create_primitive_leaf};
use crate::bvh::motion_node::CreateAlignedNodeMB;
use crate::bvh::node_ref::NodeRef;
use crate::bvh::quantized_node::CreateQuantizedNode;
use crate::error::Result;
use crate::utilities::memory::ThreadAllocator;
use crate::utilities::LBBox;
use std::time::Instant;

/// Depth at which the SAH recursion stops splitting.
pub const MAX_BUILD_DEPTH: usize = 32;
/// Depth limit handed to the recursion; ranges still too large become positional subtrees below it.
pub const MAX_BUILD_DEPTH_LEAF: usize = MAX_BUILD_DEPTH + 8;

/// Share of the primitive count used as the number of subtrees the layout pass relocates around.
const LAYOUT_LARGE_NODES_FRACTION: f32 = 0.005;

fn primitive_leaf(
    _record: &BuildRecord,
    prims: &[PrimRef],
    alloc: &mut ThreadAllocator<'_>,
) -> Result<NodeRef> {
    create_primitive_leaf(prims, alloc)
}

struct MotionLeaf<'f, F> {
    motion_bounds: &'f F,
}

impl<F> CreateLeaf<(NodeRef, LBBox)> for MotionLeaf<'_, F>
where
    F: Fn(&PrimRef) -> LBBox + Sync,
{
    fn create_leaf(
        &self,
        _record: &BuildRecord,
        prims: &[PrimRef],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<(NodeRef, LBBox)> {
        create_motion_leaf(prims, alloc, self.motion_bounds)
    }
}

/// Describes what a front-end publishes.
struct Publish<R> {
    kind: NodeKind,
    leaves: LeafKind,
    root_of: R,
}

/// Runs the shared recursion into a fresh arena and publishes the result on `bvh` only if it succeeds.
///
/// Returns `None` for an empty input, which publishes an empty hierarchy.
fn build_into<const N: usize, E, L, P, R>(
    bvh: &mut Bvh<N>,
    encoding: &E,
    create_leaf: &L,
    progress: &P,
    prims: &mut [PrimRef],
    pinfo: &PrimInfo,
    settings: &Settings,
    publish: Publish<R>,
) -> Result<Option<E::Output>>
where
    E: NodeEncoding,
    L: CreateLeaf<E::Output>,
    P: ProgressMonitor,
    R: Fn(&E::Output, &PrimInfo) -> (NodeRef, LBBox),
{
    let mut settings = settings.clone();
    settings.branching_factor = N;
    settings.max_depth = MAX_BUILD_DEPTH_LEAF;
    settings.validate()?;

    let arena = bvh.create_arena();
    if prims.is_empty() {
        bvh.set(
            arena,
            NodeRef::EMPTY,
            LBBox::EMPTY,
            0,
            publish.kind,
            publish.leaves,
        );
        return Ok(None);
    }

    let start = Instant::now();
    let output =
        match build_binned_sah(&arena, encoding, create_leaf, progress, prims, pinfo, &settings) {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(%error, prims = prims.len(), "BVH build did not complete");
                return Err(error);
            }
        };
    let (root, bounds) = (publish.root_of)(&output, pinfo);
    bvh.set(
        arena,
        root,
        bounds,
        pinfo.size(),
        publish.kind,
        publish.leaves,
    );

    tracing::debug!(
        prims = pinfo.size(),
        kind = ?publish.kind,
        bytes_used = bvh.arena_statistics().bytes_used,
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Built BVH{N}"
    );
    Ok(Some(output))
}

fn static_root(root: &NodeRef, pinfo: &PrimInfo) -> (NodeRef, LBBox) {
    (*root, LBBox::from(pinfo.geom_bounds))
}

/// Builds `N` wide hierarchies of [`AlignedNode`](crate::bvh::AlignedNode)s.
pub struct BvhNBuilder<const N: usize>;

impl<const N: usize> BvhNBuilder<N> {
    /// Builds over `prims` with primitive leaves and relocates the top of the tree for locality.
    ///
    /// `prims` is reordered. `settings.branching_factor` and `settings.max_depth` are overridden.
    #[tracing::instrument(skip_all, fields(prims = prims.len(), width = N))]
    pub fn build<P: ProgressMonitor>(
        bvh: &mut Bvh<N>,
        progress: &P,
        prims: &mut [PrimRef],
        pinfo: &PrimInfo,
        settings: &Settings,
    ) -> Result<()> {
        Self::build_leaves(bvh, &primitive_leaf, progress, prims, pinfo, settings, LeafKind::Primitives)
    }

    /// Same as [`BvhNBuilder::build`] with caller supplied leaves. The hierarchy treats them as opaque.
    #[tracing::instrument(skip_all, fields(prims = prims.len(), width = N))]
    pub fn build_with_leaf<L, P>(
        bvh: &mut Bvh<N>,
        create_leaf: &L,
        progress: &P,
        prims: &mut [PrimRef],
        pinfo: &PrimInfo,
        settings: &Settings,
    ) -> Result<()>
    where
        L: CreateLeaf<NodeRef>,
        P: ProgressMonitor,
    {
        Self::build_leaves(bvh, create_leaf, progress, prims, pinfo, settings, LeafKind::Custom)
    }

    fn build_leaves<L, P>(
        bvh: &mut Bvh<N>,
        create_leaf: &L,
        progress: &P,
        prims: &mut [PrimRef],
        pinfo: &PrimInfo,
        settings: &Settings,
        leaves: LeafKind,
    ) -> Result<()>
    where
        L: CreateLeaf<NodeRef>,
        P: ProgressMonitor,
    {
        let publish = Publish {
            kind: NodeKind::Aligned,
            leaves,
            root_of: static_root,
        };
        let built = build_into(
            bvh,
            &CreateAlignedNode::<N>,
            create_leaf,
            progress,
            prims,
            pinfo,
            settings,
            publish,
        )?;
        if built.is_some() {
            let num = (pinfo.size() as f32 * LAYOUT_LARGE_NODES_FRACTION) as usize;
            if let Err(error) = bvh.layout_large_nodes(num) {
                tracing::warn!(%error, num, "Skipped large node layout");
            }
        }
        Ok(())
    }
}

/// Builds `N` wide hierarchies of [`QuantizedNode`](crate::bvh::QuantizedNode)s.
pub struct BvhNBuilderQuantized<const N: usize>;

impl<const N: usize> BvhNBuilderQuantized<N> {
    // TODO: relocate large subtrees once the layout pass can copy quantized nodes.
    #[tracing::instrument(skip_all, fields(prims = prims.len(), width = N))]
    pub fn build<P: ProgressMonitor>(
        bvh: &mut Bvh<N>,
        progress: &P,
        prims: &mut [PrimRef],
        pinfo: &PrimInfo,
        settings: &Settings,
    ) -> Result<()> {
        let publish = Publish {
            kind: NodeKind::Quantized,
            leaves: LeafKind::Primitives,
            root_of: static_root,
        };
        build_into(
            bvh,
            &CreateQuantizedNode::<N>,
            &primitive_leaf,
            progress,
            prims,
            pinfo,
            settings,
            publish,
        )?;
        Ok(())
    }
}

/// Builds `N` wide hierarchies of [`AlignedNodeMB`](crate::bvh::AlignedNodeMB)s over linearly moving primitives.
pub struct BvhNBuilderMblur<const N: usize>;

impl<const N: usize> BvhNBuilderMblur<N> {
    /// Builds over `prims`, whose boxes must bound each primitive over the whole time interval.
    ///
    /// `motion_bounds` returns a primitive's boxes at time 0 and time 1. Returns the root and its bounds, which
    /// are also published on `bvh`.
    #[tracing::instrument(skip_all, fields(prims = prims.len(), width = N))]
    pub fn build<M, P>(
        bvh: &mut Bvh<N>,
        motion_bounds: &M,
        progress: &P,
        prims: &mut [PrimRef],
        pinfo: &PrimInfo,
        settings: &Settings,
    ) -> Result<(NodeRef, LBBox)>
    where
        M: Fn(&PrimRef) -> LBBox + Sync,
        P: ProgressMonitor,
    {
        let publish = Publish {
            kind: NodeKind::AlignedMB,
            leaves: LeafKind::Primitives,
            root_of: |root: &(NodeRef, LBBox), _: &PrimInfo| *root,
        };
        let built = build_into(
            bvh,
            &CreateAlignedNodeMB::<N>,
            &MotionLeaf { motion_bounds },
            progress,
            prims,
            pinfo,
            settings,
            publish,
        )?;
        Ok(built.unwrap_or((NodeRef::EMPTY, LBBox::EMPTY)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{CancellationToken, NoProgress, PrimId};
    use crate::error::BuildError;
    use crate::utilities::memory::{ArenaSettings, ArenaStatistics};
    use crate::utilities::BoundingBox;
    use glam::Vec3A;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self) -> f32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 40) as f32 / (1u64 << 24) as f32
        }

        fn next_vec(&mut self) -> Vec3A {
            Vec3A::new(self.next_f32(), self.next_f32(), self.next_f32())
        }
    }

    fn random_boxes(seed: u64, count: u32) -> Vec<BoundingBox> {
        let mut rng = Lcg(seed);
        (0..count)
            .map(|_| {
                let min = rng.next_vec() * 100.0 - Vec3A::splat(50.0);
                BoundingBox::new(min, min + rng.next_vec() * 2.0)
            })
            .collect()
    }

    fn prims_of(boxes: &[BoundingBox]) -> Vec<PrimRef> {
        boxes
            .iter()
            .enumerate()
            .map(|(i, b)| PrimRef::new(b, 1, i as u32))
            .collect()
    }

    fn unit_grid(n: u32) -> Vec<BoundingBox> {
        let mut boxes = Vec::new();
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let p = Vec3A::new(x as f32, y as f32, z as f32);
                    boxes.push(BoundingBox::new(p, p + Vec3A::ONE));
                }
            }
        }
        boxes
    }

    fn assert_complete(primitives: Vec<PrimId>, count: usize) {
        assert_eq!(primitives.len(), count);
        let unique: HashSet<PrimId> = primitives.iter().copied().collect();
        assert_eq!(unique.len(), count);
        assert!(unique.iter().all(|id| id.geom_id == 1 && (id.prim_id as usize) < count));
    }

    fn leaf_partition<const N: usize>(bvh: &Bvh<N>) -> Vec<Vec<PrimId>> {
        let mut leaves = Vec::new();
        bvh.for_each_leaf(|leaf, _| leaves.push(bvh.leaf_primitives(leaf).unwrap().to_vec()));
        leaves
    }

    #[test]
    fn test_aligned_build_is_complete_and_conservative() {
        let boxes = random_boxes(1, 5000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &Settings::default())
            .unwrap();
        assert_eq!(bvh.kind(), NodeKind::Aligned);
        assert_eq!(bvh.num_primitives(), 5000);
        assert_eq!(bvh.bounds(), LBBox::from(pinfo.geom_bounds));
        assert_complete(bvh.primitives().unwrap(), 5000);
        bvh.validate(|id| LBBox::from(boxes[id.prim_id as usize])).unwrap();
    }

    #[test]
    fn test_quantized_bounds_contain_primitives() {
        let boxes = random_boxes(2, 4000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<8>::default();
        BvhNBuilderQuantized::<8>::build(
            &mut bvh,
            &NoProgress,
            &mut prims,
            &pinfo,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(bvh.kind(), NodeKind::Quantized);
        assert!(bvh.root().is_quantized_node());
        assert_complete(bvh.primitives().unwrap(), 4000);
        bvh.validate(|id| LBBox::from(boxes[id.prim_id as usize])).unwrap();
    }

    #[test]
    fn test_motion_bounds_contain_moving_primitives() {
        let boxes = random_boxes(3, 3000);
        let mut rng = Lcg(99);
        let velocities: Vec<Vec3A> = (0..boxes.len())
            .map(|_| rng.next_vec() * 8.0 - Vec3A::splat(4.0))
            .collect();
        let motion_of = |id: PrimId| {
            let b0 = boxes[id.prim_id as usize];
            let v = velocities[id.prim_id as usize];
            LBBox::new(b0, BoundingBox::new(b0.min + v, b0.max + v))
        };
        let motion = |prim: &PrimRef| motion_of(prim.id());
        let mut prims: Vec<PrimRef> = prims_of(&boxes)
            .iter()
            .map(|p| {
                let lbbox = motion(p);
                let bounds = BoundingBox::merge(&lbbox.bounds0, &lbbox.bounds1);
                PrimRef::new(&bounds, p.geom_id, p.prim_id)
            })
            .collect();
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::default();
        let (root, bounds) = BvhNBuilderMblur::<4>::build(
            &mut bvh,
            &motion,
            &NoProgress,
            &mut prims,
            &pinfo,
            &Settings::default(),
        )
        .unwrap();
        assert!(root.is_aligned_node_mb());
        assert_eq!(bvh.root(), root);
        assert_eq!(bvh.bounds(), bounds);
        assert_complete(bvh.primitives().unwrap(), 3000);
        bvh.validate(motion_of).unwrap();

        for step in 0..=16 {
            let t = step as f32 / 16.0;
            bvh.for_each_leaf(|leaf, path| {
                for &id in bvh.leaf_primitives(leaf).unwrap() {
                    let at_t = motion_of(id).interpolate(t);
                    for slot in path {
                        assert!(slot.interpolate(t).contains(&at_t));
                    }
                }
            });
        }
    }

    #[test]
    fn test_leaf_size_bound() {
        let boxes = random_boxes(4, 3000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let settings = Settings::default().with_leaf_size(2, 4).with_costs(0.1, 1.0);
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &settings).unwrap();
        assert!(bvh.statistics().max_leaf_size <= 4);
        assert_complete(bvh.primitives().unwrap(), 3000);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let boxes = random_boxes(5, 20_000);
        let input = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&input);
        let settings = Settings::default().with_single_thread_threshold(256);

        let mut first = Bvh::<4>::default();
        let mut prims = input.clone();
        BvhNBuilder::<4>::build(&mut first, &NoProgress, &mut prims, &pinfo, &settings).unwrap();
        let mut second = Bvh::<4>::default();
        let mut prims = input.clone();
        BvhNBuilder::<4>::build(&mut second, &NoProgress, &mut prims, &pinfo, &settings).unwrap();

        assert_eq!(first.bounds(), second.bounds());
        assert_eq!(leaf_partition(&first), leaf_partition(&second));
        assert_eq!(first.statistics(), second.statistics());
    }

    #[test]
    fn test_unit_grid_scenario() {
        let boxes = unit_grid(10);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &Settings::default())
            .unwrap();
        assert_eq!(
            bvh.bounds().bounds0,
            BoundingBox::new(Vec3A::ZERO, Vec3A::splat(10.0))
        );
        for (i, b) in boxes.iter().enumerate() {
            let found = bvh.point_query(b.center(), 0.0).unwrap();
            assert!(found.contains(&PrimId::new(1, i as u32)), "box {i} not found");
        }
        assert!(bvh
            .point_query(Vec3A::splat(10.5), 0.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cancellation_publishes_nothing() {
        let boxes = random_boxes(6, 100_000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let calls = AtomicUsize::new(0);
        let monitor = |_: usize| calls.fetch_add(1, Ordering::Relaxed) == 0;

        let mut bvh = Bvh::<4>::default();
        let before = bvh.arena_statistics();
        let result = BvhNBuilder::<4>::build(
            &mut bvh,
            &monitor,
            &mut prims,
            &pinfo,
            &Settings::default(),
        );
        assert_eq!(result, Err(BuildError::Cancelled));
        assert!(bvh.is_empty());
        assert_eq!(bvh.arena_statistics(), before);
        assert_eq!(before, ArenaStatistics::default());
        assert!(calls.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_cancelled_engine_keeps_regions_accounted() {
        let boxes = random_boxes(7, 100_000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let calls = AtomicUsize::new(0);
        let monitor = |_: usize| calls.fetch_add(1, Ordering::Relaxed) == 0;
        let settings = Settings::default().with_branching_factor(4);

        let mut arena = crate::utilities::memory::Arena::default();
        let result = build_binned_sah(
            &arena,
            &CreateAlignedNode::<4>,
            &primitive_leaf,
            &monitor,
            &mut prims,
            &pinfo,
            &settings,
        );
        assert_eq!(result, Err(BuildError::Cancelled));
        let stats = arena.statistics();
        assert!(stats.bytes_used <= stats.bytes_reserved);
        assert_eq!(
            stats.bytes_reserved,
            stats.region_count * arena.settings().block_size
        );
        arena.clear();
        assert_eq!(arena.statistics(), ArenaStatistics::default());
    }

    #[test]
    fn test_arena_reserves_close_to_what_it_hands_out() {
        let boxes = random_boxes(11, 200_000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &Settings::default())
            .unwrap();
        let stats = bvh.arena_statistics();
        let block_size = ArenaSettings::default().block_size;
        // Every worker may leave one region partly used; forking must not cost a region per task.
        let slack = (rayon::current_num_threads() + 1) * block_size;
        assert!(stats.bytes_used > 0);
        assert!(
            stats.bytes_reserved <= stats.bytes_used + stats.bytes_used / 4 + slack,
            "reserved {} bytes for {} used",
            stats.bytes_reserved,
            stats.bytes_used
        );
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_structure() {
        let boxes = random_boxes(8, 2000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &Settings::default())
            .unwrap();
        let root = bvh.root();

        let token = CancellationToken::new();
        token.cancel();
        let settings = Settings::default().with_cancellation(token);
        let result = BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &settings);
        assert_eq!(result, Err(BuildError::Cancelled));
        assert_eq!(bvh.root(), root);
        assert_complete(bvh.primitives().unwrap(), 2000);
    }

    #[test]
    fn test_out_of_memory_is_reported() {
        let boxes = random_boxes(9, 5000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<4>::new(ArenaSettings {
            block_size: 1024,
            max_bytes: Some(4096),
        });
        let result =
            BvhNBuilder::<4>::build(&mut bvh, &NoProgress, &mut prims, &pinfo, &Settings::default());
        assert!(matches!(result, Err(BuildError::OutOfMemory { .. })));
        assert!(bvh.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build(
            &mut bvh,
            &NoProgress,
            &mut [],
            &PrimInfo::EMPTY,
            &Settings::default(),
        )
        .unwrap();
        assert!(bvh.is_empty());
        assert_eq!(bvh.num_primitives(), 0);

        let mut bvh = Bvh::<4>::default();
        let motion = |p: &PrimRef| LBBox::from(p.bounds());
        let (root, bounds) = BvhNBuilderMblur::<4>::build(
            &mut bvh,
            &motion,
            &NoProgress,
            &mut [],
            &PrimInfo::EMPTY,
            &Settings::default(),
        )
        .unwrap();
        assert!(root.is_empty());
        assert_eq!(bounds, LBBox::EMPTY);
    }

    #[test]
    fn test_single_primitive_is_a_leaf_root() {
        let boxes = random_boxes(10, 1);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let mut bvh = Bvh::<8>::default();
        BvhNBuilderQuantized::<8>::build(
            &mut bvh,
            &NoProgress,
            &mut prims,
            &pinfo,
            &Settings::default(),
        )
        .unwrap();
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.primitives().unwrap(), vec![PrimId::new(1, 0)]);
    }

    #[test]
    fn test_custom_leaves_are_opaque() {
        let boxes = random_boxes(11, 1000);
        let mut prims = prims_of(&boxes);
        let pinfo = PrimInfo::from_prims(&prims);
        let leaf_prims = AtomicUsize::new(0);
        let counting_leaf = |record: &BuildRecord,
                             prims: &[PrimRef],
                             alloc: &mut ThreadAllocator<'_>|
         -> Result<NodeRef> {
            leaf_prims.fetch_add(record.size(), Ordering::Relaxed);
            create_primitive_leaf(prims, alloc)
        };
        let mut bvh = Bvh::<4>::default();
        BvhNBuilder::<4>::build_with_leaf(
            &mut bvh,
            &counting_leaf,
            &NoProgress,
            &mut prims,
            &pinfo,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(leaf_prims.load(Ordering::Relaxed), 1000);
        assert_eq!(bvh.leaf_kind(), LeafKind::Custom);
        assert!(matches!(bvh.primitives(), Err(BuildError::Unsupported(_))));
        let mut leaves = 0;
        bvh.for_each_leaf(|_, _| leaves += 1);
        assert_eq!(bvh.statistics().leaves, leaves);
    }
}
