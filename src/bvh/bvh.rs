use crate::builders::PrimId;
use crate::bvh::aligned_node::AlignedNode;
use crate::bvh::leaf::leaf_primitives;
use crate::bvh::motion_node::AlignedNodeMB;
use crate::bvh::node_ref::NodeRef;
use crate::bvh::quantized_node::QuantizedNode;
use crate::error::{BuildError, Result};
use crate::utilities::memory::{Arena, ArenaSettings, ArenaStatistics};
use crate::utilities::{BoundingBox, LBBox};
use glam::Vec3A;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::mem;

/// Node layout of a built hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Aligned,
    Quantized,
    AlignedMB,
}

/// Contents of the leaves of a built hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafKind {
    /// Leaves made by [`create_primitive_leaf`](crate::bvh::create_primitive_leaf).
    Primitives,
    /// Leaves made by a caller supplied callback. They are opaque to the hierarchy.
    Custom,
}

/// Shape and quality summary of a hierarchy.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BvhStatistics {
    pub inner_nodes: usize,
    pub leaves: usize,
    pub max_depth: usize,
    pub max_leaf_size: usize,
    /// Expected traversal cost relative to the root's surface area, counting one unit per inner node visit and
    /// one per primitive test.
    pub sah_cost: f32,
}

type Children = SmallVec<[(NodeRef, LBBox); 8]>;

/// An `N` wide bounding volume hierarchy and the arena that owns its nodes.
///
/// A new build replaces the whole structure at once; until then the previous structure stays valid.
pub struct Bvh<const N: usize> {
    arena: Arena,
    arena_settings: ArenaSettings,
    root: NodeRef,
    bounds: LBBox,
    num_primitives: usize,
    kind: NodeKind,
    leaves: LeafKind,
}

impl<const N: usize> Default for Bvh<N> {
    fn default() -> Self {
        Self::new(ArenaSettings::default())
    }
}

impl<const N: usize> Bvh<N> {
    pub fn new(arena_settings: ArenaSettings) -> Self {
        Self {
            arena: Arena::new(arena_settings),
            arena_settings,
            root: NodeRef::EMPTY,
            bounds: LBBox::EMPTY,
            num_primitives: 0,
            kind: NodeKind::Aligned,
            leaves: LeafKind::Primitives,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// Bounds of the whole hierarchy. Static hierarchies report the same box at both time samples.
    #[inline]
    pub fn bounds(&self) -> LBBox {
        self.bounds
    }

    #[inline]
    pub fn num_primitives(&self) -> usize {
        self.num_primitives
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn leaf_kind(&self) -> LeafKind {
        self.leaves
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Fresh arena configured like this hierarchy's own, for building a replacement.
    pub(crate) fn create_arena(&self) -> Arena {
        Arena::new(self.arena_settings)
    }

    /// Publishes a finished build. The previous nodes are released with their arena.
    pub(crate) fn set(
        &mut self,
        arena: Arena,
        root: NodeRef,
        bounds: LBBox,
        num_primitives: usize,
        kind: NodeKind,
        leaves: LeafKind,
    ) {
        self.arena = arena;
        self.root = root;
        self.bounds = bounds;
        self.num_primitives = num_primitives;
        self.kind = kind;
        self.leaves = leaves;
    }

    /// Drops every node and leaf.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.root = NodeRef::EMPTY;
        self.bounds = LBBox::EMPTY;
        self.num_primitives = 0;
    }

    pub fn arena_statistics(&self) -> ArenaStatistics {
        self.arena.statistics()
    }

    /// Occupied slots of an inner node with their decoded bounds.
    fn children_of(&self, node: NodeRef) -> Children {
        debug_assert!(!node.is_leaf());
        let mut children = Children::new();
        // Every reference reachable from the root points into `self.arena`.
        match node.node_type() {
            NodeRef::TY_ALIGNED_NODE => {
                let inner = unsafe { node.get::<AlignedNode<N>>() };
                for i in 0..N {
                    if !inner.child(i).is_empty() {
                        children.push((inner.child(i), LBBox::from(inner.bounds(i))));
                    }
                }
            }
            NodeRef::TY_QUANTIZED_NODE => {
                let inner = unsafe { node.get::<QuantizedNode<N>>() };
                for i in 0..N {
                    if !inner.child(i).is_empty() {
                        children.push((inner.child(i), LBBox::from(inner.bounds(i))));
                    }
                }
            }
            NodeRef::TY_ALIGNED_NODE_MB => {
                let inner = unsafe { node.get::<AlignedNodeMB<N>>() };
                for i in 0..N {
                    if !inner.child(i).is_empty() {
                        children.push((inner.child(i), inner.bounds(i)));
                    }
                }
            }
            _ => unreachable!("Unknown inner node type {}", node.node_type()),
        }
        children
    }

    /// Visits every leaf depth first. `path` holds the slot bounds from the root down to the leaf's own slot.
    pub fn for_each_leaf<F>(&self, mut f: F)
    where
        F: FnMut(NodeRef, &[LBBox]),
    {
        if self.root.is_empty() {
            return;
        }
        let mut path = vec![self.bounds];
        self.visit_leaves(self.root, &mut path, &mut f);
    }

    fn visit_leaves<F>(&self, node: NodeRef, path: &mut Vec<LBBox>, f: &mut F)
    where
        F: FnMut(NodeRef, &[LBBox]),
    {
        if node.is_leaf() {
            f(node, path);
            return;
        }
        for (child, bounds) in self.children_of(node) {
            path.push(bounds);
            self.visit_leaves(child, path, f);
            path.pop();
        }
    }

    fn require_primitive_leaves(&self) -> Result<()> {
        match self.leaves {
            LeafKind::Primitives => Ok(()),
            LeafKind::Custom => Err(BuildError::Unsupported(
                "leaves were created by a custom callback",
            )),
        }
    }

    /// Identities stored in a leaf of this hierarchy.
    pub fn leaf_primitives(&self, leaf: NodeRef) -> Result<&[PrimId]> {
        self.require_primitive_leaves()?;
        if !leaf.is_leaf() {
            return Err(BuildError::Unsupported("reference is not a leaf"));
        }
        Ok(unsafe { leaf_primitives(leaf) })
    }

    /// Every primitive in the hierarchy in leaf order.
    pub fn primitives(&self) -> Result<Vec<PrimId>> {
        self.require_primitive_leaves()?;
        let mut primitives = Vec::with_capacity(self.num_primitives);
        self.for_each_leaf(|leaf, _| {
            primitives.extend_from_slice(unsafe { leaf_primitives(leaf) });
        });
        Ok(primitives)
    }

    /// Primitives in every leaf whose bounds at `time` contain `point`.
    pub fn point_query(&self, point: Vec3A, time: f32) -> Result<Vec<PrimId>> {
        self.require_primitive_leaves()?;
        let mut found = Vec::new();
        if self.root.is_empty() || !self.bounds.interpolate(time).contains_point(point) {
            return Ok(found);
        }
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if node.is_leaf() {
                found.extend_from_slice(unsafe { leaf_primitives(node) });
                continue;
            }
            for (child, bounds) in self.children_of(node) {
                if bounds.interpolate(time).contains_point(point) {
                    stack.push(child);
                }
            }
        }
        Ok(found)
    }

    pub fn statistics(&self) -> BvhStatistics {
        let mut stats = BvhStatistics::default();
        if self.root.is_empty() {
            return stats;
        }
        let root_area = self.bounds.expected_half_area();
        let mut cost = if self.root.is_leaf() {
            0.0
        } else {
            root_area
        };
        let mut stack = vec![(self.root, self.bounds, 1usize)];
        while let Some((node, bounds, depth)) = stack.pop() {
            stats.max_depth = stats.max_depth.max(depth);
            if node.is_leaf() {
                let count = match self.leaves {
                    LeafKind::Primitives => unsafe { leaf_primitives(node) }.len(),
                    LeafKind::Custom => 1,
                };
                stats.leaves += 1;
                stats.max_leaf_size = stats.max_leaf_size.max(count);
                cost += bounds.expected_half_area() * count as f32;
                continue;
            }
            stats.inner_nodes += 1;
            for (child, child_bounds) in self.children_of(node) {
                if !child.is_leaf() {
                    cost += child_bounds.expected_half_area();
                }
                stack.push((child, child_bounds, depth + 1));
            }
        }
        stats.sah_cost = if root_area > 0.0 { cost / root_area } else { 0.0 };
        stats
    }

    /// Checks that every slot contains the slots below it and every primitive lies inside its ancestors.
    ///
    /// `bounds_of` returns the bounds each primitive was built from. Quantized slots are only checked against
    /// primitive bounds, since a child's grid may reach one step past its own slot in the parent.
    /// Reports the first violation found.
    pub fn validate<F>(&self, bounds_of: F) -> Result<()>
    where
        F: Fn(PrimId) -> LBBox,
    {
        let mut count = 0;
        let mut violation: Option<String> = None;
        self.for_each_leaf(|leaf, path| {
            if violation.is_some() {
                return;
            }
            if self.kind != NodeKind::Quantized {
                if let Some(pair) = path.windows(2).find(|pair| !pair[0].contains(&pair[1])) {
                    violation = Some(format!(
                        "slot {:?} is not contained by its parent {:?}",
                        pair[1], pair[0]
                    ));
                    return;
                }
            }
            if self.leaves == LeafKind::Custom {
                return;
            }
            let primitives = unsafe { leaf_primitives(leaf) };
            count += primitives.len();
            for &id in primitives {
                let prim_bounds = bounds_of(id);
                if let Some(ancestor) = path.iter().find(|ancestor| !ancestor.contains(&prim_bounds)) {
                    violation = Some(format!("primitive {id:?} is outside its ancestor {ancestor:?}"));
                    return;
                }
            }
        });
        if let Some(violation) = violation {
            return Err(BuildError::InvalidHierarchy(violation));
        }
        if self.leaves == LeafKind::Primitives && count != self.num_primitives {
            return Err(BuildError::InvalidHierarchy(format!(
                "leaves hold {count} primitives, expected {}",
                self.num_primitives
            )));
        }
        Ok(())
    }

    /// Rewrites every node bound bottom up from new primitive bounds, keeping the topology.
    pub fn refit<F>(&mut self, bounds_of: F) -> Result<()>
    where
        F: Fn(PrimId) -> BoundingBox,
    {
        if self.kind != NodeKind::Aligned {
            return Err(BuildError::Unsupported("refit requires aligned nodes"));
        }
        self.require_primitive_leaves()?;
        if self.root.is_empty() {
            return Ok(());
        }
        let bounds = self.refit_node(self.root, &bounds_of);
        self.bounds = LBBox::from(bounds);
        Ok(())
    }

    fn refit_node<F>(&mut self, node: NodeRef, bounds_of: &F) -> BoundingBox
    where
        F: Fn(PrimId) -> BoundingBox,
    {
        if node.is_leaf() {
            let mut merged = BoundingBox::EMPTY;
            for &id in unsafe { leaf_primitives(node) } {
                merged.extend(&bounds_of(id));
            }
            return merged;
        }
        let inner = unsafe { node.get_mut::<AlignedNode<N>>() };
        for i in 0..N {
            let child = inner.child(i);
            if child.is_empty() {
                continue;
            }
            let child_bounds = self.refit_node(child, bounds_of);
            inner.set_bounds(i, &child_bounds);
        }
        inner.merged_bounds()
    }

    /// Copies the nodes above the `num` largest subtrees into one contiguous depth first block.
    ///
    /// Only aligned hierarchies are relocated; other layouts are left as they are. On failure the existing
    /// structure stays in place.
    pub fn layout_large_nodes(&mut self, num: usize) -> Result<()> {
        if self.kind != NodeKind::Aligned || num == 0 || self.root.is_leaf() {
            return Ok(());
        }

        let mut heap = BinaryHeap::new();
        heap.push(LayoutEntry {
            area: self.bounds.expected_half_area(),
            node: self.root,
        });
        while heap.len() < num {
            let Some(largest) = heap.pop() else {
                break;
            };
            if largest.node.is_leaf() {
                heap.push(largest);
                break;
            }
            for (child, bounds) in self.children_of(largest.node) {
                heap.push(LayoutEntry {
                    area: bounds.expected_half_area(),
                    node: child,
                });
            }
        }
        let barriers: HashSet<NodeRef> = heap.into_iter().map(|entry| entry.node).collect();
        if barriers.contains(&self.root) {
            return Ok(());
        }

        let count = self.count_layout_nodes(self.root, &barriers);
        let mut alloc = self.arena.thread_allocator();
        let block = alloc
            .malloc(
                count * mem::size_of::<AlignedNode<N>>(),
                mem::align_of::<AlignedNode<N>>(),
            )?
            .cast::<AlignedNode<N>>();
        drop(alloc);

        let mut next = 0;
        let root = self.relocate(self.root, &barriers, block.as_ptr(), &mut next);
        debug_assert_eq!(next, count);
        tracing::trace!(relocated = count, barriers = barriers.len(), "Laid out large nodes");
        self.root = root;
        Ok(())
    }

    fn count_layout_nodes(&self, node: NodeRef, barriers: &HashSet<NodeRef>) -> usize {
        if node.is_leaf() || barriers.contains(&node) {
            return 0;
        }
        1 + self
            .children_of(node)
            .iter()
            .map(|(child, _)| self.count_layout_nodes(*child, barriers))
            .sum::<usize>()
    }

    fn relocate(
        &self,
        node: NodeRef,
        barriers: &HashSet<NodeRef>,
        block: *mut AlignedNode<N>,
        next: &mut usize,
    ) -> NodeRef {
        if node.is_leaf() || barriers.contains(&node) {
            return node;
        }
        let source = unsafe { *node.get::<AlignedNode<N>>() };
        let slot = unsafe { block.add(*next) };
        *next += 1;
        unsafe { slot.write(source) };
        for i in 0..N {
            let child = source.child(i);
            if child.is_empty() {
                continue;
            }
            let relocated = self.relocate(child, barriers, block, next);
            unsafe { (*slot).set_child(i, relocated) };
        }
        // The block came from a non-null allocation.
        NodeRef::encode_node(
            unsafe { std::ptr::NonNull::new_unchecked(slot) },
            NodeRef::TY_ALIGNED_NODE,
        )
    }
}

/// Subtree candidate for relocation, ordered by surface area.
struct LayoutEntry {
    area: f32,
    node: NodeRef,
}

impl PartialEq for LayoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LayoutEntry {}

impl PartialOrd for LayoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LayoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.area.total_cmp(&other.area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{PrimInfo, PrimRef, Settings};
    use crate::bvh::bvh_builder::BvhNBuilder;

    fn grid(n: u32) -> Vec<PrimRef> {
        let mut prims = Vec::new();
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let p = Vec3A::new(x as f32, y as f32, z as f32) * 2.0;
                    prims.push(PrimRef::new(
                        &BoundingBox::new(p, p + Vec3A::ONE),
                        0,
                        prims.len() as u32,
                    ));
                }
            }
        }
        prims
    }

    fn build(prims: &[PrimRef]) -> Bvh<4> {
        let mut bvh = Bvh::<4>::default();
        let mut work = prims.to_vec();
        let pinfo = PrimInfo::from_prims(&work);
        BvhNBuilder::<4>::build(
            &mut bvh,
            &crate::builders::NoProgress,
            &mut work,
            &pinfo,
            &Settings::default(),
        )
        .unwrap();
        bvh
    }

    #[test]
    fn test_empty_hierarchy() {
        let bvh = Bvh::<4>::default();
        assert!(bvh.is_empty());
        assert!(bvh.primitives().unwrap().is_empty());
        assert!(bvh.point_query(Vec3A::ZERO, 0.0).unwrap().is_empty());
        assert_eq!(bvh.statistics(), BvhStatistics::default());
    }

    #[test]
    fn test_statistics() {
        let prims = grid(6);
        let bvh = build(&prims);
        let stats = bvh.statistics();
        assert!(stats.inner_nodes > 0);
        assert!(stats.leaves >= 216 / 8);
        assert!(stats.max_leaf_size <= 8);
        assert!(stats.max_depth >= 3);
        assert!(stats.sah_cost > 1.0);
    }

    #[test]
    fn test_refit_tracks_moved_primitives() {
        let prims = grid(5);
        let mut bvh = build(&prims);
        let offset = Vec3A::new(10.0, -3.0, 0.5);
        let moved = |id: PrimId| {
            let b = prims[id.prim_id as usize].bounds();
            BoundingBox::new(b.min + offset, b.max + offset)
        };
        bvh.refit(moved).unwrap();
        let expected = PrimInfo::from_prims(&prims).geom_bounds;
        assert_eq!(
            bvh.bounds().bounds0,
            BoundingBox::new(expected.min + offset, expected.max + offset)
        );
        bvh.validate(|id| LBBox::from(moved(id))).unwrap();
        let center = prims[17].bounds().center() + offset;
        assert!(bvh
            .point_query(center, 0.0)
            .unwrap()
            .contains(&PrimId::new(0, 17)));
    }

    #[test]
    fn test_validate_reports_violations() {
        let prims = grid(4);
        let bvh = build(&prims);
        bvh.validate(|id| LBBox::from(prims[id.prim_id as usize].bounds()))
            .unwrap();

        let escaped = bvh.validate(|id| {
            let b = prims[id.prim_id as usize].bounds();
            if id.prim_id == 5 {
                LBBox::from(BoundingBox::new(b.min, b.max + Vec3A::splat(100.0)))
            } else {
                LBBox::from(b)
            }
        });
        assert!(matches!(escaped, Err(BuildError::InvalidHierarchy(_))));
    }

    #[test]
    fn test_layout_preserves_structure() {
        let prims = grid(8);
        let mut bvh = build(&prims);
        let mut before = bvh.primitives().unwrap();
        let stats_before = bvh.statistics();
        let old_root = bvh.root();
        bvh.layout_large_nodes(16).unwrap();
        assert_ne!(bvh.root(), old_root);
        let mut after = bvh.primitives().unwrap();
        before.sort();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(bvh.statistics(), stats_before);
        bvh.validate(|id| LBBox::from(prims[id.prim_id as usize].bounds())).unwrap();
    }

    #[test]
    fn test_layout_skips_trivial_requests() {
        let prims = grid(3);
        let mut bvh = build(&prims);
        let root = bvh.root();
        bvh.layout_large_nodes(0).unwrap();
        bvh.layout_large_nodes(1).unwrap();
        assert_eq!(bvh.root(), root);
    }

    #[test]
    fn test_clear_releases_arena() {
        let prims = grid(4);
        let mut bvh = build(&prims);
        assert!(bvh.arena_statistics().region_count > 0);
        bvh.clear();
        assert!(bvh.is_empty());
        assert_eq!(bvh.arena_statistics(), ArenaStatistics::default());
    }
}
