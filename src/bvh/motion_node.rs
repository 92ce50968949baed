use crate::builders::{BuildRecord, NodeEncoding};
use crate::bvh::aligned_node::NodeBounds;
use crate::bvh::node_ref::NodeRef;
use crate::error::Result;
use crate::utilities::memory::ThreadAllocator;
use crate::utilities::LBBox;
use std::ptr::NonNull;

/// Inner node for linearly moving geometry: every child has one box at time 0 and one at time 1.
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug)]
pub struct AlignedNodeMB<const N: usize> {
    pub bounds0: NodeBounds<N>,
    pub bounds1: NodeBounds<N>,
    pub children: [NodeRef; N],
}

impl<const N: usize> Default for AlignedNodeMB<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> AlignedNodeMB<N> {
    pub const EMPTY: Self = Self {
        bounds0: NodeBounds::EMPTY,
        bounds1: NodeBounds::EMPTY,
        children: [NodeRef::EMPTY; N],
    };

    #[inline]
    pub fn set(&mut self, i: usize, child: NodeRef, bounds: &LBBox) {
        self.children[i] = child;
        self.bounds0.set(i, &bounds.bounds0);
        self.bounds1.set(i, &bounds.bounds1);
    }

    #[inline]
    pub fn child(&self, i: usize) -> NodeRef {
        self.children[i]
    }

    #[inline]
    pub fn bounds(&self, i: usize) -> LBBox {
        LBBox::new(self.bounds0.get(i), self.bounds1.get(i))
    }

    /// Union of every occupied slot at both time samples.
    pub fn merged_bounds(&self) -> LBBox {
        let mut merged = LBBox::EMPTY;
        for i in 0..N {
            if !self.children[i].is_empty() {
                merged.extend(&self.bounds(i));
            }
        }
        merged
    }
}

/// Encoding that emits [`AlignedNodeMB`]s. Child bounds are only known once each child has been built, so
/// the node is allocated empty and filled in by `update_inner`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateAlignedNodeMB<const N: usize>;

impl<const N: usize> NodeEncoding for CreateAlignedNodeMB<N> {
    type Output = (NodeRef, LBBox);
    type Pending = NonNull<AlignedNodeMB<N>>;

    const BRANCHING_FACTOR: usize = N;

    fn create_inner(
        &self,
        children: &[BuildRecord],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Self::Pending> {
        debug_assert!(children.len() <= N);
        alloc.alloc(AlignedNodeMB::<N>::EMPTY)
    }

    fn update_inner(
        &self,
        node: Self::Pending,
        _children: &[BuildRecord],
        outputs: &[(NodeRef, LBBox)],
    ) -> (NodeRef, LBBox) {
        let inner = unsafe { &mut *node.as_ptr() };
        let mut merged = LBBox::EMPTY;
        for (i, (child, bounds)) in outputs.iter().enumerate() {
            inner.set(i, *child, bounds);
            merged.extend(bounds);
        }
        (
            NodeRef::encode_node(node, NodeRef::TY_ALIGNED_NODE_MB),
            merged,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::memory::Arena;
    use crate::utilities::BoundingBox;
    use glam::Vec3A;
    use std::mem;

    #[test]
    fn test_sizes() {
        assert_eq!(mem::size_of::<AlignedNodeMB<4>>(), 224);
        assert_eq!(mem::align_of::<AlignedNodeMB<4>>(), 32);
    }

    #[test]
    fn test_update_merges_both_time_samples() {
        let arena = Arena::default();
        let mut alloc = arena.thread_allocator();
        let encoding = CreateAlignedNodeMB::<4>;
        let pending = encoding.create_inner(&[], &mut alloc).unwrap();
        let a = LBBox::new(
            BoundingBox::new(Vec3A::ZERO, Vec3A::ONE),
            BoundingBox::new(Vec3A::splat(4.0), Vec3A::splat(5.0)),
        );
        let b = LBBox::new(
            BoundingBox::new(Vec3A::splat(-2.0), Vec3A::splat(-1.0)),
            BoundingBox::new(Vec3A::splat(-2.0), Vec3A::splat(0.5)),
        );
        let (node_ref, merged) =
            encoding.update_inner(pending, &[], &[(NodeRef::EMPTY, a), (NodeRef::EMPTY, b)]);
        assert!(node_ref.is_aligned_node_mb());
        assert_eq!(merged, LBBox::merge(&a, &b));
        let node = unsafe { node_ref.get::<AlignedNodeMB<4>>() };
        assert_eq!(node.bounds(0), a);
        assert_eq!(node.bounds(1), b);
        for t in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let at_t = merged.interpolate(t);
            assert!(at_t.contains(&a.interpolate(t)));
            assert!(at_t.contains(&b.interpolate(t)));
        }
    }
}
