use crate::builders::{BuildRecord, NodeEncoding};
use crate::bvh::node_ref::NodeRef;
use crate::error::Result;
use crate::utilities::memory::ThreadAllocator;
use crate::utilities::BoundingBox;
use glam::Vec3A;
use std::ptr::NonNull;

/// Per-child boxes of an `N` wide node, stored one axis extreme per array so a traversal kernel can test every
/// child with one vector load per plane.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeBounds<const N: usize> {
    pub lower_x: [f32; N],
    pub upper_x: [f32; N],
    pub lower_y: [f32; N],
    pub upper_y: [f32; N],
    pub lower_z: [f32; N],
    pub upper_z: [f32; N],
}

impl<const N: usize> NodeBounds<N> {
    pub const EMPTY: Self = Self {
        lower_x: [f32::INFINITY; N],
        upper_x: [f32::NEG_INFINITY; N],
        lower_y: [f32::INFINITY; N],
        upper_y: [f32::NEG_INFINITY; N],
        lower_z: [f32::INFINITY; N],
        upper_z: [f32::NEG_INFINITY; N],
    };

    #[inline]
    pub fn set(&mut self, i: usize, bounds: &BoundingBox) {
        self.lower_x[i] = bounds.min.x;
        self.lower_y[i] = bounds.min.y;
        self.lower_z[i] = bounds.min.z;
        self.upper_x[i] = bounds.max.x;
        self.upper_y[i] = bounds.max.y;
        self.upper_z[i] = bounds.max.z;
    }

    #[inline]
    pub fn get(&self, i: usize) -> BoundingBox {
        BoundingBox::new(
            Vec3A::new(self.lower_x[i], self.lower_y[i], self.lower_z[i]),
            Vec3A::new(self.upper_x[i], self.upper_y[i], self.upper_z[i]),
        )
    }
}

/// Inner node with `N` full precision child boxes.
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug)]
pub struct AlignedNode<const N: usize> {
    pub bounds: NodeBounds<N>,
    pub children: [NodeRef; N],
}

impl<const N: usize> Default for AlignedNode<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> AlignedNode<N> {
    /// Node with every slot empty.
    pub const EMPTY: Self = Self {
        bounds: NodeBounds::EMPTY,
        children: [NodeRef::EMPTY; N],
    };

    #[inline]
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    #[inline]
    pub fn set_bounds(&mut self, i: usize, bounds: &BoundingBox) {
        self.bounds.set(i, bounds);
    }

    #[inline]
    pub fn bounds(&self, i: usize) -> BoundingBox {
        self.bounds.get(i)
    }

    #[inline]
    pub fn set_child(&mut self, i: usize, child: NodeRef) {
        self.children[i] = child;
    }

    #[inline]
    pub fn child(&self, i: usize) -> NodeRef {
        self.children[i]
    }

    /// Union of every occupied slot.
    pub fn merged_bounds(&self) -> BoundingBox {
        let mut merged = BoundingBox::EMPTY;
        for i in 0..N {
            if !self.children[i].is_empty() {
                merged.extend(&self.bounds(i));
            }
        }
        merged
    }
}

/// Encoding that emits [`AlignedNode`]s. Child boxes are written from the child ranges before recursion;
/// child references are patched in afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateAlignedNode<const N: usize>;

impl<const N: usize> NodeEncoding for CreateAlignedNode<N> {
    type Output = NodeRef;
    type Pending = NonNull<AlignedNode<N>>;

    const BRANCHING_FACTOR: usize = N;

    fn create_inner(
        &self,
        children: &[BuildRecord],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Self::Pending> {
        debug_assert!(children.len() <= N);
        let mut node = AlignedNode::<N>::EMPTY;
        for (i, child) in children.iter().enumerate() {
            node.set_bounds(i, &child.pinfo.geom_bounds);
        }
        alloc.alloc(node)
    }

    fn update_inner(
        &self,
        node: Self::Pending,
        _children: &[BuildRecord],
        outputs: &[NodeRef],
    ) -> NodeRef {
        // Only the task that created the node holds this pointer.
        let inner = unsafe { &mut *node.as_ptr() };
        for (i, child) in outputs.iter().enumerate() {
            inner.set_child(i, *child);
        }
        NodeRef::encode_node(node, NodeRef::TY_ALIGNED_NODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{PrimInfo, PrimRef};
    use crate::utilities::memory::Arena;
    use std::mem;

    #[test]
    fn test_sizes() {
        assert_eq!(mem::size_of::<NodeBounds<4>>(), 96);
        assert_eq!(mem::align_of::<AlignedNode<4>>(), 32);
        assert_eq!(mem::size_of::<AlignedNode<4>>(), 128);
        assert_eq!(mem::size_of::<AlignedNode<8>>(), 256);
    }

    #[test]
    fn test_bounds_slots() {
        let mut node = AlignedNode::<4>::EMPTY;
        let bounds = BoundingBox::new(Vec3A::new(-1.0, 2.0, 3.0), Vec3A::new(4.0, 5.0, 6.0));
        node.set_bounds(2, &bounds);
        assert_eq!(node.bounds(2), bounds);
        assert!(node.bounds(0).is_empty());
        assert!(node.merged_bounds().is_empty());
        let arena = Arena::default();
        let leaf = arena.thread_allocator().malloc(16, 16).unwrap();
        node.set_child(2, NodeRef::encode_leaf(leaf));
        assert_eq!(node.merged_bounds(), bounds);
        node.clear();
        assert!(node.child(2).is_empty());
    }

    #[test]
    fn test_create_then_update() {
        let arena = Arena::default();
        let mut alloc = arena.thread_allocator();
        let records: Vec<BuildRecord> = (0..3)
            .map(|i| {
                let p = Vec3A::splat(i as f32);
                let prim = PrimRef::new(&BoundingBox::new(p, p + Vec3A::ONE), 0, i);
                BuildRecord::new(i as usize, i as usize + 1, 2, PrimInfo::from_prims(&[prim]))
            })
            .collect();
        let encoding = CreateAlignedNode::<4>;
        let pending = encoding.create_inner(&records, &mut alloc).unwrap();
        let leaves = [NodeRef::EMPTY; 3];
        let node_ref = encoding.update_inner(pending, &records, &leaves);
        assert!(node_ref.is_aligned_node());
        let node = unsafe { node_ref.get::<AlignedNode<4>>() };
        for (i, record) in records.iter().enumerate() {
            assert_eq!(node.bounds(i), record.pinfo.geom_bounds);
        }
        assert!(node.bounds(3).is_empty());
    }
}
