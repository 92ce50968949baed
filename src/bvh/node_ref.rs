use std::fmt;
use std::ptr::NonNull;

/// Tagged pointer to a node or leaf inside a BVH's arena.
///
/// Every node and leaf is allocated at 16 byte alignment, leaving the low four bits for the type tag.
/// A null pointer with the leaf tag is the empty reference.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(usize);

impl NodeRef {
    pub const ALIGN_MASK: usize = 15;

    pub const TY_ALIGNED_NODE: usize = 0;
    pub const TY_QUANTIZED_NODE: usize = 1;
    pub const TY_ALIGNED_NODE_MB: usize = 2;
    pub const TY_LEAF: usize = 8;

    pub const EMPTY: NodeRef = NodeRef(Self::TY_LEAF);

    /// Encodes a pointer to an inner node of type `ty`.
    #[inline]
    pub fn encode_node<T>(node: NonNull<T>, ty: usize) -> Self {
        let address = node.as_ptr() as usize;
        debug_assert_eq!(address & Self::ALIGN_MASK, 0, "Nodes must be 16 byte aligned.");
        debug_assert!(ty < Self::TY_LEAF, "Inner node tags are below the leaf tag.");
        NodeRef(address | ty)
    }

    /// Encodes a pointer to a leaf block.
    #[inline]
    pub fn encode_leaf<T>(leaf: NonNull<T>) -> Self {
        let address = leaf.as_ptr() as usize;
        debug_assert_eq!(address & Self::ALIGN_MASK, 0, "Leaves must be 16 byte aligned.");
        NodeRef(address | Self::TY_LEAF)
    }

    #[inline(always)]
    pub fn node_type(self) -> usize {
        self.0 & Self::ALIGN_MASK
    }

    #[inline(always)]
    pub fn is_leaf(self) -> bool {
        self.node_type() >= Self::TY_LEAF
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    #[inline(always)]
    pub fn is_aligned_node(self) -> bool {
        self.node_type() == Self::TY_ALIGNED_NODE
    }

    #[inline(always)]
    pub fn is_quantized_node(self) -> bool {
        self.node_type() == Self::TY_QUANTIZED_NODE
    }

    #[inline(always)]
    pub fn is_aligned_node_mb(self) -> bool {
        self.node_type() == Self::TY_ALIGNED_NODE_MB
    }

    /// Untagged address of the referenced block.
    #[inline(always)]
    pub fn address(self) -> usize {
        self.0 & !Self::ALIGN_MASK
    }

    /// Reinterprets the referenced block as a `T`.
    ///
    /// # Safety
    /// The reference must point at a live `T` in an arena that outlives `'a`.
    #[inline(always)]
    pub unsafe fn get<'a, T>(self) -> &'a T {
        debug_assert!(!self.is_empty());
        &*(self.address() as *const T)
    }

    /// Mutable variant of [`NodeRef::get`].
    ///
    /// # Safety
    /// Same as [`NodeRef::get`], and no other reference to the block may be alive.
    #[inline(always)]
    pub unsafe fn get_mut<'a, T>(self) -> &'a mut T {
        debug_assert!(!self.is_empty());
        &mut *(self.address() as *mut T)
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NodeRef(empty)");
        }
        write!(f, "NodeRef({:#x}, type {})", self.address(), self.node_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Block([u8; 16]);

    #[test]
    fn test_tags_round_trip() {
        let mut block = Block([0; 16]);
        let pointer = NonNull::from(&mut block);
        let node = NodeRef::encode_node(pointer, NodeRef::TY_QUANTIZED_NODE);
        assert!(node.is_quantized_node());
        assert!(!node.is_leaf());
        assert_eq!(node.address(), pointer.as_ptr() as usize);

        let leaf = NodeRef::encode_leaf(pointer);
        assert!(leaf.is_leaf());
        assert!(!leaf.is_empty());
        assert_eq!(leaf.address(), node.address());
    }

    #[test]
    fn test_empty() {
        assert!(NodeRef::EMPTY.is_leaf());
        assert!(NodeRef::EMPTY.is_empty());
        assert_eq!(NodeRef::default(), NodeRef::EMPTY);
        assert_eq!(NodeRef::EMPTY.address(), 0);
    }
}
