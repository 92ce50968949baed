use crate::builders::{PrimId, PrimRef};
use crate::bvh::node_ref::NodeRef;
use crate::error::Result;
use crate::utilities::memory::ThreadAllocator;
use crate::utilities::LBBox;
use std::mem;

/// Header of a primitive leaf block. The block continues with `count` [`PrimId`]s.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug)]
struct LeafHeader {
    count: u32,
}

const LEAF_HEADER_SIZE: usize = mem::size_of::<LeafHeader>();

/// Copies the identities of `prims` into a new arena block and returns a leaf reference to it.
pub fn create_primitive_leaf(prims: &[PrimRef], alloc: &mut ThreadAllocator<'_>) -> Result<NodeRef> {
    debug_assert!(!prims.is_empty());
    let bytes = LEAF_HEADER_SIZE + prims.len() * mem::size_of::<PrimId>();
    let block = alloc.malloc(bytes, mem::align_of::<LeafHeader>())?;
    unsafe {
        block.cast::<LeafHeader>().as_ptr().write(LeafHeader {
            count: prims.len() as u32,
        });
        let items = block.as_ptr().add(LEAF_HEADER_SIZE).cast::<PrimId>();
        for (i, prim) in prims.iter().enumerate() {
            items.add(i).write(prim.id());
        }
    }
    Ok(NodeRef::encode_leaf(block))
}

/// Primitive leaf plus the union of each primitive's motion bounds.
pub fn create_motion_leaf<F>(
    prims: &[PrimRef],
    alloc: &mut ThreadAllocator<'_>,
    motion_bounds: &F,
) -> Result<(NodeRef, LBBox)>
where
    F: Fn(&PrimRef) -> LBBox,
{
    let leaf = create_primitive_leaf(prims, alloc)?;
    let mut bounds = LBBox::EMPTY;
    for prim in prims {
        bounds.extend(&motion_bounds(prim));
    }
    Ok((leaf, bounds))
}

/// Identities stored in a leaf made by [`create_primitive_leaf`]. The empty leaf holds none.
///
/// # Safety
/// `leaf` must have been produced by [`create_primitive_leaf`] from an arena that outlives `'a`.
pub unsafe fn leaf_primitives<'a>(leaf: NodeRef) -> &'a [PrimId] {
    debug_assert!(leaf.is_leaf());
    if leaf.is_empty() {
        return &[];
    }
    let block = leaf.address() as *const u8;
    let count = (*block.cast::<LeafHeader>()).count as usize;
    std::slice::from_raw_parts(block.add(LEAF_HEADER_SIZE).cast::<PrimId>(), count)
}
