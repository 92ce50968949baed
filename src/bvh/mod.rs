//! Node encodings, leaves, the owning hierarchy and the builder front-ends.

mod aligned_node;
#[allow(clippy::module_inception)]
mod bvh;
mod bvh_builder;
mod leaf;
mod motion_node;
mod node_ref;
mod quantized_node;

pub use aligned_node::{AlignedNode, CreateAlignedNode, NodeBounds};
pub use bvh::{Bvh, BvhStatistics, LeafKind, NodeKind};
pub use bvh_builder::{
    BvhNBuilder, BvhNBuilderMblur, BvhNBuilderQuantized, MAX_BUILD_DEPTH, MAX_BUILD_DEPTH_LEAF,
};
pub use leaf::{create_motion_leaf, create_primitive_leaf, leaf_primitives};
pub use motion_node::{AlignedNodeMB, CreateAlignedNodeMB};
pub use node_ref::NodeRef;
pub use quantized_node::{CreateQuantizedNode, QuantizedNode};
