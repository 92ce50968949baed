use crate::builders::{BuildRecord, NodeEncoding};
use crate::bvh::node_ref::NodeRef;
use crate::error::Result;
use crate::utilities::memory::ThreadAllocator;
use crate::utilities::BoundingBox;
use glam::Vec3A;
use smallvec::SmallVec;
use std::ptr::NonNull;

const QUANTIZED_MAX: u8 = u8::MAX;

#[inline(always)]
fn dequantize(start: f32, scale: f32, q: u8) -> f32 {
    start + scale * q as f32
}

/// Smallest step size such that the last grid line reaches `upper`.
fn grid_scale(start: f32, upper: f32) -> f32 {
    let mut scale = (upper - start) / QUANTIZED_MAX as f32;
    let mut bump = 1u32;
    while dequantize(start, scale, QUANTIZED_MAX) < upper {
        scale = f32::from_bits(scale.to_bits() + bump);
        bump = bump.saturating_mul(2);
    }
    scale
}

/// Grid index whose line is at or below `value`.
fn quantize_lower(start: f32, scale: f32, value: f32) -> u8 {
    if scale <= 0.0 {
        return 0;
    }
    let mut q = ((value - start) / scale).floor().clamp(0.0, QUANTIZED_MAX as f32) as u8;
    while q > 0 && dequantize(start, scale, q) > value {
        q -= 1;
    }
    q
}

/// Grid index whose line is at or above `value`.
fn quantize_upper(start: f32, scale: f32, value: f32) -> u8 {
    if scale <= 0.0 {
        return 0;
    }
    let mut q = ((value - start) / scale).ceil().clamp(0.0, QUANTIZED_MAX as f32) as u8;
    while q < QUANTIZED_MAX && dequantize(start, scale, q) < value {
        q += 1;
    }
    q
}

/// Inner node storing child boxes as 8 bit offsets on a per node grid.
///
/// Decoded child boxes always contain the boxes they were built from; they may be larger by up to one grid step
/// per side.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug)]
pub struct QuantizedNode<const N: usize> {
    pub children: [NodeRef; N],
    pub lower_x: [u8; N],
    pub upper_x: [u8; N],
    pub lower_y: [u8; N],
    pub upper_y: [u8; N],
    pub lower_z: [u8; N],
    pub upper_z: [u8; N],
    pub start: [f32; 3],
    pub scale: [f32; 3],
}

impl<const N: usize> Default for QuantizedNode<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> QuantizedNode<N> {
    /// Node with every slot empty. Empty slots decode to an inverted box.
    pub const EMPTY: Self = Self {
        children: [NodeRef::EMPTY; N],
        lower_x: [QUANTIZED_MAX; N],
        upper_x: [0; N],
        lower_y: [QUANTIZED_MAX; N],
        upper_y: [0; N],
        lower_z: [QUANTIZED_MAX; N],
        upper_z: [0; N],
        start: [0.0; 3],
        scale: [0.0; 3],
    };

    /// Sets up the grid over the union of `bounds` and quantizes every box into the leading slots.
    pub fn init_bounds(&mut self, bounds: &[BoundingBox]) {
        debug_assert!(bounds.len() <= N);
        let mut merged = BoundingBox::EMPTY;
        for b in bounds {
            merged.extend(b);
        }
        if merged.is_empty() {
            return;
        }
        for axis in 0..3 {
            self.start[axis] = merged.min[axis];
            self.scale[axis] = grid_scale(merged.min[axis], merged.max[axis]);
        }
        for (i, b) in bounds.iter().enumerate() {
            self.set_bounds(i, b);
        }
    }

    /// Quantizes `bounds` into slot `i`. The box must lie inside the node's grid.
    pub fn set_bounds(&mut self, i: usize, bounds: &BoundingBox) {
        let [sx, sy, sz] = self.start;
        let [dx, dy, dz] = self.scale;
        self.lower_x[i] = quantize_lower(sx, dx, bounds.min.x);
        self.lower_y[i] = quantize_lower(sy, dy, bounds.min.y);
        self.lower_z[i] = quantize_lower(sz, dz, bounds.min.z);
        self.upper_x[i] = quantize_upper(sx, dx, bounds.max.x);
        self.upper_y[i] = quantize_upper(sy, dy, bounds.max.y);
        self.upper_z[i] = quantize_upper(sz, dz, bounds.max.z);
    }

    /// Decoded box of slot `i`.
    #[inline]
    pub fn bounds(&self, i: usize) -> BoundingBox {
        let [sx, sy, sz] = self.start;
        let [dx, dy, dz] = self.scale;
        BoundingBox::new(
            Vec3A::new(
                dequantize(sx, dx, self.lower_x[i]),
                dequantize(sy, dy, self.lower_y[i]),
                dequantize(sz, dz, self.lower_z[i]),
            ),
            Vec3A::new(
                dequantize(sx, dx, self.upper_x[i]),
                dequantize(sy, dy, self.upper_y[i]),
                dequantize(sz, dz, self.upper_z[i]),
            ),
        )
    }

    #[inline]
    pub fn set_child(&mut self, i: usize, child: NodeRef) {
        self.children[i] = child;
    }

    #[inline]
    pub fn child(&self, i: usize) -> NodeRef {
        self.children[i]
    }

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

/// Encoding that emits [`QuantizedNode`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateQuantizedNode<const N: usize>;

impl<const N: usize> NodeEncoding for CreateQuantizedNode<N> {
    type Output = NodeRef;
    type Pending = NonNull<QuantizedNode<N>>;

    const BRANCHING_FACTOR: usize = N;

    fn create_inner(
        &self,
        children: &[BuildRecord],
        alloc: &mut ThreadAllocator<'_>,
    ) -> Result<Self::Pending> {
        let bounds: SmallVec<[BoundingBox; 8]> =
            children.iter().map(|c| c.pinfo.geom_bounds).collect();
        let mut node = QuantizedNode::<N>::EMPTY;
        node.init_bounds(&bounds);
        alloc.alloc(node)
    }

    fn update_inner(
        &self,
        node: Self::Pending,
        _children: &[BuildRecord],
        outputs: &[NodeRef],
    ) -> NodeRef {
        let inner = unsafe { &mut *node.as_ptr() };
        for (i, child) in outputs.iter().enumerate() {
            inner.set_child(i, *child);
        }
        NodeRef::encode_node(node, NodeRef::TY_QUANTIZED_NODE)
    }
}
