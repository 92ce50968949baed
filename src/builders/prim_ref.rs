use crate::utilities::BoundingBox;
use glam::{Vec3, Vec3A};
use rayon::prelude::*;

/// Ranges at least this large compute their summary with a parallel reduction.
pub const PARALLEL_REDUCE_THRESHOLD: usize = 16 * 1024;
const PARALLEL_REDUCE_BLOCK_SIZE: usize = 4096;

/// Identity of a primitive within a scene.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimId {
    pub geom_id: u32,
    pub prim_id: u32,
}

impl PrimId {
    #[inline]
    pub fn new(geom_id: u32, prim_id: u32) -> Self {
        Self { geom_id, prim_id }
    }
}

/// A primitive's bounding box with its identity packed into the padding lanes.
///
/// The builder only ever moves these around inside the array; the contents are never modified.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimRef {
    pub lower: Vec3,
    pub geom_id: u32,
    pub upper: Vec3,
    pub prim_id: u32,
}

impl PrimRef {
    #[inline]
    pub fn new(bounds: &BoundingBox, geom_id: u32, prim_id: u32) -> Self {
        Self {
            lower: bounds.min.into(),
            geom_id,
            upper: bounds.max.into(),
            prim_id,
        }
    }

    #[inline]
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.lower.into(), self.upper.into())
    }

    /// Twice the box center; see [`BoundingBox::center2`].
    #[inline]
    pub fn center2(&self) -> Vec3A {
        Vec3A::from(self.lower) + Vec3A::from(self.upper)
    }

    #[inline]
    pub fn id(&self) -> PrimId {
        PrimId::new(self.geom_id, self.prim_id)
    }
}

/// Running summary of a primitive range.
///
/// `cent_bounds` bounds the doubled centers returned by [`PrimRef::center2`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimInfo {
    pub geom_bounds: BoundingBox,
    pub cent_bounds: BoundingBox,
    pub count: usize,
}

impl Default for PrimInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl PrimInfo {
    pub const EMPTY: Self = Self {
        geom_bounds: BoundingBox::EMPTY,
        cent_bounds: BoundingBox::EMPTY,
        count: 0,
    };

    #[inline]
    pub fn add(&mut self, prim: &PrimRef) {
        self.geom_bounds.extend(&prim.bounds());
        self.cent_bounds.extend_point(prim.center2());
        self.count += 1;
    }

    #[inline]
    pub fn merge(a: &PrimInfo, b: &PrimInfo) -> PrimInfo {
        PrimInfo {
            geom_bounds: BoundingBox::merge(&a.geom_bounds, &b.geom_bounds),
            cent_bounds: BoundingBox::merge(&a.cent_bounds, &b.cent_bounds),
            count: a.count + b.count,
        }
    }

    /// Summarizes `prims`, reducing in parallel for large inputs.
    pub fn from_prims(prims: &[PrimRef]) -> PrimInfo {
        if prims.len() < PARALLEL_REDUCE_THRESHOLD {
            return Self::from_prims_serial(prims);
        }
        prims
            .par_chunks(PARALLEL_REDUCE_BLOCK_SIZE)
            .map(Self::from_prims_serial)
            .reduce(|| PrimInfo::EMPTY, |a, b| PrimInfo::merge(&a, &b))
    }

    pub fn from_prims_serial(prims: &[PrimRef]) -> PrimInfo {
        let mut info = PrimInfo::EMPTY;
        for prim in prims {
            info.add(prim);
        }
        info
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn half_area(&self) -> f32 {
        self.geom_bounds.half_area()
    }

    /// Whether every center in the range coincides.
    #[inline]
    pub fn has_degenerate_centroids(&self) -> bool {
        let extent = self.cent_bounds.size();
        extent.x <= 0.0 && extent.y <= 0.0 && extent.z <= 0.0
    }
}
