use crate::utilities::bounding_box::BoundingBox;

/// A pair of bounding boxes sampled at time 0 and time 1.
///
/// The bound at any `t` in `[0, 1]` is the component-wise linear interpolation of the pair.
/// Primitives with linear motion whose endpoints are contained by `bounds0` and `bounds1` stay
/// inside the interpolated box for the whole interval.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LBBox {
    pub bounds0: BoundingBox,
    pub bounds1: BoundingBox,
}

impl Default for LBBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<BoundingBox> for LBBox {
    /// A static box: both time samples are the same.
    fn from(bounds: BoundingBox) -> Self {
        Self {
            bounds0: bounds,
            bounds1: bounds,
        }
    }
}

impl LBBox {
    pub const EMPTY: Self = Self {
        bounds0: BoundingBox::EMPTY,
        bounds1: BoundingBox::EMPTY,
    };

    #[inline]
    pub fn new(bounds0: BoundingBox, bounds1: BoundingBox) -> Self {
        Self { bounds0, bounds1 }
    }

    #[inline]
    pub fn extend(&mut self, other: &LBBox) {
        self.bounds0.extend(&other.bounds0);
        self.bounds1.extend(&other.bounds1);
    }

    #[inline]
    pub fn merge(a: &LBBox, b: &LBBox) -> Self {
        Self {
            bounds0: BoundingBox::merge(&a.bounds0, &b.bounds0),
            bounds1: BoundingBox::merge(&a.bounds1, &b.bounds1),
        }
    }

    /// Bound at time `t`.
    #[inline]
    pub fn interpolate(&self, t: f32) -> BoundingBox {
        self.bounds0.lerp(&self.bounds1, t)
    }

    /// Whether `other` stays inside this pair at both time samples, and therefore at every `t`.
    #[inline]
    pub fn contains(&self, other: &LBBox) -> bool {
        self.bounds0.contains(&other.bounds0) && self.bounds1.contains(&other.bounds1)
    }

    /// Average half area over the time interval. Weights nodes in the SAH cost estimate and the layout pass.
    #[inline]
    pub fn expected_half_area(&self) -> f32 {
        0.5 * (self.bounds0.half_area() + self.bounds1.half_area())
    }
}
