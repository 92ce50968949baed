use glam::Vec3A;

/// Provides simple axis-aligned bounding box functionality.
///
/// An empty box has `min = f32::MAX` and `max = f32::MIN` on every axis so that merging anything into it yields the other box.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    /// Location with the lowest X, Y, and Z coordinates in the axis-aligned bounding box.
    pub min: Vec3A,
    /// Location with the highest X, Y, and Z coordinates in the axis-aligned bounding box.
    pub max: Vec3A,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    /// Box that contains nothing; the identity for `merge`.
    pub const EMPTY: Self = Self {
        min: Vec3A::splat(f32::MAX),
        max: Vec3A::splat(f32::MIN),
    };

    /// Constructs a bounding box from the specified minimum and maximum.
    #[inline]
    pub fn new(min: Vec3A, max: Vec3A) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    /// Grows this box to contain `other`.
    #[inline]
    pub fn extend(&mut self, other: &BoundingBox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[inline]
    pub fn extend_point(&mut self, point: Vec3A) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Computes a bounding box which contains two other bounding boxes.
    #[inline]
    pub fn merge(a: &BoundingBox, b: &BoundingBox) -> Self {
        Self {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    #[inline]
    pub fn size(&self) -> Vec3A {
        self.max - self.min
    }

    /// Twice the centroid. Binning only needs relative positions, so the halving is skipped.
    #[inline]
    pub fn center2(&self) -> Vec3A {
        self.min + self.max
    }

    #[inline]
    pub fn center(&self) -> Vec3A {
        (self.min + self.max) * 0.5
    }

    /// Half of the surface area. This is the SAH metric; the factor of two cancels in every cost ratio.
    #[inline]
    pub fn half_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let offset = self.max - self.min;
        offset.x * offset.y + offset.y * offset.z + offset.z * offset.x
    }

    /// Index of the axis with the largest extent. Ties resolve to the lowest axis.
    #[inline]
    pub fn widest_axis(&self) -> usize {
        let size = self.size();
        if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        }
    }

    /// Whether `other` lies entirely within this box. Boundaries count as inside.
    #[inline]
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3A) -> bool {
        self.min.cmple(point).all() && self.max.cmpge(point).all()
    }

    /// Component-wise linear interpolation of the corners.
    #[inline]
    pub fn lerp(&self, other: &BoundingBox, t: f32) -> Self {
        Self {
            min: self.min * (1.0 - t) + other.min * t,
            max: self.max * (1.0 - t) + other.max * t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_merge() {
        let mut bounds = BoundingBox::EMPTY;
        assert!(bounds.is_empty());
        assert_eq!(bounds.half_area(), 0.0);
        let unit = BoundingBox::new(Vec3A::ZERO, Vec3A::ONE);
        bounds.extend(&unit);
        assert_eq!(bounds, unit);
        assert!(!bounds.is_empty());
    }

    #[test]
    fn test_metrics() {
        let b = BoundingBox::new(Vec3A::ZERO, Vec3A::new(1.0, 2.0, 3.0));
        assert_eq!(b.half_area(), 1.0 * 2.0 + 2.0 * 3.0 + 3.0 * 1.0);
        assert_eq!(b.widest_axis(), 2);
        assert_eq!(b.center2(), Vec3A::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_containment() {
        let outer = BoundingBox::new(Vec3A::splat(-1.0), Vec3A::splat(1.0));
        let inner = BoundingBox::new(Vec3A::splat(-0.5), Vec3A::splat(1.0));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains_point(Vec3A::ONE));
        assert!(!outer.contains_point(Vec3A::new(0.0, 1.5, 0.0)));
    }

    #[test]
    fn test_widest_axis_ties_prefer_x() {
        let b = BoundingBox::new(Vec3A::ZERO, Vec3A::splat(2.0));
        assert_eq!(b.widest_axis(), 0);
    }
}
