mod bounding_box;
mod linear_bounds;
pub mod memory;

pub use self::bounding_box::BoundingBox;
pub use self::linear_bounds::LBBox;
