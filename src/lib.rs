//! Parallel binned SAH construction of bounding volume hierarchies.
//!
//! [`builders`] holds the encoding independent recursion, [`bvh`] the node layouts and the front-ends that
//! publish a finished [`bvh::Bvh`].

pub mod builders;
pub mod bvh;
mod error;
pub mod utilities;

pub use error::{BuildError, Result};
