//! Error types for BVH construction.

use thiserror::Error;

/// Reasons a build did not produce a hierarchy.
///
/// Degenerate geometry never shows up here; the split fallbacks absorb it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The progress monitor or cancellation token requested an abort.
    #[error("Build cancelled")]
    Cancelled,

    /// The arena could not reserve another region.
    #[error("Out of memory: failed to reserve {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Settings were rejected before the build started.
    #[error("Invalid build settings: {0}")]
    InvalidSettings(String),

    /// The large-leaf path ran past the depth slack.
    #[error("Depth limit reached at depth {depth}")]
    DepthLimitReached { depth: usize },

    /// A published hierarchy failed a consistency check.
    #[error("Invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    /// The hierarchy's node or leaf layout does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type alias for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
