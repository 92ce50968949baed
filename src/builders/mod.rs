//! Encoding-independent pieces of hierarchy construction: primitive references, binning, and the recursive
//! SAH scheduler.

pub mod bvh_builder_sah;
pub mod heuristic_binning;
pub mod prim_ref;
pub mod progress;
pub mod settings;

pub use bvh_builder_sah::{build_binned_sah, BuildRecord, ChildRecords, CreateLeaf, NodeEncoding};
pub use heuristic_binning::{BinInfo, BinMapping, HeuristicBinning, Split, SplitResult};
pub use prim_ref::{PrimId, PrimInfo, PrimRef};
pub use progress::{CancellationToken, NoProgress, ProgressMonitor};
pub use settings::{Settings, LARGE_LEAF_DEPTH_SLACK, MAX_BINS, MAX_BRANCHING_FACTOR};
