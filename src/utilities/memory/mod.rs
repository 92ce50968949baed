//! Arena allocation for hierarchy nodes and leaves.

mod arena;

pub use arena::{Arena, ArenaSettings, ArenaStatistics, ThreadAllocator, WorkerAllocators};
