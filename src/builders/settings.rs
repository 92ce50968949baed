use crate::builders::progress::CancellationToken;
use crate::error::{BuildError, Result};

/// Largest branching factor any node encoding supports.
pub const MAX_BRANCHING_FACTOR: usize = 8;

/// Largest number of bins per axis the binner can hold.
pub const MAX_BINS: usize = 64;

/// Extra levels the large-leaf path may add below `max_depth` before the build gives up.
pub const LARGE_LEAF_DEPTH_SLACK: usize = 32;

/// Per-build configuration of the binned SAH builder.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Number of children per inner node. Node encodings overwrite this with their own width.
    pub branching_factor: usize,
    /// Depth at which every range becomes a (possibly large) leaf.
    pub max_depth: usize,
    /// Ranges at or below this size are never split.
    pub min_leaf_size: usize,
    /// No leaf holds more primitives than this.
    pub max_leaf_size: usize,
    /// Estimated cost of traversing one inner node.
    pub trav_cost: f32,
    /// Estimated cost of intersecting one primitive block.
    pub int_cost: f32,
    /// Bins per axis. Small ranges use fewer.
    pub bin_count: usize,
    /// Ranges above this size are built with parallel tasks; smaller ones are built serially.
    pub single_thread_threshold: usize,
    /// Primitives are costed in blocks of `1 << log_block_size`.
    pub log_block_size: usize,
    /// Checked together with the progress monitor at coarse granularity.
    pub cancel: Option<CancellationToken>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            branching_factor: 2,
            max_depth: 40,
            min_leaf_size: 1,
            max_leaf_size: 8,
            trav_cost: 1.0,
            int_cost: 1.0,
            bin_count: 16,
            single_thread_threshold: 1024,
            log_block_size: 0,
            cancel: None,
        }
    }
}

impl Settings {
    pub fn with_leaf_size(mut self, min_leaf_size: usize, max_leaf_size: usize) -> Self {
        self.min_leaf_size = min_leaf_size;
        self.max_leaf_size = max_leaf_size;
        self
    }

    pub fn with_costs(mut self, trav_cost: f32, int_cost: f32) -> Self {
        self.trav_cost = trav_cost;
        self.int_cost = int_cost;
        self
    }

    pub fn with_bin_count(mut self, bin_count: usize) -> Self {
        self.bin_count = bin_count;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    pub fn with_single_thread_threshold(mut self, threshold: usize) -> Self {
        self.single_thread_threshold = threshold;
        self
    }

    pub fn with_log_block_size(mut self, log_block_size: usize) -> Self {
        self.log_block_size = log_block_size;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Number of cost blocks `count` primitives occupy.
    #[inline]
    pub fn blocks(&self, count: usize) -> usize {
        (count + (1 << self.log_block_size) - 1) >> self.log_block_size
    }

    /// Rejects configurations the recursion cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_BRANCHING_FACTOR).contains(&self.branching_factor) {
            return Err(BuildError::InvalidSettings(format!(
                "branching factor {} outside 2..={MAX_BRANCHING_FACTOR}",
                self.branching_factor
            )));
        }
        if self.min_leaf_size == 0 {
            return Err(BuildError::InvalidSettings(
                "minimum leaf size must be positive".to_string(),
            ));
        }
        if self.min_leaf_size > self.max_leaf_size {
            return Err(BuildError::InvalidSettings(format!(
                "minimum leaf size {} exceeds maximum leaf size {}",
                self.min_leaf_size, self.max_leaf_size
            )));
        }
        if !(2..=MAX_BINS).contains(&self.bin_count) {
            return Err(BuildError::InvalidSettings(format!(
                "bin count {} outside 2..={MAX_BINS}",
                self.bin_count
            )));
        }
        if !(self.trav_cost.is_finite() && self.trav_cost >= 0.0)
            || !(self.int_cost.is_finite() && self.int_cost > 0.0)
        {
            return Err(BuildError::InvalidSettings(format!(
                "costs must be finite with a positive intersection cost (trav {}, int {})",
                self.trav_cost, self.int_cost
            )));
        }
        if self.log_block_size >= usize::BITS as usize / 2 {
            return Err(BuildError::InvalidSettings(format!(
                "log block size {} is too large",
                self.log_block_size
            )));
        }
        Ok(())
    }
}
