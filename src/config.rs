//! Optimizer configuration.

use crate::errors::OptimizeError;

/// Number of groups a parallel plan may fill per bin unless configured otherwise.
pub const DEFAULT_MAX_PARALLELISM: usize = 4;

/// Settings that stay fixed for the lifetime of an [`Optimizer`](crate::opt::Optimizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Upper bound on the number of inputs placed in one group.
    pub max_parallelism: usize,
    /// Whether decomposable operations (`Add`, `Multiply`, `MatMul`,
    /// `Subtract`, `Divide`) are split into parallel plans. Branches are
    /// always considered.
    pub parallelize_operations: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            parallelize_operations: true,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_operation_parallelism(mut self, enabled: bool) -> Self {
        self.parallelize_operations = enabled;
        self
    }

    /// Rejects settings the optimizer cannot work with.
    pub fn validate(&self) -> Result<(), OptimizeError> {
        if self.max_parallelism == 0 {
            return Err(OptimizeError::InvalidConfig(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
