use serde::{Deserialize, Serialize};

/// How the GLS normal equations treat numerically dependent design columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RankPolicy {
    /// Dependent directions get zero weight; the fitted mean stays the unique
    /// GLS projection.
    #[default]
    PseudoInverse,
    /// Any dependent direction is reported as a singular Gram matrix.
    Reject,
}

pub fn default_parallel_assembly() -> bool {
    true
}

pub fn default_parallel_threshold() -> usize {
    256
}

/// Evaluator configuration. `Default` reproduces the reference objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOptions {
    #[serde(default)]
    pub rank_policy: RankPolicy,
    /// Map-reduce the temporal components on the rayon pool.
    #[serde(default = "default_parallel_assembly")]
    pub parallel: bool,
    /// Smallest N for which the parallel assembly path is taken.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    /// Adds `N ln(2π)` so the objective is exactly `-2 ln L`.
    #[serde(default)]
    pub include_normalizing_constant: bool,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            rank_policy: RankPolicy::default(),
            parallel: default_parallel_assembly(),
            parallel_threshold: default_parallel_threshold(),
            include_normalizing_constant: false,
        }
    }
}

impl ProfileOptions {
    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub(crate) fn use_parallel_assembly(&self, n: usize) -> bool {
        self.parallel && n >= self.parallel_threshold
    }
}
