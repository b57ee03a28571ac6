use serde::{Deserialize, Serialize};

/// Per-equation solver controls, chosen by the outer configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverControls {
    /// Absolute residual tolerance.
    pub tolerance: f64,
    /// Normalized residual tolerance (final / initial).
    pub rel_tol: f64,
    /// Iteration cap. Hitting it is reported, not fatal.
    pub max_iter: usize,
    /// Log residuals per iteration at debug level.
    pub verbose: bool,
}

impl Default for SolverControls {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            rel_tol: 1e-6,
            max_iter: 1000,
            verbose: false,
        }
    }
}

impl SolverControls {
    pub fn new(tolerance: f64, max_iter: usize) -> Self {
        Self {
            tolerance,
            max_iter,
            ..Default::default()
        }
    }

    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }
}
