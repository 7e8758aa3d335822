//! Search configuration parameters.

/// Configuration shared by all worker threads of one search.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Number of worker threads descending the tree in parallel.
    pub threads: usize,

    /// Mini-batch size for neural network evaluation. Each worker collects
    /// up to this many new leaves before calling the evaluator.
    pub batch_size: usize,

    /// Exploration constant for the PUCT formula.
    /// Typical range: 1.0 - 4.0, AlphaZero uses ~1.25.
    pub c_puct: f32,

    /// Virtual loss applied to a child during selection so that concurrent
    /// workers are steered toward different subtrees. Reverted at backup.
    pub virtual_loss: f32,

    /// First-play urgency: unvisited children score with the parent's own
    /// value minus this reduction.
    pub fpu_reduction: f32,

    /// Temperature applied to the prior policy after the network evaluation.
    /// 1.0 is a no-op; higher values flatten the priors.
    pub policy_temperature: f32,

    /// Temperature for the root visit distribution handed to the caller.
    /// 1.0 = proportional to visit counts, 0.0 = all mass on the most
    /// visited move.
    pub temperature: f32,

    /// Whether expansion consults the transposition table.
    pub use_transpositions: bool,

    /// Whether checking moves get a prior boost.
    pub enhance_checks: bool,

    /// Boost added to a checking move's prior, as a fraction of the largest
    /// prior.
    pub check_enhance_factor: f32,

    /// Checking moves with a prior above this threshold are left alone.
    pub check_enhance_threshold: f32,

    /// Dirichlet noise concentration for root exploration. 0 disables noise.
    pub dirichlet_alpha: f32,

    /// Fraction of the root prior replaced by Dirichlet noise.
    pub dirichlet_epsilon: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            threads: 2,
            batch_size: 16,
            c_puct: 1.25,
            virtual_loss: 1.0,
            fpu_reduction: 0.25,
            policy_temperature: 1.0,
            temperature: 1.0,
            use_transpositions: true,
            enhance_checks: true,
            check_enhance_factor: 0.5,
            check_enhance_threshold: 0.1,
            dirichlet_alpha: 0.3,
            dirichlet_epsilon: 0.25,
        }
    }
}

impl SearchSettings {
    /// Deterministic single-threaded config for tests: no noise, tiny
    /// batch, greedy root policy.
    pub fn for_testing() -> Self {
        Self {
            threads: 1,
            batch_size: 2,
            dirichlet_alpha: 0.0,
            dirichlet_epsilon: 0.0,
            enhance_checks: false,
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Builder pattern: set the number of worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Builder pattern: set the evaluation batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder pattern: set the PUCT exploration constant.
    pub fn with_c_puct(mut self, c_puct: f32) -> Self {
        self.c_puct = c_puct;
        self
    }

    /// Builder pattern: set the virtual loss magnitude.
    pub fn with_virtual_loss(mut self, virtual_loss: f32) -> Self {
        self.virtual_loss = virtual_loss;
        self
    }

    /// Builder pattern: set the root policy temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Stop conditions for one search.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchLimits {
    /// Maximum number of non-terminal descents through the root.
    /// 0 means unlimited (the caller stops the search cooperatively).
    pub nodes: u64,
}

impl SearchLimits {
    pub fn nodes(nodes: u64) -> Self {
        Self { nodes }
    }
}
