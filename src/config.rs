use std::time::Duration;

/// Tuning knobs for a [`crate::Machine`]. The defaults suit interactive use.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Rewrite constant-pool-referencing instructions into cached forms after first resolution.
    pub quickening: bool,
    /// Fuse straight-line runs of quickened instructions into micro-op traces.
    pub trace_fusion: bool,
    /// Backward branches a method takes before trace compilation is attempted.
    pub warmup_budget: i32,
    /// Traces shorter than this are discarded.
    pub min_trace_len: usize,
    pub max_stack_depth: usize,
    /// Target wall time of one scheduling quantum.
    pub responsiveness: Duration,
    pub initial_quantum: usize,
    pub min_quantum: usize,
    pub max_quantum: usize,
    /// Weight of the newest sample in the quantum moving average.
    pub quantum_smoothing: f64,
    /// Seed for the choice among threads contending for a released monitor.
    pub rng_seed: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            quickening: true,
            trace_fusion: true,
            warmup_budget: 1000,
            min_trace_len: 2,
            max_stack_depth: 1024,
            responsiveness: Duration::from_millis(10),
            initial_quantum: 1000,
            min_quantum: 50,
            max_quantum: 1_000_000,
            quantum_smoothing: 0.25,
            rng_seed: 0x853c_49e6_748f_ea9b,
        }
    }
}
