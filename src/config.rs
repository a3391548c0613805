//! Plain, non-CLI configuration structs consumed by the library. The CLI
//! binary's `clap`-derived flags build one of these; the library itself
//! never parses argv.

use std::collections::HashMap;

use crate::time::{Duration, TimePoint};
use crate::variable::{SimulatorIndex, Value, VariableId};

/// Configures a [`crate::scheduler::FixedStepScheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Δ₀ > 0. Zero raises `precondition_violated` at scheduler
    /// construction.
    pub base_step_size: Duration,
    /// Per-slave decimation factor kᵢ, defaulting to 1 for any slave not
    /// present in the map. Values ≤ 0 raise `precondition_violated`.
    pub decimation: HashMap<SimulatorIndex, i32>,
    /// Size of the worker pool used to dispatch `do_step` in parallel during
    /// the slave-stepping phase of a macro step. `1` disables parallelism.
    pub parallelism: usize,
    /// Lower bound on initialization fixed-point iterations; the actual
    /// bound used is `max(initialization_iterations, slave_count)`.
    pub initialization_iterations: usize,
}

impl SchedulerConfig {
    pub fn new(base_step_size: Duration) -> Self {
        SchedulerConfig {
            base_step_size,
            decimation: HashMap::new(),
            parallelism: 1,
            initialization_iterations: 10,
        }
    }

    pub fn with_decimation(mut self, simulator: SimulatorIndex, factor: i32) -> Self {
        self.decimation.insert(simulator, factor);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

/// Configures an [`crate::execution::Execution`] at construction time: a
/// start time, an optional stop time, an initial-values map, and a list
/// of simple (source, target) variable pairs to be wired as scalar
/// connections. Richer connection kinds (linear transform, sum, vector
/// sum, function-backed) are added afterward through
/// `Execution::connect_variables`.
#[derive(Clone, Debug, Default)]
pub struct ExecutionConfig {
    pub start_time: TimePoint,
    pub stop_time: Option<TimePoint>,
    pub initial_values: HashMap<VariableId, Value>,
    pub scalar_connections: Vec<(VariableId, VariableId)>,
}

impl ExecutionConfig {
    pub fn new(start_time: TimePoint) -> Self {
        ExecutionConfig {
            start_time,
            stop_time: None,
            initial_values: HashMap::new(),
            scalar_connections: Vec::new(),
        }
    }

    pub fn with_stop_time(mut self, stop_time: TimePoint) -> Self {
        self.stop_time = Some(stop_time);
        self
    }

    pub fn with_initial_value(mut self, variable: VariableId, value: Value) -> Self {
        self.initial_values.insert(variable, value);
        self
    }

    pub fn with_scalar_connection(mut self, source: VariableId, destination: VariableId) -> Self {
        self.scalar_connections.push((source, destination));
        self
    }
}
