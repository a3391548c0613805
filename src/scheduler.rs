//! The fixed-step scheduler: global step sizing, per-slave decimation,
//! parallel slave stepping, the transfer phase, and the initialization
//! fixed-point.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::config::SchedulerConfig;
use crate::connection::ConnectionGraph;
use crate::error::{precondition, Error, Result};
use crate::function::{FunctionBinding, FunctionInstance};
use crate::manipulator::ManipulatorPipeline;
use crate::observer::ObserverFanout;
use crate::slave::{SlaveAdapter, StepResult};
use crate::time::{Duration, TimePoint};
use crate::variable::{FunctionIndex, SimulatorIndex, Value, VariableId, VariableType};

/// The result of one successful `do_step` dispatch.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub stepped: Vec<SimulatorIndex>,
    pub step_index: u64,
    pub current_time: TimePoint,
}

/// Drives slaves through simulated time in fixed-size macro steps.
/// Owns only scheduling state (current time, step index, configuration);
/// slaves, connections, manipulators and observers are owned by
/// [`crate::execution::Execution`] and threaded through by reference so
/// this type has no knowledge of execution-level bookkeeping like
/// pending-setup slaves or the error state.
pub struct FixedStepScheduler {
    config: SchedulerConfig,
    current_time: TimePoint,
    stop_time: Option<TimePoint>,
    step_index: u64,
}

impl FixedStepScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        precondition!(config.base_step_size > Duration::ZERO, "base step size must be positive");
        for (simulator, factor) in &config.decimation {
            precondition!(*factor >= 1, "decimation factor for {simulator:?} must be >= 1, got {factor}");
        }
        FixedStepScheduler {
            config,
            current_time: TimePoint::EPOCH,
            stop_time: None,
            step_index: 0,
        }
    }

    pub fn current_time(&self) -> TimePoint {
        self.current_time
    }

    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    pub fn base_step_size(&self) -> Duration {
        self.config.base_step_size
    }

    /// Overwrites the scheduler's clock, used by `Execution::restore_state`
    /// to put the scheduler back where a snapshot was taken (a save/restore
    /// cycle must restore `current_time`).
    pub fn restore_time(&mut self, current_time: TimePoint, step_index: u64) {
        self.current_time = current_time;
        self.step_index = step_index;
    }

    fn decimation_for(&self, simulator: SimulatorIndex) -> i32 {
        self.config.decimation.get(&simulator).copied().unwrap_or(1)
    }

    /// Registers a new slave's decimation factor, validating it. Call
    /// before the slave first becomes eligible to step.
    pub fn set_decimation(&mut self, simulator: SimulatorIndex, factor: i32) {
        precondition!(factor >= 1, "decimation factor for {simulator:?} must be >= 1, got {factor}");
        self.config.decimation.insert(simulator, factor);
    }

    /// Delivers `(t0, t_stop)` to every slave and records the start time.
    /// Slaves added after this call receive their own deferred `setup`,
    /// which is the caller's responsibility (see `Execution::add_slave`).
    pub fn setup(
        &mut self,
        slaves: &mut HashMap<SimulatorIndex, SlaveAdapter>,
        start: TimePoint,
        stop: Option<TimePoint>,
        tolerance: Option<f64>,
    ) -> Result<()> {
        self.current_time = start;
        self.stop_time = stop;
        self.step_index = 0;
        for adapter in slaves.values_mut() {
            adapter.setup(start, stop, tolerance)?;
            adapter.start_simulation()?;
        }
        log::debug!("scheduler setup at t={:?}, stop={:?}", start, stop);
        Ok(())
    }

    /// Runs the initialization fixed-point: repeatedly reads outputs,
    /// transfers through connections, and writes inputs, until no input
    /// value changes between iterations or the iteration bound is reached.
    pub fn initialize(
        &mut self,
        slaves: &mut HashMap<SimulatorIndex, SlaveAdapter>,
        connections: &mut ConnectionGraph,
        functions: &mut HashMap<FunctionIndex, Box<dyn FunctionInstance>>,
        function_bindings: &HashMap<FunctionIndex, FunctionBinding>,
    ) -> Result<()> {
        let bound = self.config.initialization_iterations.max(slaves.len()).max(1);
        let mut previous: Option<HashMap<VariableId, Value>> = None;
        for iteration in 0..bound {
            let resolved = run_transfer_phase(slaves, connections, functions, function_bindings)?;
            let current: HashMap<VariableId, Value> = resolved.into_iter().collect();
            if let Some(prev) = &previous {
                if *prev == current {
                    log::debug!("initialization fixed point reached after {} iteration(s)", iteration + 1);
                    return Ok(());
                }
            }
            previous = Some(current);
        }
        log::warn!(
            "initialization did not reach a fixed point after {bound} iteration(s); proceeding anyway"
        );
        Ok(())
    }

    /// Runs one macro step at the scheduler's current time, following the
    /// five-step protocol: manipulator callbacks, slave dispatch, transfer
    /// phase, time advance, observer notification. Returns the indices
    /// that stepped and the new current time; a failed slave aborts the
    /// step and returns `Err(Error::SlaveError)` without advancing time.
    pub fn do_step(
        &mut self,
        slaves: &mut HashMap<SimulatorIndex, SlaveAdapter>,
        connections: &mut ConnectionGraph,
        manipulators: &mut ManipulatorPipeline,
        observers: &mut ObserverFanout,
        functions: &mut HashMap<FunctionIndex, Box<dyn FunctionInstance>>,
        function_bindings: &HashMap<FunctionIndex, FunctionBinding>,
    ) -> Result<StepOutcome> {
        let t = self.current_time;
        let n = self.step_index;

        // 1. step_commencing on every manipulator, in order.
        manipulators.step_commencing(t, slaves);

        // 2. Dispatch do_step to eligible slaves, possibly in parallel.
        let eligible: HashSet<SimulatorIndex> = slaves
            .keys()
            .copied()
            .filter(|idx| n % self.decimation_for(*idx) as u64 == 0)
            .collect();

        let mut dispatched: Vec<&mut SlaveAdapter> = slaves.values_mut().filter(|a| eligible.contains(&a.index)).collect();

        let base_step_size = self.config.base_step_size;
        let decimation = self.config.decimation.clone();
        let step_results: Vec<(SimulatorIndex, StepResult)> = dispatched
            .par_iter_mut()
            .map(|adapter| {
                let k = decimation.get(&adapter.index).copied().unwrap_or(1) as i64;
                let step_size = base_step_size
                    .checked_mul(k)
                    .unwrap_or_else(|| crate::error::precondition_fail("decimated step size overflowed i64 nanoseconds"));
                (adapter.index, adapter.do_step(t, step_size))
            })
            .collect();

        for (index, result) in &step_results {
            if *result == StepResult::Failed {
                log::warn!("slave {index:?} failed do_step at t={t:?}");
                return Err(Error::SlaveError {
                    simulator: *index,
                    message: "do_step returned failed".into(),
                });
            }
        }

        // 3. Transfer phase.
        run_transfer_phase(slaves, connections, functions, function_bindings)?;

        // 4. Advance time and step index.
        self.current_time = self.current_time + base_step_size;
        self.step_index += 1;

        // 5. Observer notifications: per-slave, then aggregate.
        for (index, _) in &step_results {
            if let Some(adapter) = slaves.get(index) {
                observers.notify_simulator_step_complete(*index, n, base_step_size, self.current_time, adapter);
            }
        }
        observers.notify_step_complete(n, base_step_size, self.current_time);

        log::info!("step {n} complete, t={:?}, stepped {}", self.current_time, step_results.len());

        Ok(StepOutcome {
            stepped: step_results.into_iter().map(|(i, _)| i).collect(),
            step_index: n,
            current_time: self.current_time,
        })
    }
}

fn read_slave_value(slaves: &HashMap<SimulatorIndex, SlaveAdapter>, id: VariableId, ty: VariableType) -> Value {
    let Some(adapter) = slaves.get(&id.simulator) else {
        return Value::zero_of(ty);
    };
    match ty {
        VariableType::Real => Value::Real(adapter.get_real(id.value_reference)),
        VariableType::Integer => Value::Integer(adapter.get_integer(id.value_reference)),
        VariableType::Boolean => Value::Boolean(adapter.get_boolean(id.value_reference)),
        VariableType::String => Value::String(adapter.get_string(id.value_reference)),
    }
}

fn write_slave_value(slaves: &mut HashMap<SimulatorIndex, SlaveAdapter>, id: VariableId, value: &Value) {
    let Some(adapter) = slaves.get_mut(&id.simulator) else {
        return;
    };
    match value {
        Value::Real(v) => adapter.set_real(id.value_reference, *v),
        Value::Integer(v) => adapter.set_integer(id.value_reference, *v),
        Value::Boolean(v) => adapter.set_boolean(id.value_reference, *v),
        Value::String(v) => adapter.set_string(id.value_reference, v.clone()),
    }
}

/// Runs one transfer phase: refresh every slave's exposed outputs, push
/// the latest readings into the connection graph, resolve every
/// connection and write its destination, then drive every bound function
/// instance (read its inputs from their source slaves, `calculate()`
/// exactly once, write its outputs to their destination slaves), and
/// finally flush every slave's pending-set buffers (running each ref's
/// manipulator chain). Functions run after connections so a function can
/// consume a value that arrived via a connection this same transfer, and
/// functions are visited in ascending `FunctionIndex` order so the result
/// is deterministic regardless of `HashMap` iteration order. Shared by
/// `do_step`'s transfer phase and `initialize`'s fixed-point loop.
/// Returns the resolved `(destination, value)` pairs, both
/// connection-driven and function-driven, so callers can check for
/// convergence.
pub(crate) fn run_transfer_phase(
    slaves: &mut HashMap<SimulatorIndex, SlaveAdapter>,
    connections: &mut ConnectionGraph,
    functions: &mut HashMap<FunctionIndex, Box<dyn FunctionInstance>>,
    function_bindings: &HashMap<FunctionIndex, FunctionBinding>,
) -> Result<Vec<(VariableId, Value)>> {
    for adapter in slaves.values_mut() {
        adapter.refresh_outputs();
    }

    let mut source_ids: Vec<(VariableId, VariableType)> = Vec::new();
    for conn in connections.connections() {
        let ty = conn.value_type();
        for src in conn.sources() {
            source_ids.push((src, ty));
        }
    }
    for (id, ty) in source_ids {
        let value = read_slave_value(slaves, id, ty);
        connections.set_source_value(id, value);
    }

    let mut resolved = connections.resolve_all()?;
    for (dest, value) in &resolved {
        write_slave_value(slaves, *dest, value);
    }

    let mut function_indices: Vec<FunctionIndex> = function_bindings.keys().copied().collect();
    function_indices.sort();
    for index in function_indices {
        let binding = &function_bindings[&index];
        let Some(instance) = functions.get_mut(&index) else {
            continue;
        };
        for (io_ref, source, ty) in &binding.inputs {
            match read_slave_value(slaves, *source, *ty) {
                Value::Real(v) => instance.set_real_io(*io_ref, v),
                Value::Integer(v) => instance.set_integer_io(*io_ref, v),
                _ => {}
            }
        }
        instance.calculate();
        for (io_ref, destination, ty) in &binding.outputs {
            let value = match ty {
                VariableType::Real => Value::Real(instance.get_real_io(*io_ref)),
                VariableType::Integer => Value::Integer(instance.get_integer_io(*io_ref)),
                VariableType::Boolean | VariableType::String => {
                    log::warn!("function {index:?} output at {io_ref:?} has unsupported type {ty:?}, skipping");
                    continue;
                }
            };
            write_slave_value(slaves, *destination, &value);
            resolved.push((*destination, value));
        }
    }

    for adapter in slaves.values_mut() {
        adapter.flush_pending_sets();
    }

    Ok(resolved)
}
