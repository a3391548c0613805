//! The execution driver: the public façade over the scheduler, slave
//! adapters, connection graph, function instances, manipulator pipeline,
//! and observer fanout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ExecutionConfig, SchedulerConfig};
use crate::connection::{Connection, ConnectionGraph};
use crate::error::{Error, Result};
use crate::function::{FunctionBinding, FunctionInstance, FunctionIoReference, FunctionType, FunctionTypeDescription};
use crate::manipulator::{Manipulator, ManipulatorPipeline};
use crate::observer::{Observer, ObserverFanout};
use crate::scheduler::{FixedStepScheduler, StepOutcome};
use crate::slave::{Slave, SlaveAdapter, StateHandle};
use crate::time::TimePoint;
use crate::variable::{FunctionIndex, SimulatorIndex, Value, VariableId, VariableType};

/// Coarse execution status, mirroring the `(current_time,
/// real_time_factor, state)` triple an out-of-scope C ABI would poll.
/// `real_time_factor` is omitted: real-time pacing is only an extension
/// point, never computed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Stopped,
    Running,
    Error,
}

/// The outcome of a `simulate_until` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SimulationOutcome {
    Completed { current_time: TimePoint },
    Canceled { current_time: TimePoint },
}

/// A whole-execution snapshot: scheduler time, every save-state-capable
/// slave's handle, and the connection graph's source-value buffer. Held
/// behind a [`StateHandle`] so it shares the same opaque,
/// reference-counted contract as per-slave state.
struct ExecutionSnapshot {
    current_time: TimePoint,
    step_index: u64,
    slave_states: HashMap<SimulatorIndex, StateHandle>,
    source_values: HashMap<VariableId, Value>,
}

/// The public façade: owns every other component and exposes the
/// operations an embedding application (or a CLI front-end) drives.
pub struct Execution {
    scheduler: FixedStepScheduler,
    slaves: HashMap<SimulatorIndex, SlaveAdapter>,
    next_simulator_index: usize,
    functions: HashMap<FunctionIndex, Box<dyn FunctionInstance>>,
    next_function_index: usize,
    function_descriptions: HashMap<FunctionIndex, FunctionTypeDescription>,
    function_bindings: HashMap<FunctionIndex, FunctionBinding>,
    /// Destinations already claimed by a function output, checked by
    /// `connect_variables` so a connection can't also drive the same
    /// destination (mirrors `ConnectionGraph`'s own duplicate-driver
    /// rejection, extended across the two wiring mechanisms).
    function_bound_destinations: HashSet<VariableId>,
    connections: ConnectionGraph,
    manipulators: ManipulatorPipeline,
    observers: ObserverFanout,
    initial_values: HashMap<VariableId, Value>,
    state: ExecutionState,
    /// Slaves added after `setup()` has already run; they receive their
    /// own deferred `setup`/`start_simulation` at the next step boundary.
    pending_setup: Vec<SimulatorIndex>,
    /// Scalar connections carried by `ExecutionConfig`, applied the first
    /// time stepping is requested, once every slave named in `new`'s
    /// config has actually been added (the config is a builder, not a
    /// constructor argument slaves must pre-exist for).
    pending_scalar_connections: Vec<(VariableId, VariableId)>,
    start_time: TimePoint,
    stop_time: Option<TimePoint>,
    setup_done: bool,
    cancel: Arc<AtomicBool>,
}

impl Execution {
    pub fn new(config: ExecutionConfig, scheduler_config: SchedulerConfig) -> Self {
        Execution {
            scheduler: FixedStepScheduler::new(scheduler_config),
            slaves: HashMap::new(),
            next_simulator_index: 0,
            functions: HashMap::new(),
            next_function_index: 0,
            function_descriptions: HashMap::new(),
            function_bindings: HashMap::new(),
            function_bound_destinations: HashSet::new(),
            connections: ConnectionGraph::new(),
            manipulators: ManipulatorPipeline::new(),
            observers: ObserverFanout::new(),
            initial_values: config.initial_values,
            state: ExecutionState::Stopped,
            pending_setup: Vec::new(),
            pending_scalar_connections: config.scalar_connections,
            start_time: config.start_time,
            stop_time: config.stop_time,
            setup_done: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wires every scalar connection named in the construction-time
    /// config, inferring each one's common type from its source
    /// variable's description. Called automatically before the first
    /// step; safe to call again afterward (a no-op once drained).
    pub fn apply_config_scalar_connections(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_scalar_connections);
        for (source, destination) in pending {
            let value_type = self
                .slaves
                .get(&source.simulator)
                .and_then(|a| a.model_description().variable(source.value_reference))
                .map(|d| d.variable_type)
                .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown variable {source:?}")))?;
            self.connect_variables(Connection::Scalar {
                source,
                destination,
                value_type,
            })?;
        }
        Ok(())
    }

    pub fn status(&self) -> ExecutionState {
        self.state
    }

    pub fn current_time(&self) -> TimePoint {
        self.scheduler.current_time()
    }

    /// Clears an `error` state so stepping may resume; the execution
    /// otherwise refuses further stepping until reset.
    pub fn reset(&mut self) {
        if self.state == ExecutionState::Error {
            self.state = if self.setup_done {
                ExecutionState::Running
            } else {
                ExecutionState::Stopped
            };
        }
    }

    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop_request(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn add_slave(&mut self, slave: Box<dyn Slave>) -> SimulatorIndex {
        let index = SimulatorIndex(self.next_simulator_index);
        self.next_simulator_index += 1;
        self.slaves.insert(index, SlaveAdapter::new(index, slave));
        if self.setup_done {
            self.pending_setup.push(index);
        }
        let now = self.scheduler.current_time();
        self.manipulators.notify_simulator_added(index, now);
        self.observers.notify_simulator_added(index);
        log::debug!("added slave {index:?}");
        index
    }

    /// Removes a slave, dropping every connection that touches it and
    /// notifying observers.
    pub fn remove_slave(&mut self, index: SimulatorIndex) -> Result<()> {
        self.slaves
            .remove(&index)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("no such simulator {index:?}")))?;
        self.connections.remove_connections_touching(index);
        self.pending_setup.retain(|i| *i != index);
        let now = self.scheduler.current_time();
        self.manipulators.notify_simulator_removed(index, now);
        self.observers.notify_simulator_removed(index);
        log::debug!("removed slave {index:?}");
        Ok(())
    }

    pub fn model_description(&self, index: SimulatorIndex) -> Option<&crate::model::ModelDescription> {
        self.slaves.get(&index).map(|a| a.model_description())
    }

    /// Instantiates a function type against `parameters`, validating
    /// bounds and resolving any parameter-driven IO group sizes.
    pub fn add_function(&mut self, function_type: &dyn FunctionType, parameters: &HashMap<usize, f64>) -> Result<FunctionIndex> {
        let instance = function_type.instantiate(parameters)?;
        let index = FunctionIndex(self.next_function_index);
        self.next_function_index += 1;
        self.functions.insert(index, instance);
        self.function_descriptions.insert(index, function_type.description().clone());
        self.function_bindings.insert(index, FunctionBinding::default());
        Ok(index)
    }

    pub fn function_mut(&mut self, index: FunctionIndex) -> Option<&mut dyn FunctionInstance> {
        self.functions.get_mut(&index).map(|f| f.as_mut())
    }

    fn function_io_type(&self, function: FunctionIndex, io: FunctionIoReference) -> Result<VariableType> {
        let description = self
            .function_descriptions
            .get(&function)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown function {function:?}")))?;
        let group = description
            .io_groups
            .get(io.group)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("function {function:?} has no IO group {}", io.group)))?;
        let io_descr = group
            .ios
            .get(io.io)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("function {function:?} group {} has no IO {}", io.group, io.io)))?;
        Ok(io_descr.value_type)
    }

    /// Binds a source variable to a function instance's input: every
    /// transfer phase, the source's current value is set onto that input
    /// before `calculate()` runs. The source must be an output-like
    /// endpoint, mirroring `connect_variables`'s own source check.
    pub fn connect_function_input(&mut self, function: FunctionIndex, io: FunctionIoReference, source: VariableId) -> Result<()> {
        let value_type = self.function_io_type(function, io)?;
        self.check_endpoint(source, value_type, true)?;
        let binding = self
            .function_bindings
            .get_mut(&function)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown function {function:?}")))?;
        binding.inputs.push((io, source, value_type));
        if let Some(adapter) = self.slaves.get_mut(&source.simulator) {
            adapter.expose_for_getting(value_type, source.value_reference);
        }
        Ok(())
    }

    /// Binds a function instance's output to a destination variable: every
    /// transfer phase, after `calculate()` runs, the output's value is
    /// written to that destination. The destination must be input-like and
    /// not already driven by a connection or another function output.
    pub fn connect_function_output(&mut self, function: FunctionIndex, io: FunctionIoReference, destination: VariableId) -> Result<()> {
        let value_type = self.function_io_type(function, io)?;
        self.check_endpoint(destination, value_type, false)?;
        if self.connections.is_destination_connected(destination) || self.function_bound_destinations.contains(&destination) {
            return Err(Error::InvalidSystemStructure(format!("{destination:?} already has a driver")));
        }
        let binding = self
            .function_bindings
            .get_mut(&function)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown function {function:?}")))?;
        binding.outputs.push((io, destination, value_type));
        self.function_bound_destinations.insert(destination);
        if let Some(adapter) = self.slaves.get_mut(&destination.simulator) {
            adapter.expose_for_setting(value_type, destination.value_reference);
        }
        self.observers.notify_variables_connected(destination);
        Ok(())
    }

    /// Wires a connection after validating that every source is an
    /// output-like endpoint of the connection's type, and every
    /// destination is input-like of the same type, exposing each endpoint
    /// for getting/setting as it goes.
    pub fn connect_variables(&mut self, connection: Connection) -> Result<()> {
        let value_type = connection.value_type();
        let sources = connection.sources();
        let destinations = connection.destinations();

        for source in &sources {
            self.check_endpoint(*source, value_type, true)?;
        }
        for destination in &destinations {
            self.check_endpoint(*destination, value_type, false)?;
            if self.function_bound_destinations.contains(destination) {
                return Err(Error::InvalidSystemStructure(format!("{destination:?} already has a driver")));
            }
        }

        self.connections.add_connection(connection)?;

        for source in sources {
            if let Some(adapter) = self.slaves.get_mut(&source.simulator) {
                adapter.expose_for_getting(value_type, source.value_reference);
            }
        }
        for destination in destinations {
            if let Some(adapter) = self.slaves.get_mut(&destination.simulator) {
                adapter.expose_for_setting(value_type, destination.value_reference);
            }
            self.observers.notify_variables_connected(destination);
        }
        Ok(())
    }

    fn check_endpoint(&self, id: VariableId, expected_type: VariableType, as_source: bool) -> Result<()> {
        let adapter = self
            .slaves
            .get(&id.simulator)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown simulator {:?}", id.simulator)))?;
        let descr = adapter
            .model_description()
            .variable(id.value_reference)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown variable {id:?}")))?;
        if descr.variable_type != expected_type {
            return Err(Error::InvalidSystemStructure(format!(
                "{id:?} has type {:?} but the connection expects {:?}",
                descr.variable_type, expected_type
            )));
        }
        let ok = if as_source {
            descr.causality.is_output_like()
        } else {
            descr.causality.is_input_like()
        };
        if !ok {
            let role = if as_source { "a connection source" } else { "a connection destination" };
            return Err(Error::InvalidSystemStructure(format!("{id:?} cannot be used as {role}")));
        }
        Ok(())
    }

    /// Exposes a variable for reading without wiring it into a connection,
    /// so observers and direct queries can see it refreshed every step:
    /// observers read through the adapter, which only refreshes refs that
    /// have been exposed for getting.
    pub fn expose_for_observation(&mut self, variable: VariableId) -> Result<()> {
        let adapter = self
            .slaves
            .get_mut(&variable.simulator)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown simulator {:?}", variable.simulator)))?;
        let value_type = adapter
            .model_description()
            .variable(variable.value_reference)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown variable {variable:?}")))?
            .variable_type;
        adapter.expose_for_getting(value_type, variable.value_reference);
        Ok(())
    }

    pub fn disconnect_variable(&mut self, destination: VariableId) -> Result<()> {
        self.connections
            .disconnect(destination)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("{destination:?} is not connected")))?;
        self.observers.notify_variable_disconnected(destination);
        Ok(())
    }

    pub fn set_real_initial_value(&mut self, variable: VariableId, value: f64) -> Result<()> {
        self.set_initial_value(variable, Value::Real(value))
    }
    pub fn set_integer_initial_value(&mut self, variable: VariableId, value: i32) -> Result<()> {
        self.set_initial_value(variable, Value::Integer(value))
    }
    pub fn set_boolean_initial_value(&mut self, variable: VariableId, value: bool) -> Result<()> {
        self.set_initial_value(variable, Value::Boolean(value))
    }
    pub fn set_string_initial_value(&mut self, variable: VariableId, value: String) -> Result<()> {
        self.set_initial_value(variable, Value::String(value))
    }

    /// Stores an initial value to be applied between `setup` and the
    /// initialization fixed-point. Must target a `parameter`,
    /// `calculated_parameter`, or `input` variable.
    fn set_initial_value(&mut self, variable: VariableId, value: Value) -> Result<()> {
        let adapter = self
            .slaves
            .get(&variable.simulator)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown simulator {:?}", variable.simulator)))?;
        let descr = adapter
            .model_description()
            .variable(variable.value_reference)
            .ok_or_else(|| Error::InvalidSystemStructure(format!("unknown variable {variable:?}")))?;
        if !descr.causality.accepts_initial_value() {
            return Err(Error::InvalidSystemStructure(format!(
                "{variable:?} has causality {:?}, which does not accept an initial value",
                descr.causality
            )));
        }
        if descr.variable_type != value.variable_type() {
            return Err(Error::InvalidSystemStructure(format!(
                "{variable:?} has type {:?} but the initial value is {:?}",
                descr.variable_type,
                value.variable_type()
            )));
        }
        self.initial_values.insert(variable, value);
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.add(observer);
    }

    pub fn add_manipulator(&mut self, manipulator: Box<dyn Manipulator>) {
        self.manipulators.add(manipulator, self.scheduler.current_time());
    }

    /// Runs `setup`, applies initial values, and runs the initialization
    /// fixed-point exactly once, the first time stepping is requested.
    /// Slaves added afterward instead get a deferred `setup` here.
    fn ensure_initialized(&mut self) -> Result<()> {
        if self.setup_done {
            if !self.pending_setup.is_empty() {
                let pending = std::mem::take(&mut self.pending_setup);
                for index in pending {
                    if let Some(adapter) = self.slaves.get_mut(&index) {
                        adapter.setup(self.scheduler.current_time(), self.stop_time, None)?;
                        adapter.start_simulation()?;
                    }
                }
            }
            return Ok(());
        }
        self.apply_config_scalar_connections()?;
        self.scheduler.setup(&mut self.slaves, self.start_time, self.stop_time, None)?;
        self.apply_initial_values()?;
        self.scheduler
            .initialize(&mut self.slaves, &mut self.connections, &mut self.functions, &self.function_bindings)?;
        self.setup_done = true;
        self.state = ExecutionState::Running;
        self.observers.notify_simulation_initialized(0, self.start_time);
        Ok(())
    }

    fn apply_initial_values(&mut self) -> Result<()> {
        let values = std::mem::take(&mut self.initial_values);
        for (variable, value) in &values {
            if let Some(adapter) = self.slaves.get_mut(&variable.simulator) {
                match value {
                    Value::Real(v) => adapter.set_real(variable.value_reference, *v),
                    Value::Integer(v) => adapter.set_integer(variable.value_reference, *v),
                    Value::Boolean(v) => adapter.set_boolean(variable.value_reference, *v),
                    Value::String(v) => adapter.set_string(variable.value_reference, v.clone()),
                }
            }
        }
        self.initial_values = values;
        for adapter in self.slaves.values_mut() {
            adapter.flush_pending_sets();
        }
        Ok(())
    }

    /// Runs one macro step. Refuses if the execution is in the error
    /// state; a slave failure transitions it there.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state == ExecutionState::Error {
            return Err(Error::ExecutionInErrorState);
        }
        self.ensure_initialized()?;
        match self.scheduler.do_step(
            &mut self.slaves,
            &mut self.connections,
            &mut self.manipulators,
            &mut self.observers,
            &mut self.functions,
            &self.function_bindings,
        ) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.state = ExecutionState::Error;
                Err(err)
            }
        }
    }

    /// Steps until `stop` is reached, checking the cancellation flag
    /// between macro steps.
    pub fn simulate_until(&mut self, stop: TimePoint) -> Result<SimulationOutcome> {
        self.ensure_initialized()?;
        while self.scheduler.current_time() < stop {
            if self.cancel.load(Ordering::SeqCst) {
                log::info!("simulate_until canceled at t={:?}", self.scheduler.current_time());
                return Ok(SimulationOutcome::Canceled {
                    current_time: self.scheduler.current_time(),
                });
            }
            self.step()?;
        }
        Ok(SimulationOutcome::Completed {
            current_time: self.scheduler.current_time(),
        })
    }

    /// Snapshots scheduler time, every save-capable slave's state, and
    /// the connection graph's source-value buffer.
    pub fn save_state(&mut self) -> Result<StateHandle> {
        let mut slave_states = HashMap::new();
        for (index, adapter) in self.slaves.iter_mut() {
            if adapter.can_save_state() {
                slave_states.insert(*index, adapter.save_state()?);
            }
        }
        let snapshot = ExecutionSnapshot {
            current_time: self.scheduler.current_time(),
            step_index: self.scheduler.step_index(),
            slave_states,
            source_values: self.connections.snapshot_sources(),
        };
        log::debug!("saved execution state at t={:?}, step={}", snapshot.current_time, snapshot.step_index);
        Ok(StateHandle::new(snapshot))
    }

    pub fn restore_state(&mut self, handle: &StateHandle) -> Result<()> {
        let snapshot = handle
            .downcast_ref::<ExecutionSnapshot>()
            .ok_or_else(|| Error::InvalidSystemStructure("state handle does not belong to an Execution".into()))?;
        for (index, state) in &snapshot.slave_states {
            if let Some(adapter) = self.slaves.get_mut(index) {
                adapter.restore_state(state)?;
            }
        }
        self.connections.restore_sources(snapshot.source_values.clone());
        self.scheduler.restore_time(snapshot.current_time, snapshot.step_index);
        self.state = ExecutionState::Running;
        self.observers.notify_state_restored(snapshot.step_index, snapshot.current_time);
        log::debug!("restored execution state to t={:?}, step={}", snapshot.current_time, snapshot.step_index);
        Ok(())
    }

    pub fn release_state(&mut self, handle: StateHandle) -> Result<()> {
        if let Some(snapshot) = handle.downcast_ref::<ExecutionSnapshot>() {
            for (index, state) in snapshot.slave_states.clone() {
                if let Some(adapter) = self.slaves.get_mut(&index) {
                    adapter.release_state(state)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::model::ModelDescription;
    use crate::slave::StepResult;
    use crate::time::Duration;
    use crate::variable::{Causality, Value, ValueReference, VariableDescription, VariableType, Variability};

    struct EchoSlave {
        descr: ModelDescription,
        x: f64,
        y: f64,
    }

    impl EchoSlave {
        fn new(name: &str) -> Self {
            EchoSlave {
                descr: ModelDescription {
                    uuid: name.into(),
                    name: name.into(),
                    variables: vec![
                        VariableDescription {
                            name: "x".into(),
                            value_reference: ValueReference(0),
                            variable_type: VariableType::Real,
                            causality: Causality::Input,
                            variability: Variability::Continuous,
                        },
                        VariableDescription {
                            name: "y".into(),
                            value_reference: ValueReference(1),
                            variable_type: VariableType::Real,
                            causality: Causality::Output,
                            variability: Variability::Continuous,
                        },
                    ],
                    can_save_state: false,
                },
                x: 0.0,
                y: 0.0,
            }
        }
    }

    impl Slave for EchoSlave {
        fn model_description(&self) -> &ModelDescription {
            &self.descr
        }
        fn setup(&mut self, _: TimePoint, _: Option<TimePoint>, _: Option<f64>) -> Result<()> {
            Ok(())
        }
        fn start_simulation(&mut self) -> Result<()> {
            Ok(())
        }
        fn end_simulation(&mut self) -> Result<()> {
            Ok(())
        }
        fn do_step(&mut self, _: TimePoint, _: Duration) -> StepResult {
            self.y = self.x;
            StepResult::Complete
        }
        fn get_real_variables(&self, refs: &[ValueReference], out: &mut [f64]) {
            for (r, o) in refs.iter().zip(out.iter_mut()) {
                *o = if r.0 == 1 { self.y } else { self.x };
            }
        }
        fn get_integer_variables(&self, _: &[ValueReference], _: &mut [i32]) {}
        fn get_boolean_variables(&self, _: &[ValueReference], _: &mut [bool]) {}
        fn get_string_variables(&self, _: &[ValueReference], _: &mut [String]) {}
        fn set_real_variables(&mut self, refs: &[ValueReference], values: &[f64]) {
            for (r, v) in refs.iter().zip(values.iter()) {
                if r.0 == 0 {
                    self.x = *v;
                }
            }
        }
        fn set_integer_variables(&mut self, _: &[ValueReference], _: &[i32]) {}
        fn set_boolean_variables(&mut self, _: &[ValueReference], _: &[bool]) {}
        fn set_string_variables(&mut self, _: &[ValueReference], _: &[String]) {}
    }

    fn new_execution() -> Execution {
        Execution::new(
            ExecutionConfig::new(TimePoint::EPOCH),
            SchedulerConfig::new(Duration::from_nanos(100_000_000)),
        )
    }

    /// Identity chain: A's output reaches B's input and propagates
    /// through B's own identity to B's output.
    #[test]
    fn identity_chain_delivers_the_initial_value_from_step_one_onward() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct CapturingObserver {
            target: SimulatorIndex,
            last_b_y: Arc<Mutex<Option<f64>>>,
        }
        impl Observer for CapturingObserver {
            fn simulator_step_complete(
                &mut self,
                index: SimulatorIndex,
                _last_step: u64,
                _step_size: Duration,
                _current_time: TimePoint,
                adapter: &SlaveAdapter,
            ) {
                if index == self.target {
                    *self.last_b_y.lock().unwrap() = Some(adapter.get_real(ValueReference(1)));
                }
            }
        }

        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let b = execution.add_slave(Box::new(EchoSlave::new("B")));
        execution
            .connect_variables(Connection::Scalar {
                source: VariableId::new(a, ValueReference(1)),
                destination: VariableId::new(b, ValueReference(0)),
                value_type: VariableType::Real,
            })
            .unwrap();
        execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 5.0).unwrap();
        execution.expose_for_observation(VariableId::new(b, ValueReference(1))).unwrap();

        let capture = CapturingObserver {
            target: b,
            last_b_y: Arc::new(Mutex::new(None)),
        };
        execution.add_observer(Box::new(capture.clone()));

        for _ in 0..3 {
            execution.step().unwrap();
        }
        assert_eq!(*capture.last_b_y.lock().unwrap(), Some(5.0));
    }

    /// A function instance bound between two slaves scales its source's
    /// value into its destination every transfer, same as a connection
    /// would, but via `calculate()` rather than identity/linear-transform
    /// resolution.
    #[test]
    fn bound_gain_function_scales_source_into_destination_every_transfer() {
        use crate::function::{FunctionIoReference, GainFunctionType};

        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let b = execution.add_slave(Box::new(EchoSlave::new("B")));

        let gain = GainFunctionType::new(0.0, 10.0);
        let mut params = HashMap::new();
        params.insert(0, 3.0);
        let function = execution.add_function(&gain, &params).unwrap();

        execution
            .connect_function_input(function, FunctionIoReference::new(0, 0, 0), VariableId::new(a, ValueReference(1)))
            .unwrap();
        execution
            .connect_function_output(function, FunctionIoReference::new(0, 0, 1), VariableId::new(b, ValueReference(0)))
            .unwrap();

        execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 2.0).unwrap();
        execution.expose_for_observation(VariableId::new(b, ValueReference(1))).unwrap();

        for _ in 0..3 {
            execution.step().unwrap();
        }
        assert_eq!(execution.slaves.get(&b).unwrap().get_real(ValueReference(1)), 6.0);
    }

    #[test]
    fn a_function_output_cannot_also_be_driven_by_a_connection() {
        use crate::function::{FunctionIoReference, GainFunctionType};

        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let b = execution.add_slave(Box::new(EchoSlave::new("B")));

        let gain = GainFunctionType::new(0.0, 10.0);
        let function = execution.add_function(&gain, &HashMap::new()).unwrap();
        execution
            .connect_function_input(function, FunctionIoReference::new(0, 0, 0), VariableId::new(a, ValueReference(1)))
            .unwrap();
        execution
            .connect_function_output(function, FunctionIoReference::new(0, 0, 1), VariableId::new(b, ValueReference(0)))
            .unwrap();

        let err = execution
            .connect_variables(Connection::Scalar {
                source: VariableId::new(a, ValueReference(1)),
                destination: VariableId::new(b, ValueReference(0)),
                value_type: VariableType::Real,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSystemStructure(_)));
    }

    #[test]
    fn connecting_an_input_variable_as_a_source_is_rejected() {
        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let b = execution.add_slave(Box::new(EchoSlave::new("B")));
        let err = execution
            .connect_variables(Connection::Scalar {
                source: VariableId::new(a, ValueReference(0)), // x is an input, not output
                destination: VariableId::new(b, ValueReference(0)),
                value_type: VariableType::Real,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSystemStructure(_)));
    }

    #[test]
    fn slave_failure_moves_the_execution_into_the_error_state_and_blocks_further_steps() {
        struct FailingSlave {
            descr: ModelDescription,
        }
        impl Slave for FailingSlave {
            fn model_description(&self) -> &ModelDescription {
                &self.descr
            }
            fn setup(&mut self, _: TimePoint, _: Option<TimePoint>, _: Option<f64>) -> Result<()> {
                Ok(())
            }
            fn start_simulation(&mut self) -> Result<()> {
                Ok(())
            }
            fn end_simulation(&mut self) -> Result<()> {
                Ok(())
            }
            fn do_step(&mut self, _: TimePoint, _: Duration) -> StepResult {
                StepResult::Failed
            }
            fn get_real_variables(&self, _: &[ValueReference], _: &mut [f64]) {}
            fn get_integer_variables(&self, _: &[ValueReference], _: &mut [i32]) {}
            fn get_boolean_variables(&self, _: &[ValueReference], _: &mut [bool]) {}
            fn get_string_variables(&self, _: &[ValueReference], _: &mut [String]) {}
            fn set_real_variables(&mut self, _: &[ValueReference], _: &[f64]) {}
            fn set_integer_variables(&mut self, _: &[ValueReference], _: &[i32]) {}
            fn set_boolean_variables(&mut self, _: &[ValueReference], _: &[bool]) {}
            fn set_string_variables(&mut self, _: &[ValueReference], _: &[String]) {}
        }

        let mut execution = new_execution();
        execution.add_slave(Box::new(FailingSlave {
            descr: ModelDescription {
                uuid: "fail".into(),
                name: "fail".into(),
                variables: vec![],
                can_save_state: false,
            },
        }));
        assert!(execution.step().is_err());
        assert_eq!(execution.status(), ExecutionState::Error);
        assert!(matches!(execution.step(), Err(Error::ExecutionInErrorState)));
        execution.reset();
        assert_eq!(execution.status(), ExecutionState::Running);
    }

    #[test]
    fn removing_a_slave_drops_its_connections_without_erroring_the_next_step() {
        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let b = execution.add_slave(Box::new(EchoSlave::new("B")));
        execution
            .connect_variables(Connection::Scalar {
                source: VariableId::new(a, ValueReference(1)),
                destination: VariableId::new(b, ValueReference(0)),
                value_type: VariableType::Real,
            })
            .unwrap();
        execution.step().unwrap();
        execution.remove_slave(a).unwrap();
        execution.step().unwrap();
        assert_eq!(execution.status(), ExecutionState::Running);
    }

    /// Save/restore: after restoring a snapshot taken at step k, the next
    /// two steps reproduce the values that were originally produced at
    /// steps k+1 and k+2 for a deterministic slave.
    #[test]
    fn save_and_restore_reproduces_subsequent_step_values() {
        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.0).unwrap();

        execution.step().unwrap(); // step 1, t=0.1
        execution.step().unwrap(); // step 2, t=0.2
        let handle = execution.save_state().unwrap();

        execution.step().unwrap(); // step 3, t=0.3 (original)
        let original_t3 = execution.current_time();
        execution.step().unwrap(); // step 4, t=0.4 (original)
        let original_t4 = execution.current_time();

        execution.restore_state(&handle).unwrap();
        assert_eq!(execution.current_time(), TimePoint::from_nanos(200_000_000));

        execution.step().unwrap();
        assert_eq!(execution.current_time(), original_t3);
        execution.step().unwrap();
        assert_eq!(execution.current_time(), original_t4);
    }

    #[test]
    fn observer_fanout_sees_step_complete_without_mutating_slaves() {
        use crate::observer::{LastValueObserver, Observer};
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct CountingObserver(Arc<Mutex<u64>>);
        impl Observer for CountingObserver {
            fn step_complete(&mut self, _last_step: u64, _step_size: Duration, _current_time: TimePoint) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let mut execution = new_execution();
        let a = execution.add_slave(Box::new(EchoSlave::new("A")));
        let counter = CountingObserver::default();
        execution.add_observer(Box::new(counter.clone()));
        execution.expose_for_observation(VariableId::new(a, ValueReference(1))).unwrap();
        let mut last_value = LastValueObserver::new();
        last_value.watch(a, ValueReference(1), VariableType::Real);
        execution.add_observer(Box::new(last_value));

        execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 3.0).unwrap();
        for _ in 0..3 {
            execution.step().unwrap();
        }
        assert_eq!(*counter.0.lock().unwrap(), 3);
    }
}
