//! The manipulator pipeline: an ordered chain of input mutators
//! (scenario events and explicit overrides), notified before every step.

use std::collections::HashMap;

use crate::slave::SlaveAdapter;
use crate::time::{Duration, TimePoint};
use crate::variable::{SimulatorIndex, ValueReference};

/// A read/write view onto the slaves of an execution, given to
/// manipulators so they can install or remove input manipulators on any
/// slave during `step_commencing` without the manipulator module
/// depending on `Execution` itself.
pub trait SlaveDirectory {
    fn slave_mut(&mut self, index: SimulatorIndex) -> Option<&mut SlaveAdapter>;
}

impl SlaveDirectory for HashMap<SimulatorIndex, SlaveAdapter> {
    fn slave_mut(&mut self, index: SimulatorIndex) -> Option<&mut SlaveAdapter> {
        self.get_mut(&index)
    }
}

/// A participant that may react to simulator lifecycle events and mutate
/// slave inputs before a step runs.
pub trait Manipulator: Send {
    /// Called once, in pipeline order, when this manipulator is added to
    /// an execution. Used by [`ScenarioManager`] to capture its start
    /// time: scenario trigger times are relative to *load* time, not
    /// execution start.
    fn added_to_execution(&mut self, _time: TimePoint) {}

    fn simulator_added(&mut self, _index: SimulatorIndex, _time: TimePoint) {}

    fn simulator_removed(&mut self, _index: SimulatorIndex, _time: TimePoint) {}

    /// Called before `do_step` is dispatched to slaves. May install or
    /// remove input manipulators on any slave; those changes affect the
    /// step about to run.
    fn step_commencing(&mut self, current_time: TimePoint, directory: &mut dyn SlaveDirectory);
}

/// The ordered list of manipulators an execution drives.
#[derive(Default)]
pub struct ManipulatorPipeline {
    manipulators: Vec<Box<dyn Manipulator>>,
}

impl ManipulatorPipeline {
    pub fn new() -> Self {
        ManipulatorPipeline::default()
    }

    pub fn add(&mut self, mut manipulator: Box<dyn Manipulator>, now: TimePoint) {
        manipulator.added_to_execution(now);
        self.manipulators.push(manipulator);
    }

    pub fn notify_simulator_added(&mut self, index: SimulatorIndex, time: TimePoint) {
        for m in &mut self.manipulators {
            m.simulator_added(index, time);
        }
    }

    pub fn notify_simulator_removed(&mut self, index: SimulatorIndex, time: TimePoint) {
        for m in &mut self.manipulators {
            m.simulator_removed(index, time);
        }
    }

    /// Runs every manipulator's `step_commencing` in insertion order.
    pub fn step_commencing(&mut self, current_time: TimePoint, directory: &mut dyn SlaveDirectory) {
        for m in &mut self.manipulators {
            m.step_commencing(current_time, directory);
        }
    }

    pub fn len(&self) -> usize {
        self.manipulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manipulators.is_empty()
    }
}

/// A manipulator exposing direct, explicit overrides of slave inputs.
/// Overrides take effect immediately (replacing any prior override this
/// manipulator installed on the same ref) rather than waiting for the
/// next `step_commencing`, since nothing requires that deferral.
#[derive(Default)]
pub struct OverrideManipulator {
    active_reals: std::collections::HashSet<(SimulatorIndex, ValueReference)>,
    active_integers: std::collections::HashSet<(SimulatorIndex, ValueReference)>,
    active_booleans: std::collections::HashSet<(SimulatorIndex, ValueReference)>,
    active_strings: std::collections::HashSet<(SimulatorIndex, ValueReference)>,
}

impl OverrideManipulator {
    pub fn new() -> Self {
        OverrideManipulator::default()
    }

    pub fn override_real(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference, value: f64) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_real_input_manipulator(vr, None);
            slave.set_real_input_manipulator(vr, Some(Box::new(move |_| value)));
            self.active_reals.insert((sim, vr));
        }
    }

    pub fn clear_real(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_real_input_manipulator(vr, None);
        }
        self.active_reals.remove(&(sim, vr));
    }

    pub fn override_integer(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference, value: i32) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_integer_input_manipulator(vr, None);
            slave.set_integer_input_manipulator(vr, Some(Box::new(move |_| value)));
            self.active_integers.insert((sim, vr));
        }
    }

    pub fn clear_integer(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_integer_input_manipulator(vr, None);
        }
        self.active_integers.remove(&(sim, vr));
    }

    pub fn override_boolean(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference, value: bool) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_boolean_input_manipulator(vr, None);
            slave.set_boolean_input_manipulator(vr, Some(Box::new(move |_| value)));
            self.active_booleans.insert((sim, vr));
        }
    }

    pub fn clear_boolean(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_boolean_input_manipulator(vr, None);
        }
        self.active_booleans.remove(&(sim, vr));
    }

    pub fn override_string(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference, value: String) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_string_input_manipulator(vr, None);
            slave.set_string_input_manipulator(vr, Some(Box::new(move |_| value.clone())));
            self.active_strings.insert((sim, vr));
        }
    }

    pub fn clear_string(&mut self, directory: &mut dyn SlaveDirectory, sim: SimulatorIndex, vr: ValueReference) {
        if let Some(slave) = directory.slave_mut(sim) {
            slave.set_string_input_manipulator(vr, None);
        }
        self.active_strings.remove(&(sim, vr));
    }
}

impl Manipulator for OverrideManipulator {
    fn step_commencing(&mut self, _current_time: TimePoint, _directory: &mut dyn SlaveDirectory) {
        // Overrides are applied eagerly through the methods above; there is
        // nothing left to do at step boundaries.
    }
}

/// A scenario's target: what to set, and on which variable.
#[derive(Clone, Debug)]
pub enum Action {
    SetReal(f64),
    SetInteger(i32),
    SetBoolean(bool),
    SetString(String),
}

/// A single scheduled scenario event.
#[derive(Clone, Debug)]
pub struct ScenarioEvent {
    pub id: u64,
    /// Trigger time relative to the scenario's start time (the time at
    /// which the scenario was added/loaded, not execution start).
    pub trigger: Duration,
    pub simulator: SimulatorIndex,
    pub value_reference: ValueReference,
    pub action: Action,
}

/// Holds a set of time-stamped events and fires each at most once, in
/// ascending `(trigger, id)` order, once `current_time - start_time` has
/// reached its trigger.
pub struct ScenarioManager {
    start_time: Option<TimePoint>,
    pending: Vec<ScenarioEvent>,
    executed: Vec<ScenarioEvent>,
}

impl ScenarioManager {
    pub fn new(events: Vec<ScenarioEvent>) -> Self {
        let mut pending = events;
        pending.sort_by(|a, b| a.trigger.cmp(&b.trigger).then(a.id.cmp(&b.id)));
        ScenarioManager {
            start_time: None,
            pending,
            executed: Vec::new(),
        }
    }

    pub fn executed_events(&self) -> &[ScenarioEvent] {
        &self.executed
    }

    pub fn pending_events(&self) -> &[ScenarioEvent] {
        &self.pending
    }
}

impl Manipulator for ScenarioManager {
    fn added_to_execution(&mut self, time: TimePoint) {
        self.start_time = Some(time);
    }

    fn step_commencing(&mut self, current_time: TimePoint, directory: &mut dyn SlaveDirectory) {
        let Some(start_time) = self.start_time else {
            return;
        };
        let elapsed = current_time - start_time;
        let split = self.pending.partition_point(|e| e.trigger <= elapsed);
        let due: Vec<ScenarioEvent> = self.pending.drain(..split).collect();
        for event in due {
            if let Some(slave) = directory.slave_mut(event.simulator) {
                match &event.action {
                    Action::SetReal(v) => slave.set_real(event.value_reference, *v),
                    Action::SetInteger(v) => slave.set_integer(event.value_reference, *v),
                    Action::SetBoolean(v) => slave.set_boolean(event.value_reference, *v),
                    Action::SetString(v) => slave.set_string(event.value_reference, v.clone()),
                }
            } else {
                log::warn!(
                    "scenario event {} targets unknown or removed simulator {:?}",
                    event.id,
                    event.simulator
                );
            }
            self.executed.push(event);
        }
    }
}
