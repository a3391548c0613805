//! In-process mock slaves for exercising `quillum` against its testable
//! properties without a real FMU binding. Every slave in this crate
//! implements [`quillum::slave::Slave`] directly; none of it loads a
//! model description from a file, which stays an external collaborator's
//! job.
//!
//! The fixtures here generalize the small ad-hoc test doubles that
//! `quillum`'s own unit tests build inline (`EchoSlave`,
//! `ConstantOutputSlave`, `RecordingSlave`) into one reusable,
//! closure-driven [`MockSlave`], so integration tests can compose a
//! multi-slave scenario without hand-rolling a new `Slave` impl per test.

use std::collections::HashMap;

use quillum::model::ModelDescription;
use quillum::slave::{Slave, StateHandle, StepResult};
use quillum::time::{Duration, TimePoint};
use quillum::variable::{Causality, ValueReference, Variability, VariableDescription, VariableType};
use quillum::Result;

/// The mutable state handed to a [`MockSlave`]'s step closure: its typed
/// variable tables, plus the `do_step` arguments. The closure reads and
/// writes the tables directly; `MockSlave` takes care of exposing them
/// through the `Slave` trait's `get_*_variables`/`set_*_variables` calls.
pub struct MockState<'a> {
    pub reals: &'a mut HashMap<ValueReference, f64>,
    pub integers: &'a mut HashMap<ValueReference, i32>,
    pub booleans: &'a mut HashMap<ValueReference, bool>,
    pub strings: &'a mut HashMap<ValueReference, String>,
    pub current_time: TimePoint,
    pub step_size: Duration,
}

type StepFn = Box<dyn FnMut(&mut MockState) -> StepResult + Send>;

#[derive(Clone)]
struct MockSnapshot {
    reals: HashMap<ValueReference, f64>,
    integers: HashMap<ValueReference, i32>,
    booleans: HashMap<ValueReference, bool>,
    strings: HashMap<ValueReference, String>,
}

/// A configurable in-process slave: a [`ModelDescription`] plus typed
/// variable tables and a user-supplied `do_step` closure. Construct one
/// with [`MockSlaveBuilder`].
pub struct MockSlave {
    descr: ModelDescription,
    reals: HashMap<ValueReference, f64>,
    integers: HashMap<ValueReference, i32>,
    booleans: HashMap<ValueReference, bool>,
    strings: HashMap<ValueReference, String>,
    step: StepFn,
    can_save_state: bool,
}

impl Slave for MockSlave {
    fn model_description(&self) -> &ModelDescription {
        &self.descr
    }

    fn setup(&mut self, _start: TimePoint, _stop: Option<TimePoint>, _tolerance: Option<f64>) -> Result<()> {
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_simulation(&mut self) -> Result<()> {
        Ok(())
    }

    fn do_step(&mut self, current_time: TimePoint, step_size: Duration) -> StepResult {
        let mut state = MockState {
            reals: &mut self.reals,
            integers: &mut self.integers,
            booleans: &mut self.booleans,
            strings: &mut self.strings,
            current_time,
            step_size,
        };
        (self.step)(&mut state)
    }

    fn get_real_variables(&self, refs: &[ValueReference], out: &mut [f64]) {
        for (r, o) in refs.iter().zip(out.iter_mut()) {
            *o = self.reals.get(r).copied().unwrap_or(0.0);
        }
    }
    fn get_integer_variables(&self, refs: &[ValueReference], out: &mut [i32]) {
        for (r, o) in refs.iter().zip(out.iter_mut()) {
            *o = self.integers.get(r).copied().unwrap_or(0);
        }
    }
    fn get_boolean_variables(&self, refs: &[ValueReference], out: &mut [bool]) {
        for (r, o) in refs.iter().zip(out.iter_mut()) {
            *o = self.booleans.get(r).copied().unwrap_or(false);
        }
    }
    fn get_string_variables(&self, refs: &[ValueReference], out: &mut [String]) {
        for (r, o) in refs.iter().zip(out.iter_mut()) {
            *o = self.strings.get(r).cloned().unwrap_or_default();
        }
    }

    fn set_real_variables(&mut self, refs: &[ValueReference], values: &[f64]) {
        for (r, v) in refs.iter().zip(values) {
            self.reals.insert(*r, *v);
        }
    }
    fn set_integer_variables(&mut self, refs: &[ValueReference], values: &[i32]) {
        for (r, v) in refs.iter().zip(values) {
            self.integers.insert(*r, *v);
        }
    }
    fn set_boolean_variables(&mut self, refs: &[ValueReference], values: &[bool]) {
        for (r, v) in refs.iter().zip(values) {
            self.booleans.insert(*r, *v);
        }
    }
    fn set_string_variables(&mut self, refs: &[ValueReference], values: &[String]) {
        for (r, v) in refs.iter().zip(values) {
            self.strings.insert(*r, v.clone());
        }
    }

    fn save_state(&mut self) -> Result<StateHandle> {
        if !self.can_save_state {
            return Slave::save_state(&mut NoopSlave);
        }
        Ok(StateHandle::new(MockSnapshot {
            reals: self.reals.clone(),
            integers: self.integers.clone(),
            booleans: self.booleans.clone(),
            strings: self.strings.clone(),
        }))
    }

    fn restore_state(&mut self, handle: &StateHandle) -> Result<()> {
        if !self.can_save_state {
            return Slave::restore_state(&mut NoopSlave, handle);
        }
        let snapshot = handle
            .downcast_ref::<MockSnapshot>()
            .expect("state handle belongs to a different MockSlave");
        self.reals = snapshot.reals.clone();
        self.integers = snapshot.integers.clone();
        self.booleans = snapshot.booleans.clone();
        self.strings = snapshot.strings.clone();
        Ok(())
    }
}

/// A dummy slave that only exists to borrow `Slave`'s default
/// `unsupported_feature` error bodies for [`MockSlave`] when
/// `can_save_state` is false, instead of duplicating the error
/// construction here.
struct NoopSlave;
impl Slave for NoopSlave {
    fn model_description(&self) -> &ModelDescription {
        unreachable!()
    }
    fn setup(&mut self, _: TimePoint, _: Option<TimePoint>, _: Option<f64>) -> Result<()> {
        unreachable!()
    }
    fn start_simulation(&mut self) -> Result<()> {
        unreachable!()
    }
    fn end_simulation(&mut self) -> Result<()> {
        unreachable!()
    }
    fn do_step(&mut self, _: TimePoint, _: Duration) -> StepResult {
        unreachable!()
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

/// Builds a [`MockSlave`] one variable at a time.
pub struct MockSlaveBuilder {
    uuid: String,
    name: String,
    variables: Vec<VariableDescription>,
    reals: HashMap<ValueReference, f64>,
    integers: HashMap<ValueReference, i32>,
    booleans: HashMap<ValueReference, bool>,
    strings: HashMap<ValueReference, String>,
    can_save_state: bool,
}

impl MockSlaveBuilder {
    pub fn new(name: &str) -> Self {
        MockSlaveBuilder {
            uuid: format!("mock-{name}"),
            name: name.into(),
            variables: Vec::new(),
            reals: HashMap::new(),
            integers: HashMap::new(),
            booleans: HashMap::new(),
            strings: HashMap::new(),
            can_save_state: false,
        }
    }

    fn declare(&mut self, vr: u32, name: &str, variable_type: VariableType, causality: Causality) {
        self.variables.push(VariableDescription {
            name: name.into(),
            value_reference: ValueReference(vr),
            variable_type,
            causality,
            variability: Variability::Continuous,
        });
    }

    pub fn real_input(mut self, vr: u32, name: &str, initial: f64) -> Self {
        self.declare(vr, name, VariableType::Real, Causality::Input);
        self.reals.insert(ValueReference(vr), initial);
        self
    }

    pub fn real_output(mut self, vr: u32, name: &str, initial: f64) -> Self {
        self.declare(vr, name, VariableType::Real, Causality::Output);
        self.reals.insert(ValueReference(vr), initial);
        self
    }

    pub fn real_parameter(mut self, vr: u32, name: &str, initial: f64) -> Self {
        self.declare(vr, name, VariableType::Real, Causality::Parameter);
        self.reals.insert(ValueReference(vr), initial);
        self
    }

    pub fn integer_input(mut self, vr: u32, name: &str, initial: i32) -> Self {
        self.declare(vr, name, VariableType::Integer, Causality::Input);
        self.integers.insert(ValueReference(vr), initial);
        self
    }

    pub fn integer_output(mut self, vr: u32, name: &str, initial: i32) -> Self {
        self.declare(vr, name, VariableType::Integer, Causality::Output);
        self.integers.insert(ValueReference(vr), initial);
        self
    }

    pub fn boolean_input(mut self, vr: u32, name: &str, initial: bool) -> Self {
        self.declare(vr, name, VariableType::Boolean, Causality::Input);
        self.booleans.insert(ValueReference(vr), initial);
        self
    }

    pub fn string_input(mut self, vr: u32, name: &str, initial: &str) -> Self {
        self.declare(vr, name, VariableType::String, Causality::Input);
        self.strings.insert(ValueReference(vr), initial.into());
        self
    }

    /// Marks the slave as supporting `save_state`/`restore_state`.
    pub fn save_state_capable(mut self) -> Self {
        self.can_save_state = true;
        self
    }

    /// Supplies the `do_step` behavior. Defaults to a no-op (complete,
    /// unchanged state) if never called.
    pub fn with_step(self, step: impl FnMut(&mut MockState) -> StepResult + Send + 'static) -> MockSlave {
        MockSlave {
            descr: ModelDescription {
                uuid: self.uuid,
                name: self.name,
                variables: self.variables,
                can_save_state: self.can_save_state,
            },
            reals: self.reals,
            integers: self.integers,
            booleans: self.booleans,
            strings: self.strings,
            step: Box::new(step),
            can_save_state: self.can_save_state,
        }
    }
}

/// A one-input-one-output real slave computing `y := x` every step,
/// grounded in `quillum`'s own `EchoSlave` unit-test fixture (S1/S2).
/// `input_vr`/`output_vr` name the variable references for `x`/`y`.
pub fn echo_slave(name: &str, input_vr: u32, output_vr: u32) -> MockSlave {
    MockSlaveBuilder::new(name)
        .real_input(input_vr, "x", 0.0)
        .real_output(output_vr, "y", 0.0)
        .save_state_capable()
        .with_step(move |state| {
            let x = *state.reals.get(&ValueReference(input_vr)).unwrap_or(&0.0);
            state.reals.insert(ValueReference(output_vr), x);
            StepResult::Complete
        })
}

/// A slave with a single fixed-arity real-vector output, used by the
/// vector-sum scenario (S3): `outputs[k]` is the value delivered on
/// `base_vr + k`.
pub fn vector_output_slave(name: &str, base_vr: u32, outputs: Vec<f64>) -> MockSlave {
    let mut builder = MockSlaveBuilder::new(name);
    for (k, value) in outputs.iter().enumerate() {
        builder = builder.real_output(base_vr + k as u32, &format!("y{k}"), *value);
    }
    builder.with_step(|_| StepResult::Complete)
}

/// A slave with `arity` real inputs starting at `base_vr`, used as the
/// destination of a vector-sum connection (S3).
pub fn vector_input_slave(name: &str, base_vr: u32, arity: usize) -> MockSlave {
    let mut builder = MockSlaveBuilder::new(name);
    for k in 0..arity {
        builder = builder.real_input(base_vr + k as u32, &format!("u{k}"), 0.0);
    }
    builder.with_step(|_| StepResult::Complete)
}

/// A slave that always fails its `do_step` call, for exercising the
/// `slave_error` propagation path.
pub fn failing_slave(name: &str) -> MockSlave {
    MockSlaveBuilder::new(name).with_step(|_| StepResult::Failed)
}
