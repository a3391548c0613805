//! The slave interface (consumed, not implemented by this crate) and the
//! slave adapter façade built around it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{precondition, Error, Result};
use crate::model::ModelDescription;
use crate::time::{Duration, TimePoint};
use crate::variable::{ValueReference, VariableType};
use crate::SimulatorIndex;

/// Outcome of a single `do_step` invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Complete,
    /// The slave asked to discard this step and retry with a shorter one.
    /// In fixed-step mode this is never honored; the adapter treats it the
    /// same as [`StepResult::Failed`].
    Discard,
    Failed,
}

/// An opaque, reference-counted saved-state snapshot. Cloning shares the
/// underlying snapshot; dropping the last clone frees it, giving an
/// opaque, reference-counted handle without any manual bookkeeping.
#[derive(Clone)]
pub struct StateHandle(pub Arc<dyn Any + Send + Sync>);

impl StateHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        StateHandle(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateHandle(strong_count={})", Arc::strong_count(&self.0))
    }
}

/// The operations any black-box simulation model must provide.
/// Implementations are expected to be thin wrappers around a concrete
/// model/FMU binding; this crate never constructs one from a file itself.
pub trait Slave: Send {
    fn model_description(&self) -> &ModelDescription;

    fn setup(&mut self, start: TimePoint, stop: Option<TimePoint>, tolerance: Option<f64>) -> Result<()>;
    fn start_simulation(&mut self) -> Result<()>;
    fn end_simulation(&mut self) -> Result<()>;

    fn do_step(&mut self, current_time: TimePoint, step_size: Duration) -> StepResult;

    fn get_real_variables(&self, refs: &[ValueReference], out: &mut [f64]);
    fn get_integer_variables(&self, refs: &[ValueReference], out: &mut [i32]);
    fn get_boolean_variables(&self, refs: &[ValueReference], out: &mut [bool]);
    fn get_string_variables(&self, refs: &[ValueReference], out: &mut [String]);

    fn set_real_variables(&mut self, refs: &[ValueReference], values: &[f64]);
    fn set_integer_variables(&mut self, refs: &[ValueReference], values: &[i32]);
    fn set_boolean_variables(&mut self, refs: &[ValueReference], values: &[bool]);
    fn set_string_variables(&mut self, refs: &[ValueReference], values: &[String]);

    /// Default: unsupported. `SlaveAdapter` rewrites the `simulator` field
    /// of the returned error to its own index, since a bare `Slave` impl
    /// does not know it.
    fn save_state(&mut self) -> Result<StateHandle> {
        Err(Error::UnsupportedFeature {
            simulator: SimulatorIndex(usize::MAX),
            feature: "save_state",
        })
    }

    fn restore_state(&mut self, _handle: &StateHandle) -> Result<()> {
        Err(Error::UnsupportedFeature {
            simulator: SimulatorIndex(usize::MAX),
            feature: "restore_state",
        })
    }

    fn release_state(&mut self, _handle: StateHandle) -> Result<()> {
        Ok(())
    }
}

/// Per-type bookkeeping inside a [`SlaveAdapter`]: which refs are exposed,
/// the most recent cached read, the pending write buffer, and the ordered
/// manipulator chain per ref.
struct TypedTables<T> {
    exposed_for_getting: HashSet<ValueReference>,
    exposed_for_setting: HashSet<ValueReference>,
    last_get: HashMap<ValueReference, T>,
    pending_set: HashMap<ValueReference, T>,
    manipulators: HashMap<ValueReference, Vec<Box<dyn FnMut(T) -> T + Send>>>,
}

impl<T> Default for TypedTables<T> {
    fn default() -> Self {
        TypedTables {
            exposed_for_getting: HashSet::new(),
            exposed_for_setting: HashSet::new(),
            last_get: HashMap::new(),
            pending_set: HashMap::new(),
            manipulators: HashMap::new(),
        }
    }
}

/// Thin façade around a [`Slave`]: exposed-for-get/set sets, cached
/// values, input manipulators, and save/restore.
pub struct SlaveAdapter {
    pub index: SimulatorIndex,
    slave: Box<dyn Slave>,
    in_step: bool,
    reals: TypedTables<f64>,
    integers: TypedTables<i32>,
    booleans: TypedTables<bool>,
    strings: TypedTables<String>,
}

impl SlaveAdapter {
    pub fn new(index: SimulatorIndex, slave: Box<dyn Slave>) -> Self {
        SlaveAdapter {
            index,
            slave,
            in_step: false,
            reals: TypedTables::default(),
            integers: TypedTables::default(),
            booleans: TypedTables::default(),
            strings: TypedTables::default(),
        }
    }

    pub fn model_description(&self) -> &ModelDescription {
        self.slave.model_description()
    }

    /// Idempotent: adding an already-exposed ref is a no-op.
    pub fn expose_for_getting(&mut self, ty: VariableType, vr: ValueReference) {
        precondition!(!self.in_step, "expose_for_getting called during a step");
        match ty {
            VariableType::Real => self.reals.exposed_for_getting.insert(vr),
            VariableType::Integer => self.integers.exposed_for_getting.insert(vr),
            VariableType::Boolean => self.booleans.exposed_for_getting.insert(vr),
            VariableType::String => self.strings.exposed_for_getting.insert(vr),
        };
    }

    pub fn expose_for_setting(&mut self, ty: VariableType, vr: ValueReference) {
        precondition!(!self.in_step, "expose_for_setting called during a step");
        match ty {
            VariableType::Real => self.reals.exposed_for_setting.insert(vr),
            VariableType::Integer => self.integers.exposed_for_setting.insert(vr),
            VariableType::Boolean => self.booleans.exposed_for_setting.insert(vr),
            VariableType::String => self.strings.exposed_for_setting.insert(vr),
        };
    }

    pub fn is_exposed_for_getting(&self, ty: VariableType, vr: ValueReference) -> bool {
        match ty {
            VariableType::Real => self.reals.exposed_for_getting.contains(&vr),
            VariableType::Integer => self.integers.exposed_for_getting.contains(&vr),
            VariableType::Boolean => self.booleans.exposed_for_getting.contains(&vr),
            VariableType::String => self.strings.exposed_for_getting.contains(&vr),
        }
    }

    pub fn is_exposed_for_setting(&self, ty: VariableType, vr: ValueReference) -> bool {
        match ty {
            VariableType::Real => self.reals.exposed_for_setting.contains(&vr),
            VariableType::Integer => self.integers.exposed_for_setting.contains(&vr),
            VariableType::Boolean => self.booleans.exposed_for_setting.contains(&vr),
            VariableType::String => self.strings.exposed_for_setting.contains(&vr),
        }
    }

    pub fn get_real(&self, vr: ValueReference) -> f64 {
        self.reals.last_get.get(&vr).copied().unwrap_or_default()
    }
    pub fn set_real(&mut self, vr: ValueReference, value: f64) {
        log::trace!("slave {:?}: pending set real {vr:?} = {value}", self.index);
        self.reals.pending_set.insert(vr, value);
    }
    pub fn set_real_input_manipulator(&mut self, vr: ValueReference, f: Option<Box<dyn FnMut(f64) -> f64 + Send>>) {
        match f {
            Some(f) => self.reals.manipulators.entry(vr).or_default().push(f),
            None => {
                self.reals.manipulators.remove(&vr);
            }
        }
    }

    pub fn get_integer(&self, vr: ValueReference) -> i32 {
        self.integers.last_get.get(&vr).copied().unwrap_or_default()
    }
    pub fn set_integer(&mut self, vr: ValueReference, value: i32) {
        log::trace!("slave {:?}: pending set integer {vr:?} = {value}", self.index);
        self.integers.pending_set.insert(vr, value);
    }
    pub fn set_integer_input_manipulator(&mut self, vr: ValueReference, f: Option<Box<dyn FnMut(i32) -> i32 + Send>>) {
        match f {
            Some(f) => self.integers.manipulators.entry(vr).or_default().push(f),
            None => {
                self.integers.manipulators.remove(&vr);
            }
        }
    }

    pub fn get_boolean(&self, vr: ValueReference) -> bool {
        self.booleans.last_get.get(&vr).copied().unwrap_or_default()
    }
    pub fn set_boolean(&mut self, vr: ValueReference, value: bool) {
        log::trace!("slave {:?}: pending set boolean {vr:?} = {value}", self.index);
        self.booleans.pending_set.insert(vr, value);
    }
    pub fn set_boolean_input_manipulator(&mut self, vr: ValueReference, f: Option<Box<dyn FnMut(bool) -> bool + Send>>) {
        match f {
            Some(f) => self.booleans.manipulators.entry(vr).or_default().push(f),
            None => {
                self.booleans.manipulators.remove(&vr);
            }
        }
    }

    pub fn get_string(&self, vr: ValueReference) -> String {
        self.strings.last_get.get(&vr).cloned().unwrap_or_default()
    }
    pub fn set_string(&mut self, vr: ValueReference, value: String) {
        log::trace!("slave {:?}: pending set string {vr:?} = {value:?}", self.index);
        self.strings.pending_set.insert(vr, value);
    }
    pub fn set_string_input_manipulator(&mut self, vr: ValueReference, f: Option<Box<dyn FnMut(String) -> String + Send>>) {
        match f {
            Some(f) => self.strings.manipulators.entry(vr).or_default().push(f),
            None => {
                self.strings.manipulators.remove(&vr);
            }
        }
    }

    pub fn setup(&mut self, start: TimePoint, stop: Option<TimePoint>, tolerance: Option<f64>) -> Result<()> {
        self.slave.setup(start, stop, tolerance)
    }

    pub fn start_simulation(&mut self) -> Result<()> {
        self.slave.start_simulation()
    }

    pub fn end_simulation(&mut self) -> Result<()> {
        self.slave.end_simulation()
    }

    /// Flushes every type's pending-set buffer into the slave, running
    /// each ref's manipulator chain over the value first. Called by the
    /// transfer phase once per macro step.
    pub fn flush_pending_sets(&mut self) {
        flush_reals(self);
        flush_integers(self);
        flush_booleans(self);
        flush_strings(self);
    }

    /// Dispatches `do_step` on the wrapped slave. In fixed-step mode a
    /// `discard` request is treated as `failed`.
    pub fn do_step(&mut self, current_time: TimePoint, step_size: Duration) -> StepResult {
        self.in_step = true;
        let result = self.slave.do_step(current_time, step_size);
        self.in_step = false;
        match result {
            StepResult::Discard => StepResult::Failed,
            other => other,
        }
    }

    /// Refreshes every type's last-get cache from the slave's current
    /// output values. Called after a successful `do_step` (or during
    /// initialization).
    pub fn refresh_outputs(&mut self) {
        refresh_reals(self);
        refresh_integers(self);
        refresh_booleans(self);
        refresh_strings(self);
    }

    pub fn can_save_state(&self) -> bool {
        self.slave.model_description().can_save_state
    }

    pub fn save_state(&mut self) -> Result<StateHandle> {
        self.slave.save_state().map_err(|_| Error::UnsupportedFeature {
            simulator: self.index,
            feature: "save_state",
        })
    }

    pub fn restore_state(&mut self, handle: &StateHandle) -> Result<()> {
        self.slave.restore_state(handle).map_err(|_| Error::UnsupportedFeature {
            simulator: self.index,
            feature: "restore_state",
        })
    }

    pub fn release_state(&mut self, handle: StateHandle) -> Result<()> {
        self.slave.release_state(handle).map_err(|_| Error::UnsupportedFeature {
            simulator: self.index,
            feature: "release_state",
        })
    }
}

fn flush_reals(adapter: &mut SlaveAdapter) {
    if adapter.reals.pending_set.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut adapter.reals.pending_set);
    let mut refs = Vec::with_capacity(pending.len());
    let mut values = Vec::with_capacity(pending.len());
    for (vr, value) in pending {
        let value = match adapter.reals.manipulators.get_mut(&vr) {
            Some(chain) => chain.iter_mut().fold(value, |v, f| f(v)),
            None => value,
        };
        refs.push(vr);
        values.push(value);
    }
    adapter.slave.set_real_variables(&refs, &values);
}

fn flush_integers(adapter: &mut SlaveAdapter) {
    if adapter.integers.pending_set.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut adapter.integers.pending_set);
    let mut refs = Vec::with_capacity(pending.len());
    let mut values = Vec::with_capacity(pending.len());
    for (vr, value) in pending {
        let value = match adapter.integers.manipulators.get_mut(&vr) {
            Some(chain) => chain.iter_mut().fold(value, |v, f| f(v)),
            None => value,
        };
        refs.push(vr);
        values.push(value);
    }
    adapter.slave.set_integer_variables(&refs, &values);
}

fn flush_booleans(adapter: &mut SlaveAdapter) {
    if adapter.booleans.pending_set.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut adapter.booleans.pending_set);
    let mut refs = Vec::with_capacity(pending.len());
    let mut values = Vec::with_capacity(pending.len());
    for (vr, value) in pending {
        let value = match adapter.booleans.manipulators.get_mut(&vr) {
            Some(chain) => chain.iter_mut().fold(value, |v, f| f(v)),
            None => value,
        };
        refs.push(vr);
        values.push(value);
    }
    adapter.slave.set_boolean_variables(&refs, &values);
}

fn flush_strings(adapter: &mut SlaveAdapter) {
    if adapter.strings.pending_set.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut adapter.strings.pending_set);
    let mut refs = Vec::with_capacity(pending.len());
    let mut values = Vec::with_capacity(pending.len());
    for (vr, value) in pending {
        let value = match adapter.strings.manipulators.get_mut(&vr) {
            Some(chain) => chain.iter_mut().fold(value, |v, f| f(v)),
            None => value,
        };
        refs.push(vr);
        values.push(value);
    }
    adapter.slave.set_string_variables(&refs, &values);
}

fn refresh_reals(adapter: &mut SlaveAdapter) {
    if adapter.reals.exposed_for_getting.is_empty() {
        return;
    }
    let refs: Vec<ValueReference> = adapter.reals.exposed_for_getting.iter().copied().collect();
    let mut values = vec![0.0; refs.len()];
    adapter.slave.get_real_variables(&refs, &mut values);
    for (vr, value) in refs.into_iter().zip(values) {
        adapter.reals.last_get.insert(vr, value);
    }
}

fn refresh_integers(adapter: &mut SlaveAdapter) {
    if adapter.integers.exposed_for_getting.is_empty() {
        return;
    }
    let refs: Vec<ValueReference> = adapter.integers.exposed_for_getting.iter().copied().collect();
    let mut values = vec![0; refs.len()];
    adapter.slave.get_integer_variables(&refs, &mut values);
    for (vr, value) in refs.into_iter().zip(values) {
        adapter.integers.last_get.insert(vr, value);
    }
}

fn refresh_booleans(adapter: &mut SlaveAdapter) {
    if adapter.booleans.exposed_for_getting.is_empty() {
        return;
    }
    let refs: Vec<ValueReference> = adapter.booleans.exposed_for_getting.iter().copied().collect();
    let mut values = vec![false; refs.len()];
    adapter.slave.get_boolean_variables(&refs, &mut values);
    for (vr, value) in refs.into_iter().zip(values) {
        adapter.booleans.last_get.insert(vr, value);
    }
}

fn refresh_strings(adapter: &mut SlaveAdapter) {
    if adapter.strings.exposed_for_getting.is_empty() {
        return;
    }
    let refs: Vec<ValueReference> = adapter.strings.exposed_for_getting.iter().copied().collect();
    let mut values = vec![String::new(); refs.len()];
    adapter.slave.get_string_variables(&refs, &mut values);
    for (vr, value) in refs.into_iter().zip(values) {
        adapter.strings.last_get.insert(vr, value);
    }
}
