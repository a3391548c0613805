//! The observer fanout: pull-based sinks notified at step granularity.
//! Observers must not mutate slave state, they only read through
//! [`SlaveAdapter::get_real`] and friends.

use std::collections::HashMap;

use crate::slave::SlaveAdapter;
use crate::time::{Duration, TimePoint};
use crate::variable::{SimulatorIndex, Value, ValueReference, VariableId, VariableType};

/// A sink notified of simulator lifecycle and step-completion events.
pub trait Observer: Send {
    fn simulator_added(&mut self, _index: SimulatorIndex) {}
    fn simulator_removed(&mut self, _index: SimulatorIndex) {}
    fn variables_connected(&mut self, _destination: VariableId) {}
    fn variable_disconnected(&mut self, _destination: VariableId) {}

    fn simulation_initialized(&mut self, _first_step: u64, _start_time: TimePoint) {}

    /// Called once per macro step, after the transfer phase completes.
    fn step_complete(&mut self, _last_step: u64, _step_size: Duration, _current_time: TimePoint) {}

    /// Called once per slave, per macro step, with that slave's adapter
    /// available for reading its current (post-transfer) output values.
    fn simulator_step_complete(
        &mut self,
        _index: SimulatorIndex,
        _last_step: u64,
        _step_size: Duration,
        _current_time: TimePoint,
        _adapter: &SlaveAdapter,
    ) {
    }

    fn state_restored(&mut self, _current_step: u64, _current_time: TimePoint) {}
}

/// Fans every event out to an ordered list of observers.
#[derive(Default)]
pub struct ObserverFanout {
    observers: Vec<Box<dyn Observer>>,
}

impl ObserverFanout {
    pub fn new() -> Self {
        ObserverFanout::default()
    }

    pub fn add(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn notify_simulator_added(&mut self, index: SimulatorIndex) {
        for o in &mut self.observers {
            o.simulator_added(index);
        }
    }

    pub fn notify_simulator_removed(&mut self, index: SimulatorIndex) {
        for o in &mut self.observers {
            o.simulator_removed(index);
        }
    }

    pub fn notify_variables_connected(&mut self, destination: VariableId) {
        for o in &mut self.observers {
            o.variables_connected(destination);
        }
    }

    pub fn notify_variable_disconnected(&mut self, destination: VariableId) {
        for o in &mut self.observers {
            o.variable_disconnected(destination);
        }
    }

    pub fn notify_simulation_initialized(&mut self, first_step: u64, start_time: TimePoint) {
        for o in &mut self.observers {
            o.simulation_initialized(first_step, start_time);
        }
    }

    pub fn notify_step_complete(&mut self, last_step: u64, step_size: Duration, current_time: TimePoint) {
        for o in &mut self.observers {
            o.step_complete(last_step, step_size, current_time);
        }
    }

    pub fn notify_simulator_step_complete(
        &mut self,
        index: SimulatorIndex,
        last_step: u64,
        step_size: Duration,
        current_time: TimePoint,
        adapter: &SlaveAdapter,
    ) {
        for o in &mut self.observers {
            o.simulator_step_complete(index, last_step, step_size, current_time, adapter);
        }
    }

    pub fn notify_state_restored(&mut self, current_step: u64, current_time: TimePoint) {
        for o in &mut self.observers {
            o.state_restored(current_step, current_time);
        }
    }
}

#[derive(Default, Clone)]
struct LastValueRecord {
    reals: HashMap<ValueReference, f64>,
    integers: HashMap<ValueReference, i32>,
    booleans: HashMap<ValueReference, bool>,
    strings: HashMap<ValueReference, String>,
}

/// Keeps the most recently observed value of every variable of interest.
#[derive(Default)]
pub struct LastValueObserver {
    records: HashMap<SimulatorIndex, LastValueRecord>,
    watched: HashMap<SimulatorIndex, Vec<(ValueReference, VariableType)>>,
}

impl LastValueObserver {
    pub fn new() -> Self {
        LastValueObserver::default()
    }

    /// Registers a variable to be refreshed on every `simulator_step_complete`.
    pub fn watch(&mut self, simulator: SimulatorIndex, vr: ValueReference, value_type: VariableType) {
        self.watched.entry(simulator).or_default().push((vr, value_type));
    }

    pub fn last_real(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<f64> {
        self.records.get(&simulator)?.reals.get(&vr).copied()
    }

    pub fn last_integer(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<i32> {
        self.records.get(&simulator)?.integers.get(&vr).copied()
    }

    pub fn last_boolean(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<bool> {
        self.records.get(&simulator)?.booleans.get(&vr).copied()
    }

    pub fn last_string(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<String> {
        self.records.get(&simulator)?.strings.get(&vr).cloned()
    }
}

impl Observer for LastValueObserver {
    fn simulator_removed(&mut self, index: SimulatorIndex) {
        self.records.remove(&index);
        self.watched.remove(&index);
    }

    fn simulator_step_complete(
        &mut self,
        index: SimulatorIndex,
        _last_step: u64,
        _step_size: Duration,
        _current_time: TimePoint,
        adapter: &SlaveAdapter,
    ) {
        let Some(watched) = self.watched.get(&index) else {
            return;
        };
        let record = self.records.entry(index).or_default();
        for (vr, ty) in watched {
            match ty {
                VariableType::Real => {
                    record.reals.insert(*vr, adapter.get_real(*vr));
                }
                VariableType::Integer => {
                    record.integers.insert(*vr, adapter.get_integer(*vr));
                }
                VariableType::Boolean => {
                    record.booleans.insert(*vr, adapter.get_boolean(*vr));
                }
                VariableType::String => {
                    record.strings.insert(*vr, adapter.get_string(*vr));
                }
            }
        }
    }
}

/// A bounded, step-indexed sample buffer for one variable.
struct SampleBuffer {
    capacity: usize,
    samples: std::collections::VecDeque<(u64, Value)>,
}

impl SampleBuffer {
    fn new(capacity: usize) -> Self {
        SampleBuffer {
            capacity,
            samples: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, step: u64, value: Value) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((step, value));
    }
}

/// Retains a bounded history of samples per variable, evicting the oldest
/// sample once a variable's buffer is full. Persisting these to CSV/binary
/// storage is an external collaborator's job; this type only buffers in
/// memory.
pub struct TimeSeriesObserver {
    capacity: usize,
    buffers: HashMap<VariableId, SampleBuffer>,
    watched: HashMap<SimulatorIndex, Vec<(ValueReference, VariableType)>>,
}

impl TimeSeriesObserver {
    pub fn new(capacity: usize) -> Self {
        TimeSeriesObserver {
            capacity,
            buffers: HashMap::new(),
            watched: HashMap::new(),
        }
    }

    pub fn watch(&mut self, simulator: SimulatorIndex, vr: ValueReference, value_type: VariableType) {
        self.watched.entry(simulator).or_default().push((vr, value_type));
        self.buffers
            .insert(VariableId::new(simulator, vr), SampleBuffer::new(self.capacity));
    }

    /// Returns the buffered `(step, value)` samples for a variable, oldest
    /// first.
    pub fn samples(&self, simulator: SimulatorIndex, vr: ValueReference) -> Vec<(u64, Value)> {
        self.buffers
            .get(&VariableId::new(simulator, vr))
            .map(|b| b.samples.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Observer for TimeSeriesObserver {
    fn simulator_removed(&mut self, index: SimulatorIndex) {
        self.watched.remove(&index);
        self.buffers.retain(|id, _| id.simulator != index);
    }

    fn simulator_step_complete(
        &mut self,
        index: SimulatorIndex,
        last_step: u64,
        _step_size: Duration,
        _current_time: TimePoint,
        adapter: &SlaveAdapter,
    ) {
        let Some(watched) = self.watched.get(&index) else {
            return;
        };
        for (vr, ty) in watched {
            let value = match ty {
                VariableType::Real => Value::Real(adapter.get_real(*vr)),
                VariableType::Integer => Value::Integer(adapter.get_integer(*vr)),
                VariableType::Boolean => Value::Boolean(adapter.get_boolean(*vr)),
                VariableType::String => Value::String(adapter.get_string(*vr)),
            };
            if let Some(buffer) = self.buffers.get_mut(&VariableId::new(index, *vr)) {
                buffer.push(last_step, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDescription;
    use crate::slave::{Slave, StepResult};

    struct ConstantSlave {
        descr: ModelDescription,
        value: f64,
    }

    impl Slave for ConstantSlave {
        fn model_description(&self) -> &ModelDescription {
            &self.descr
        }
        fn setup(&mut self, _: TimePoint, _: Option<TimePoint>, _: Option<f64>) -> crate::error::Result<()> {
            Ok(())
        }
        fn start_simulation(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        fn end_simulation(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        fn do_step(&mut self, _: TimePoint, _: Duration) -> StepResult {
            StepResult::Complete
        }
        fn get_real_variables(&self, _: &[ValueReference], out: &mut [f64]) {
            out.fill(self.value);
        }
        fn get_integer_variables(&self, _: &[ValueReference], _: &mut [i32]) {}
        fn get_boolean_variables(&self, _: &[ValueReference], _: &mut [bool]) {}
        fn get_string_variables(&self, _: &[ValueReference], _: &mut [String]) {}
        fn set_real_variables(&mut self, _: &[ValueReference], values: &[f64]) {
            if let Some(v) = values.first() {
                self.value = *v;
            }
        }
        fn set_integer_variables(&mut self, _: &[ValueReference], _: &[i32]) {}
        fn set_boolean_variables(&mut self, _: &[ValueReference], _: &[bool]) {}
        fn set_string_variables(&mut self, _: &[ValueReference], _: &[String]) {}
    }

    fn adapter_with_value(value: f64) -> SlaveAdapter {
        let descr = ModelDescription {
            uuid: "const".into(),
            name: "const".into(),
            variables: vec![],
            can_save_state: false,
        };
        let mut adapter = SlaveAdapter::new(SimulatorIndex(0), Box::new(ConstantSlave { descr, value }));
        adapter.expose_for_getting(VariableType::Real, ValueReference(0));
        adapter.refresh_outputs();
        adapter
    }

    #[test]
    fn last_value_observer_tracks_the_most_recent_reading() {
        let mut observer = LastValueObserver::new();
        observer.watch(SimulatorIndex(0), ValueReference(0), VariableType::Real);

        let adapter = adapter_with_value(1.0);
        observer.simulator_step_complete(SimulatorIndex(0), 0, Duration::ZERO, TimePoint::EPOCH, &adapter);
        assert_eq!(observer.last_real(SimulatorIndex(0), ValueReference(0)), Some(1.0));

        let adapter = adapter_with_value(2.0);
        observer.simulator_step_complete(SimulatorIndex(0), 1, Duration::ZERO, TimePoint::EPOCH, &adapter);
        assert_eq!(observer.last_real(SimulatorIndex(0), ValueReference(0)), Some(2.0));
    }

    #[test]
    fn last_value_observer_forgets_removed_simulators() {
        let mut observer = LastValueObserver::new();
        observer.watch(SimulatorIndex(0), ValueReference(0), VariableType::Real);
        let adapter = adapter_with_value(1.0);
        observer.simulator_step_complete(SimulatorIndex(0), 0, Duration::ZERO, TimePoint::EPOCH, &adapter);
        observer.simulator_removed(SimulatorIndex(0));
        assert_eq!(observer.last_real(SimulatorIndex(0), ValueReference(0)), None);
    }

    #[test]
    fn time_series_observer_evicts_oldest_sample_once_full() {
        let mut observer = TimeSeriesObserver::new(2);
        observer.watch(SimulatorIndex(0), ValueReference(0), VariableType::Real);

        for step in 0..3u64 {
            let adapter = adapter_with_value(step as f64);
            observer.simulator_step_complete(SimulatorIndex(0), step, Duration::ZERO, TimePoint::EPOCH, &adapter);
        }

        let samples = observer.samples(SimulatorIndex(0), ValueReference(0));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].0, 1);
        assert_eq!(samples[1].0, 2);
    }
}
