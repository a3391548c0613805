//! Builds the small in-process `Execution`s the CLI can drive, one per
//! [`crate::options::Scenario`]. None of this parses a system-structure
//! file; each scenario is just a direct builder call against `quillum`'s
//! public API, the way an embedding application would wire one up.

use std::sync::{Arc, Mutex};

use std::collections::HashMap;

use quillum::config::{ExecutionConfig, SchedulerConfig};
use quillum::connection::Connection;
use quillum::execution::Execution;
use quillum::function::{FunctionIoReference, GainFunctionType};
use quillum::manipulator::{Action, ScenarioEvent, ScenarioManager};
use quillum::observer::{LastValueObserver, Observer};
use quillum::slave::SlaveAdapter;
use quillum::time::{Duration, TimePoint};
use quillum::variable::{SimulatorIndex, ValueReference, VariableId, VariableType};

use crate::options::Scenario;

/// Wraps a [`LastValueObserver`] behind a shared, lockable handle so the
/// CLI can read the final snapshot after `simulate_until` returns, even
/// though the `Execution` owns the observer itself and callers only get
/// a non-owning handle.
#[derive(Clone, Default)]
pub struct SharedLastValueObserver(Arc<Mutex<LastValueObserver>>);

impl SharedLastValueObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, simulator: SimulatorIndex, vr: ValueReference, value_type: VariableType) {
        self.0.lock().unwrap().watch(simulator, vr, value_type);
    }

    pub fn last_real(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<f64> {
        self.0.lock().unwrap().last_real(simulator, vr)
    }
}

impl Observer for SharedLastValueObserver {
    fn simulator_removed(&mut self, index: SimulatorIndex) {
        self.0.lock().unwrap().simulator_removed(index);
    }

    fn simulator_step_complete(
        &mut self,
        index: SimulatorIndex,
        last_step: u64,
        step_size: Duration,
        current_time: TimePoint,
        adapter: &SlaveAdapter,
    ) {
        self.0
            .lock()
            .unwrap()
            .simulator_step_complete(index, last_step, step_size, current_time, adapter);
    }
}

/// A variable to watch and print once the run completes.
pub struct Watch {
    pub label: String,
    pub simulator: SimulatorIndex,
    pub value_reference: ValueReference,
}

pub struct Built {
    pub execution: Execution,
    pub watches: Vec<Watch>,
    pub results: SharedLastValueObserver,
}

pub fn build(scenario: Scenario, step_size: f64) -> Built {
    match scenario {
        Scenario::IdentityChain => identity_chain(step_size),
        Scenario::LinearTransform => linear_transform(step_size),
        Scenario::VectorSum => vector_sum(step_size),
        Scenario::Decimation => decimation(step_size),
        Scenario::ScenarioOverride => scenario_override(step_size),
        Scenario::FunctionGain => function_gain(step_size),
    }
}

fn new_execution(step_size: f64) -> Execution {
    Execution::new(
        ExecutionConfig::new(TimePoint::EPOCH),
        SchedulerConfig::new(Duration::from_seconds(step_size, 0.0)),
    )
}

fn watch_real(execution: &mut Execution, observer: &SharedLastValueObserver, label: &str, simulator: SimulatorIndex, vr: u32) -> Watch {
    let value_reference = ValueReference(vr);
    execution
        .expose_for_observation(VariableId::new(simulator, value_reference))
        .expect("watched variable must exist on the slave");
    observer.watch(simulator, value_reference, VariableType::Real);
    Watch {
        label: label.into(),
        simulator,
        value_reference,
    }
}

/// `A.y -> B.x`, `A.x` initialized to 5.0; `B.y` settles at 5.0.
fn identity_chain(step_size: f64) -> Built {
    let mut execution = new_execution(step_size);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution
        .connect_variables(Connection::Scalar {
            source: VariableId::new(a, ValueReference(1)),
            destination: VariableId::new(b, ValueReference(0)),
            value_type: VariableType::Real,
        })
        .unwrap();
    execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 5.0).unwrap();

    let observer = SharedLastValueObserver::new();
    let watches = vec![watch_real(&mut execution, &observer, "B.y", b, 1)];
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}

/// Same topology as the identity chain, but the connection is
/// `y = 1.3*x + 50.0`.
fn linear_transform(step_size: f64) -> Built {
    let mut execution = new_execution(step_size);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution
        .connect_variables(Connection::LinearTransformation {
            source: VariableId::new(a, ValueReference(1)),
            destination: VariableId::new(b, ValueReference(0)),
            factor: 1.3,
            offset: 50.0,
        })
        .unwrap();
    execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 2.0).unwrap();

    let observer = SharedLastValueObserver::new();
    let watches = vec![watch_real(&mut execution, &observer, "B.y", b, 1)];
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}

/// Three 3-vector sources summed elementwise into one 3-vector sink.
fn vector_sum(step_size: f64) -> Built {
    let mut execution = new_execution(step_size);
    let v1 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V1", 0, vec![1.0, 2.0, 3.0])));
    let v2 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V2", 0, vec![4.0, 5.0, 6.0])));
    let v3 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V3", 0, vec![7.0, 8.0, 9.0])));
    let v4 = execution.add_slave(Box::new(quillum_testkit::vector_input_slave("V4", 0, 3)));

    let group = |sim: SimulatorIndex| (0..3).map(|k| VariableId::new(sim, ValueReference(k))).collect::<Vec<_>>();
    execution
        .connect_variables(Connection::VectorSum {
            groups: vec![group(v1), group(v2), group(v3)],
            destinations: group(v4),
            value_type: VariableType::Real,
        })
        .unwrap();

    let observer = SharedLastValueObserver::new();
    let watches = (0..3)
        .map(|k| watch_real(&mut execution, &observer, &format!("V4.u{k}"), v4, k))
        .collect();
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}

/// `A` steps every macro step, `B` steps every other one.
fn decimation(step_size: f64) -> Built {
    let mut execution = Execution::new(
        ExecutionConfig::new(TimePoint::EPOCH),
        SchedulerConfig::new(Duration::from_seconds(step_size, 0.0)).with_decimation(SimulatorIndex(1), 2),
    );
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.0).unwrap();
    execution.set_real_initial_value(VariableId::new(b, ValueReference(0)), 2.0).unwrap();

    let observer = SharedLastValueObserver::new();
    let watches = vec![
        watch_real(&mut execution, &observer, "A.y", a, 1),
        watch_real(&mut execution, &observer, "B.y", b, 1),
    ];
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}

/// A scenario event overrides `A.x` at t=0.2s regardless of whatever the
/// (absent) connection would otherwise have delivered.
fn scenario_override(step_size: f64) -> Built {
    let mut execution = new_execution(step_size);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));

    let scenario = ScenarioManager::new(vec![ScenarioEvent {
        id: 0,
        trigger: Duration::from_seconds(0.2, 0.0),
        simulator: a,
        value_reference: ValueReference(0),
        action: Action::SetReal(9.0),
    }]);
    execution.add_manipulator(Box::new(scenario));

    let observer = SharedLastValueObserver::new();
    let watches = vec![watch_real(&mut execution, &observer, "A.y", a, 1)];
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}

/// `A.y` feeds a gain-4.0 function instance, whose output drives `B.x`,
/// in place of a connection.
fn function_gain(step_size: f64) -> Built {
    let mut execution = new_execution(step_size);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));

    let gain = GainFunctionType::new(0.0, 10.0);
    let mut parameters = HashMap::new();
    parameters.insert(0, 4.0);
    let function = execution.add_function(&gain, &parameters).unwrap();
    execution
        .connect_function_input(function, FunctionIoReference::new(0, 0, 0), VariableId::new(a, ValueReference(1)))
        .unwrap();
    execution
        .connect_function_output(function, FunctionIoReference::new(0, 0, 1), VariableId::new(b, ValueReference(0)))
        .unwrap();
    execution.set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.5).unwrap();

    let observer = SharedLastValueObserver::new();
    let watches = vec![watch_real(&mut execution, &observer, "B.y", b, 1)];
    let results = observer.clone();
    execution.add_observer(Box::new(observer));
    Built { execution, watches, results }
}
