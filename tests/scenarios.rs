//! End-to-end scenarios wired up against `quillum_testkit`'s mock slaves
//! instead of a real slave binding, exercising `Execution` the way an
//! embedding application would drive it.

use std::sync::{Arc, Mutex};

use float_cmp::approx_eq;
use rstest::rstest;

use quillum::config::{ExecutionConfig, SchedulerConfig};
use quillum::connection::Connection;
use quillum::execution::Execution;
use quillum::function::{FunctionIoReference, GainFunctionType};
use quillum::manipulator::{Action, ScenarioEvent, ScenarioManager};
use quillum::observer::{LastValueObserver, Observer};
use quillum::slave::SlaveAdapter;
use quillum::time::{Duration, TimePoint};
use quillum::variable::{SimulatorIndex, ValueReference, VariableId, VariableType};

fn assert_close(actual: f64, expected: f64) {
    assert!(
        approx_eq!(f64, actual, expected, epsilon = 1e-9),
        "expected {expected}, got {actual}"
    );
}

/// A [`LastValueObserver`] behind a shared, lockable handle, so a test can
/// keep reading it after handing ownership of the real observer to the
/// `Execution` (mirrors the CLI's `SharedLastValueObserver`).
#[derive(Clone, Default)]
struct SharedObserver(Arc<Mutex<LastValueObserver>>);

impl SharedObserver {
    fn new() -> Self {
        Self::default()
    }

    fn watch(&self, simulator: SimulatorIndex, vr: ValueReference, value_type: VariableType) {
        self.0.lock().unwrap().watch(simulator, vr, value_type);
    }

    fn last_real(&self, simulator: SimulatorIndex, vr: ValueReference) -> Option<f64> {
        self.0.lock().unwrap().last_real(simulator, vr)
    }
}

impl Observer for SharedObserver {
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

fn new_execution(step_seconds: f64) -> Execution {
    Execution::new(
        ExecutionConfig::new(TimePoint::EPOCH),
        SchedulerConfig::new(Duration::from_seconds(step_seconds, 0.0)),
    )
}

fn watch(execution: &mut Execution, observer: &SharedObserver, simulator: SimulatorIndex, vr: u32) {
    let value_reference = ValueReference(vr);
    execution
        .expose_for_observation(VariableId::new(simulator, value_reference))
        .unwrap();
    observer.watch(simulator, value_reference, VariableType::Real);
}

/// An identity scalar connection delivers `A.y` to `B.x` unmodified.
#[test]
fn identity_chain_propagates_the_source_value() {
    let mut execution = new_execution(0.1);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution
        .connect_variables(Connection::Scalar {
            source: VariableId::new(a, ValueReference(1)),
            destination: VariableId::new(b, ValueReference(0)),
            value_type: VariableType::Real,
        })
        .unwrap();
    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), 5.0)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, b, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.simulate_until(TimePoint::from_seconds(0.3)).unwrap();

    assert_close(observer.last_real(b, ValueReference(1)).unwrap(), 5.0);
}

/// A linear-transformation connection applies `y = factor*x + offset`.
#[rstest]
#[case(1.3, 50.0, 2.0, 52.6)]
#[case(0.0, 10.0, 999.0, 10.0)]
#[case(-1.0, 0.0, 4.0, -4.0)]
fn linear_transform_applies_factor_and_offset(#[case] factor: f64, #[case] offset: f64, #[case] input: f64, #[case] expected: f64) {
    let mut execution = new_execution(0.1);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution
        .connect_variables(Connection::LinearTransformation {
            source: VariableId::new(a, ValueReference(1)),
            destination: VariableId::new(b, ValueReference(0)),
            factor,
            offset,
        })
        .unwrap();
    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), input)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, b, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.simulate_until(TimePoint::from_seconds(0.3)).unwrap();

    assert_close(observer.last_real(b, ValueReference(1)).unwrap(), expected);
}

/// Three 3-vectors summed elementwise into one 3-vector sink.
#[test]
fn vector_sum_adds_elementwise_across_three_sources() {
    let mut execution = new_execution(0.1);
    let v1 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V1", 0, vec![1.0, 2.0, 3.0])));
    let v2 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V2", 0, vec![4.0, 5.0, 6.0])));
    let v3 = execution.add_slave(Box::new(quillum_testkit::vector_output_slave("V3", 0, vec![7.0, 8.0, 9.0])));
    let sink = execution.add_slave(Box::new(quillum_testkit::vector_input_slave("V4", 0, 3)));

    let group = |sim: SimulatorIndex| (0..3).map(|k| VariableId::new(sim, ValueReference(k))).collect::<Vec<_>>();
    execution
        .connect_variables(Connection::VectorSum {
            groups: vec![group(v1), group(v2), group(v3)],
            destinations: group(sink),
            value_type: VariableType::Real,
        })
        .unwrap();

    let observer = SharedObserver::new();
    for k in 0..3 {
        watch(&mut execution, &observer, sink, k);
    }
    execution.add_observer(Box::new(observer.clone()));

    execution.simulate_until(TimePoint::from_seconds(0.3)).unwrap();

    let expected = [1.0 + 4.0 + 7.0, 2.0 + 5.0 + 8.0, 3.0 + 6.0 + 9.0];
    for (k, expected) in expected.into_iter().enumerate() {
        assert_close(observer.last_real(sink, ValueReference(k as u32)).unwrap(), expected);
    }
}

/// A function instance wired between two slaves scales its source's value
/// into its destination every transfer, the same way a connection would.
#[test]
fn a_bound_function_instance_scales_its_source_into_its_destination() {
    let mut execution = new_execution(0.1);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));

    let gain = GainFunctionType::new(0.0, 10.0);
    let mut parameters = std::collections::HashMap::new();
    parameters.insert(0, 4.0);
    let function = execution.add_function(&gain, &parameters).unwrap();
    execution
        .connect_function_input(function, FunctionIoReference::new(0, 0, 0), VariableId::new(a, ValueReference(1)))
        .unwrap();
    execution
        .connect_function_output(function, FunctionIoReference::new(0, 0, 1), VariableId::new(b, ValueReference(0)))
        .unwrap();
    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.5)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, b, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.simulate_until(TimePoint::from_seconds(0.3)).unwrap();

    assert_close(observer.last_real(b, ValueReference(1)).unwrap(), 6.0);
}

/// A decimated simulator only steps on every `factor`-th macro step, so
/// its observed output lags the non-decimated peer's.
#[test]
fn decimated_simulator_steps_less_often_than_its_peer() {
    let mut execution = Execution::new(
        ExecutionConfig::new(TimePoint::EPOCH),
        SchedulerConfig::new(Duration::from_seconds(0.1, 0.0)).with_decimation(SimulatorIndex(1), 2),
    );
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    let b = execution.add_slave(Box::new(quillum_testkit::echo_slave("B", 0, 1)));
    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.0)
        .unwrap();
    execution
        .set_real_initial_value(VariableId::new(b, ValueReference(0)), 2.0)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, a, 1);
    watch(&mut execution, &observer, b, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.step().unwrap();
    assert_close(observer.last_real(a, ValueReference(1)).unwrap(), 1.0);
    assert_close(observer.last_real(b, ValueReference(1)).unwrap(), 2.0);
}

/// A scenario event overrides an input mid-run, independent of any
/// connection that would otherwise feed it.
#[test]
fn scenario_event_overrides_input_at_its_trigger_time() {
    let mut execution = new_execution(0.1);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));

    let scenario = ScenarioManager::new(vec![ScenarioEvent {
        id: 0,
        trigger: Duration::from_seconds(0.2, 0.0),
        simulator: a,
        value_reference: ValueReference(0),
        action: Action::SetReal(9.0),
    }]);
    execution.add_manipulator(Box::new(scenario));

    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), 1.0)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, a, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.simulate_until(TimePoint::from_seconds(0.1)).unwrap();
    assert_close(observer.last_real(a, ValueReference(1)).unwrap(), 1.0);

    execution.simulate_until(TimePoint::from_seconds(0.5)).unwrap();
    assert_close(observer.last_real(a, ValueReference(1)).unwrap(), 9.0);
}

/// `save_state`/`restore_state` reproduces the values a subsequent step
/// would have produced, for a save-state-capable slave.
#[test]
fn restoring_a_saved_state_reproduces_the_original_continuation() {
    let mut execution = new_execution(0.1);
    let a = execution.add_slave(Box::new(quillum_testkit::echo_slave("A", 0, 1)));
    execution
        .set_real_initial_value(VariableId::new(a, ValueReference(0)), 3.0)
        .unwrap();

    let observer = SharedObserver::new();
    watch(&mut execution, &observer, a, 1);
    execution.add_observer(Box::new(observer.clone()));

    execution.step().unwrap(); // t=0.1
    execution.step().unwrap(); // t=0.2
    let handle = execution.save_state().unwrap();

    execution.step().unwrap(); // t=0.3 (original continuation)
    let original_t3 = observer.last_real(a, ValueReference(1)).unwrap();
    execution.step().unwrap(); // t=0.4 (original continuation)
    let original_t4 = observer.last_real(a, ValueReference(1)).unwrap();

    execution.restore_state(&handle).unwrap();
    assert_eq!(execution.current_time(), TimePoint::from_nanos(200_000_000));

    execution.step().unwrap();
    assert_close(observer.last_real(a, ValueReference(1)).unwrap(), original_t3);
    execution.step().unwrap();
    assert_close(observer.last_real(a, ValueReference(1)).unwrap(), original_t4);

    execution.release_state(handle).unwrap();
}

/// A slave that always fails its step moves the execution into the error
/// state; the failure surfaces as an error rather than being swallowed.
#[test]
fn a_failing_slave_halts_the_execution() {
    let mut execution = new_execution(0.1);
    execution.add_slave(Box::new(quillum_testkit::failing_slave("F")));

    let outcome = execution.simulate_until(TimePoint::from_seconds(0.3));
    assert!(outcome.is_err(), "a failing slave must surface as an execution error");
}
