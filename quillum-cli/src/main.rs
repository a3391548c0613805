//! Command-line front-end: drives a built-in demo `Execution` to
//! completion and prints the final value of each watched variable. This
//! stands in for a real C ABI the same way `fmi-sim` stands in for a
//! real FMI importer.

mod options;
mod scenarios;

use clap::Parser;
use quillum::execution::SimulationOutcome;
use quillum::time::TimePoint;

use options::Options;

fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    flexi_logger::Logger::try_with_str(options.verbosity.log_level_filter().as_str())?.start()?;

    let scenarios::Built {
        mut execution,
        watches,
        results,
    } = scenarios::build(options.scenario, options.step_size);

    let stop = TimePoint::from_seconds(options.stop_time);
    match execution.simulate_until(stop)? {
        SimulationOutcome::Completed { current_time } => {
            log::info!("simulation completed at t={:.6}s", current_time.as_seconds_f64());
        }
        SimulationOutcome::Canceled { current_time } => {
            log::warn!("simulation canceled at t={:.6}s", current_time.as_seconds_f64());
        }
    }

    for watch in &watches {
        let value = results.last_real(watch.simulator, watch.value_reference);
        match value {
            Some(value) => println!("{} = {value:.6}", watch.label),
            None => println!("{} = <no value observed>", watch.label),
        }
    }

    Ok(())
}
