//! CLI flags, in the same derive style as `fmi_sim::options`. This layer
//! only parses argv; the plain [`quillum::config::ExecutionConfig`] /
//! [`quillum::config::SchedulerConfig`] structs it feeds into the library
//! are built separately in `main`.

use clap::Parser;
use clap_verbosity_flag::Verbosity;

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum Scenario {
    /// Two slaves chained by an identity connection.
    #[default]
    IdentityChain,
    /// The chain connection applies `y = factor*x + offset`.
    LinearTransform,
    /// Three vector sources summed into one vector sink.
    VectorSum,
    /// Two slaves with different decimation factors.
    Decimation,
    /// A scenario event overrides an input mid-run.
    ScenarioOverride,
    /// A gain function instance sits between two slaves instead of a connection.
    FunctionGain,
}

/// Drives a built-in demo scenario through a quillum [`Execution`] and
/// prints the final last-value snapshot of its observed outputs.
#[derive(Debug, Parser)]
#[command(name = "quillum", version, about)]
pub struct Options {
    /// Which built-in demo scenario to run.
    #[arg(long, value_enum, default_value_t = Scenario::IdentityChain)]
    pub scenario: Scenario,

    /// Base step size Δ₀, in seconds.
    #[arg(long, default_value_t = 0.1)]
    pub step_size: f64,

    /// Simulate until this time, in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub stop_time: f64,

    #[command(flatten)]
    pub verbosity: Verbosity,
}
