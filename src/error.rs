//! Error kinds for the co-simulation engine.
//!
//! Follows the same split the rest of this lineage uses: a `thiserror`
//! enum for conditions a caller can legitimately hit and recover from or
//! report (data-dependent), and a `precondition!`-style panic for
//! conditions that indicate a programming error in the embedding
//! application. The latter mirrors `cosim::detail::precondition_violated`
//! in the original C++ implementation, which prints the failing condition
//! and calls `std::terminate`.

use crate::variable::ValueReference;
use crate::SimulatorIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors a caller can receive back from the engine.
///
/// `precondition_violated` is deliberately absent from this enum: it is
/// not a value a caller is expected to handle, it is a panic (see
/// [`precondition_fail`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reported at `connect_variables`/`setup` time: duplicate driver for
    /// an input, a type mismatch between connected endpoints, or an
    /// unknown variable reference. No state change occurs.
    #[error("invalid system structure: {0}")]
    InvalidSystemStructure(String),

    /// A slave returned `failed` (or `discard` in fixed-step mode, which
    /// is treated identically) from `do_step`. The enclosing macro step is
    /// aborted and the execution transitions to the error state.
    #[error("slave {simulator:?} failed: {message}")]
    SlaveError {
        simulator: SimulatorIndex,
        message: String,
    },

    /// A function parameter value fell outside its declared `[min, max]`
    /// range at instantiation time.
    #[error("domain error: {0}")]
    DomainError(String),

    /// A capability (e.g. `save_state`) was requested on a slave whose
    /// model description does not advertise it.
    #[error("slave {simulator:?} does not support {feature}")]
    UnsupportedFeature {
        simulator: SimulatorIndex,
        feature: &'static str,
    },

    /// A variable referenced by a connection, observer, or manipulator
    /// was never exposed for getting/setting.
    #[error("variable {value_reference:?} on slave {simulator:?} is not exposed for {direction}")]
    NotExposed {
        simulator: SimulatorIndex,
        value_reference: ValueReference,
        direction: &'static str,
    },

    /// The execution is in the error state (a prior `slave_error`) and
    /// refuses to step until explicitly reset.
    #[error("execution is in the error state; call reset() before stepping again")]
    ExecutionInErrorState,

    /// Raised by external collaborators (archive/system-structure/scenario
    /// parsers) that sit outside this crate's scope; never constructed by
    /// the engine itself, but kept as part of the public error surface so
    /// embedders building a full system (file loaders, CLI front-ends) can
    /// fold their own I/O errors into the same `Result` type.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Panics after logging the failing condition at `error!` level, mirroring
/// `cosim::detail::precondition_violated`'s "log then terminate" contract.
/// Used for conditions that indicate a bug in the calling code (a
/// zero-length base step size, a non-positive decimation factor, mutating
/// the exposed-set mid-step) rather than bad input data.
#[track_caller]
pub fn precondition_fail(message: &str) -> ! {
    log::error!("precondition violated: {message}");
    panic!("precondition violated: {message}");
}

/// Panics with a formatted message if `cond` is false. See
/// [`precondition_fail`].
macro_rules! precondition {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::precondition_fail(&format!($($arg)+));
        }
    };
}

pub(crate) use precondition;
