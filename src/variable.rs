//! Variable identity and typed scalar values.
//!
//! A variable is identified by the pair `(simulator_index,
//! value_reference)` and carries a [`VariableType`], [`Causality`] and
//! [`Variability`]. The enum shapes and `Display`/`FromStr` impls mirror
//! `fmi_schema::fmi2::scalar_variable::{Causality, Variability}` in this
//! lineage, generalized to be FMI-version-agnostic since this crate never
//! parses a concrete model description XML itself.

use std::fmt::Display;
use std::str::FromStr;

/// Opaque index of a slave within an [`crate::execution::Execution`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimulatorIndex(pub usize);

/// Opaque index of a function instance within an execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionIndex(pub usize);

/// A slave-local variable handle, analogous to an FMI `valueReference`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueReference(pub u32);

impl From<u32> for ValueReference {
    fn from(vr: u32) -> Self {
        ValueReference(vr)
    }
}

/// The four scalar types the engine routes and stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableType {
    Real,
    Integer,
    Boolean,
    String,
}

/// Enumeration that defines the causality of the variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Causality {
    Parameter,
    CalculatedParameter,
    Input,
    Output,
    #[default]
    Local,
    Independent,
}

impl Causality {
    /// Whether a variable of this causality may act as a connection
    /// *source* endpoint.
    pub fn is_output_like(self) -> bool {
        matches!(self, Causality::Output)
    }

    /// Whether a variable of this causality may act as a connection
    /// *destination* endpoint.
    pub fn is_input_like(self) -> bool {
        matches!(self, Causality::Input)
    }

    /// Whether an initial value write targeting this causality is legal:
    /// initial values may only target `parameter`, `calculated_parameter`
    /// or `input` variables.
    pub fn accepts_initial_value(self) -> bool {
        matches!(
            self,
            Causality::Parameter | Causality::CalculatedParameter | Causality::Input
        )
    }
}

impl FromStr for Causality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parameter" => Ok(Causality::Parameter),
            "calculatedParameter" => Ok(Causality::CalculatedParameter),
            "input" => Ok(Causality::Input),
            "output" => Ok(Causality::Output),
            "local" => Ok(Causality::Local),
            "independent" => Ok(Causality::Independent),
            _ => Err(format!("invalid causality: {s}")),
        }
    }
}

impl Display for Causality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Causality::Parameter => "parameter",
            Causality::CalculatedParameter => "calculatedParameter",
            Causality::Input => "input",
            Causality::Output => "output",
            Causality::Local => "local",
            Causality::Independent => "independent",
        };
        write!(f, "{s}")
    }
}

/// Enumeration that defines the time dependency of the variable: the time
/// instants at which a variable may change value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Variability {
    Constant,
    Fixed,
    Tunable,
    Discrete,
    #[default]
    Continuous,
}

impl FromStr for Variability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Variability::Constant),
            "fixed" => Ok(Variability::Fixed),
            "tunable" => Ok(Variability::Tunable),
            "discrete" => Ok(Variability::Discrete),
            "continuous" => Ok(Variability::Continuous),
            _ => Err(format!("invalid variability: {s}")),
        }
    }
}

impl Display for Variability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Variability::Constant => "constant",
            Variability::Fixed => "fixed",
            Variability::Tunable => "tunable",
            Variability::Discrete => "discrete",
            Variability::Continuous => "continuous",
        };
        write!(f, "{s}")
    }
}

/// A fully-qualified variable endpoint: which slave, which value
/// reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariableId {
    pub simulator: SimulatorIndex,
    pub value_reference: ValueReference,
}

impl VariableId {
    pub fn new(simulator: SimulatorIndex, value_reference: ValueReference) -> Self {
        VariableId {
            simulator,
            value_reference,
        }
    }
}

/// A dynamically-typed scalar value, used at the edges of the connection
/// graph and function stage where source and destination types must be
/// compared at runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Real(f64),
    Integer(i32),
    Boolean(bool),
    String(String),
}

impl Value {
    pub fn variable_type(&self) -> VariableType {
        match self {
            Value::Real(_) => VariableType::Real,
            Value::Integer(_) => VariableType::Integer,
            Value::Boolean(_) => VariableType::Boolean,
            Value::String(_) => VariableType::String,
        }
    }

    /// The type's zero value, used to seed a connection buffer before any
    /// source has been read.
    pub fn zero_of(ty: VariableType) -> Value {
        match ty {
            VariableType::Real => Value::Real(0.0),
            VariableType::Integer => Value::Integer(0),
            VariableType::Boolean => Value::Boolean(false),
            VariableType::String => Value::String(String::new()),
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Static per-variable description, as it would be read from a model
/// description document (out of scope to parse here; constructed directly
/// by the slave implementation or a test fixture).
#[derive(Clone, Debug, PartialEq)]
pub struct VariableDescription {
    pub name: String,
    pub value_reference: ValueReference,
    pub variable_type: VariableType,
    pub causality: Causality,
    pub variability: Variability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causality_round_trips_through_display_and_from_str() {
        for c in [
            Causality::Parameter,
            Causality::CalculatedParameter,
            Causality::Input,
            Causality::Output,
            Causality::Local,
            Causality::Independent,
        ] {
            let s = c.to_string();
            assert_eq!(Causality::from_str(&s).unwrap(), c);
        }
    }

    #[test]
    fn output_and_input_like_are_disjoint() {
        assert!(Causality::Output.is_output_like());
        assert!(!Causality::Output.is_input_like());
        assert!(Causality::Input.is_input_like());
        assert!(!Causality::Input.is_output_like());
        assert!(!Causality::Local.is_input_like());
        assert!(!Causality::Local.is_output_like());
    }
}
