//! The function stage: stateless, typed computational blocks that may sit
//! in a connection path between two variable endpoints.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::variable::{Causality, VariableId, VariableType};

/// A function parameter's declared bounds and default, used to validate
/// instantiation-time parameter values (`Error::DomainError` on violation)
/// and to resolve IO group sizes expressed as placeholders.
#[derive(Clone, Debug)]
pub struct ParameterDescription {
    pub name: String,
    pub default: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// An IO group's element count: either fixed at the type level, or a
/// placeholder resolved from a parameter value at instantiation time.
#[derive(Clone, Copy, Debug)]
pub enum IoCount {
    Fixed(usize),
    Parameter(usize),
}

#[derive(Clone, Debug)]
pub struct FunctionIoDescription {
    pub name: String,
    pub value_type: VariableType,
    pub causality: Causality,
}

#[derive(Clone, Debug)]
pub struct FunctionIoGroupDescription {
    pub name: String,
    pub count: IoCount,
    pub ios: Vec<FunctionIoDescription>,
}

#[derive(Clone, Debug)]
pub struct FunctionTypeDescription {
    pub name: String,
    pub parameters: Vec<ParameterDescription>,
    pub io_groups: Vec<FunctionIoGroupDescription>,
}

/// Identifies one scalar IO slot on a function instance: which group,
/// which instance of that group (groups may be repeated per their
/// resolved count), and which IO within the group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionIoReference {
    pub group: usize,
    pub group_instance: usize,
    pub io: usize,
}

impl FunctionIoReference {
    pub fn new(group: usize, group_instance: usize, io: usize) -> Self {
        FunctionIoReference { group, group_instance, io }
    }
}

/// The static wiring of one function instance's IO to slave variables:
/// which slave variable feeds each input, and which slave variable
/// receives each output. Built incrementally by
/// `Execution::connect_function_input`/`connect_function_output` rather
/// than at `instantiate` time, since wiring is a connection-graph
/// concern, not a property of the function type itself. Every entry
/// carries the scalar type resolved at bind time so the transfer phase
/// can read/write the right typed getter without consulting the
/// function's description again.
#[derive(Clone, Debug, Default)]
pub struct FunctionBinding {
    pub inputs: Vec<(FunctionIoReference, VariableId, VariableType)>,
    pub outputs: Vec<(FunctionIoReference, VariableId, VariableType)>,
}

/// A concrete, instantiated function block. Its IO layout is immutable
/// once instantiated.
pub trait FunctionInstance: Send {
    fn set_real_io(&mut self, reference: FunctionIoReference, value: f64);
    fn set_integer_io(&mut self, reference: FunctionIoReference, value: i32);
    fn get_real_io(&self, reference: FunctionIoReference) -> f64;
    fn get_integer_io(&self, reference: FunctionIoReference) -> i32;

    /// Performs the function's calculation. Called exactly once per
    /// transfer, after all inputs have been set and before any output is
    /// read.
    fn calculate(&mut self);
}

/// A factory for [`FunctionInstance`]s of a given shape.
pub trait FunctionType: Send + Sync {
    fn description(&self) -> &FunctionTypeDescription;

    /// Instantiates a function of this type, resolving any IO-group-size
    /// placeholders against `parameters` and validating each supplied
    /// parameter value against its declared `[min, max]` (`domain_error`
    /// on violation).
    fn instantiate(&self, parameters: &HashMap<usize, f64>) -> Result<Box<dyn FunctionInstance>>;
}

/// Validates and resolves a single parameter value against its
/// description, falling back to the default when absent. Shared by
/// concrete `FunctionType` impls via [`resolve_parameter`].
pub fn resolve_parameter(description: &FunctionTypeDescription, parameters: &HashMap<usize, f64>, index: usize) -> Result<f64> {
    let param = description
        .parameters
        .get(index)
        .ok_or_else(|| Error::DomainError(format!("function {} has no parameter #{index}", description.name)))?;
    let value = parameters.get(&index).copied().unwrap_or(param.default);
    if let Some(min) = param.min {
        if value < min {
            return Err(Error::DomainError(format!(
                "{}:{} = {value} is below minimum {min}",
                description.name, param.name
            )));
        }
    }
    if let Some(max) = param.max {
        if value > max {
            return Err(Error::DomainError(format!(
                "{}:{} = {value} is above maximum {max}",
                description.name, param.name
            )));
        }
    }
    Ok(value)
}

/// Resolves an IO group's element count against already-resolved
/// parameter values (a `Fixed` count passes through unchanged).
pub fn resolve_count(count: IoCount, resolved_params: &[f64]) -> usize {
    match count {
        IoCount::Fixed(n) => n,
        IoCount::Parameter(index) => resolved_params[index].round() as usize,
    }
}

/// A built-in function type summing `n` real inputs (`n` a parameter,
/// resolved at instantiation) into a single real output. Demonstrates
/// parameter-driven IO sizing.
pub struct SumFunctionType {
    description: FunctionTypeDescription,
}

impl SumFunctionType {
    pub fn new() -> Self {
        SumFunctionType {
            description: FunctionTypeDescription {
                name: "sum".into(),
                parameters: vec![ParameterDescription {
                    name: "n".into(),
                    default: 2.0,
                    min: Some(1.0),
                    max: Some(64.0),
                }],
                io_groups: vec![
                    FunctionIoGroupDescription {
                        name: "inputs".into(),
                        count: IoCount::Parameter(0),
                        ios: vec![FunctionIoDescription {
                            name: "u".into(),
                            value_type: VariableType::Real,
                            causality: Causality::Input,
                        }],
                    },
                    FunctionIoGroupDescription {
                        name: "output".into(),
                        count: IoCount::Fixed(1),
                        ios: vec![FunctionIoDescription {
                            name: "y".into(),
                            value_type: VariableType::Real,
                            causality: Causality::Output,
                        }],
                    },
                ],
            },
        }
    }
}

impl Default for SumFunctionType {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionType for SumFunctionType {
    fn description(&self) -> &FunctionTypeDescription {
        &self.description
    }

    fn instantiate(&self, parameters: &HashMap<usize, f64>) -> Result<Box<dyn FunctionInstance>> {
        let n_param = resolve_parameter(&self.description, parameters, 0)?;
        let n = resolve_count(IoCount::Parameter(0), &[n_param]);
        Ok(Box::new(SumFunctionInstance {
            inputs: vec![0.0; n],
            output: 0.0,
        }))
    }
}

struct SumFunctionInstance {
    inputs: Vec<f64>,
    output: f64,
}

impl FunctionInstance for SumFunctionInstance {
    fn set_real_io(&mut self, reference: FunctionIoReference, value: f64) {
        if reference.group == 0 {
            self.inputs[reference.group_instance] = value;
        }
    }

    fn set_integer_io(&mut self, _reference: FunctionIoReference, _value: i32) {}

    fn get_real_io(&self, reference: FunctionIoReference) -> f64 {
        if reference.group == 1 {
            self.output
        } else {
            self.inputs[reference.group_instance]
        }
    }

    fn get_integer_io(&self, _reference: FunctionIoReference) -> i32 {
        0
    }

    fn calculate(&mut self) {
        self.output = self.inputs.iter().sum();
    }
}

/// A built-in gain function type: a single real input scaled by a bounded
/// `gain` parameter. Demonstrates `domain_error` on an out-of-range
/// parameter value.
pub struct GainFunctionType {
    description: FunctionTypeDescription,
}

impl GainFunctionType {
    pub fn new(min_gain: f64, max_gain: f64) -> Self {
        GainFunctionType {
            description: FunctionTypeDescription {
                name: "gain".into(),
                parameters: vec![ParameterDescription {
                    name: "gain".into(),
                    default: 1.0,
                    min: Some(min_gain),
                    max: Some(max_gain),
                }],
                io_groups: vec![FunctionIoGroupDescription {
                    name: "io".into(),
                    count: IoCount::Fixed(1),
                    ios: vec![
                        FunctionIoDescription {
                            name: "u".into(),
                            value_type: VariableType::Real,
                            causality: Causality::Input,
                        },
                        FunctionIoDescription {
                            name: "y".into(),
                            value_type: VariableType::Real,
                            causality: Causality::Output,
                        },
                    ],
                }],
            },
        }
    }
}

impl FunctionType for GainFunctionType {
    fn description(&self) -> &FunctionTypeDescription {
        &self.description
    }

    fn instantiate(&self, parameters: &HashMap<usize, f64>) -> Result<Box<dyn FunctionInstance>> {
        let gain = resolve_parameter(&self.description, parameters, 0)?;
        Ok(Box::new(GainFunctionInstance { gain, u: 0.0, y: 0.0 }))
    }
}

struct GainFunctionInstance {
    gain: f64,
    u: f64,
    y: f64,
}

impl FunctionInstance for GainFunctionInstance {
    fn set_real_io(&mut self, reference: FunctionIoReference, value: f64) {
        if reference.io == 0 {
            self.u = value;
        }
    }

    fn set_integer_io(&mut self, _reference: FunctionIoReference, _value: i32) {}

    fn get_real_io(&self, reference: FunctionIoReference) -> f64 {
        if reference.io == 1 {
            self.y
        } else {
            self.u
        }
    }

    fn get_integer_io(&self, _reference: FunctionIoReference) -> i32 {
        0
    }

    fn calculate(&mut self) {
        self.y = self.gain * self.u;
    }
}
