//! Static slave metadata.

use crate::variable::{ValueReference, VariableDescription};

/// The static metadata a slave reports through `model_description()`.
/// Loading this from an actual FMU model description XML is an external
/// collaborator's job; the engine only needs the shape.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescription {
    pub uuid: String,
    pub name: String,
    pub variables: Vec<VariableDescription>,
    /// Whether the slave supports `save_state`/`restore_state`/`release_state`.
    pub can_save_state: bool,
}

impl ModelDescription {
    pub fn variable(&self, vr: ValueReference) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.value_reference == vr)
    }
}
