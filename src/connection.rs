//! The connection graph: typed variable endpoints wired through scalar,
//! linear-transformation, sum and vector-sum routing.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::variable::{Value, VariableId, VariableType};

/// A single connection between one or more source endpoints and a
/// destination, carrying a pure transfer function.
#[derive(Clone, Debug)]
pub enum Connection {
    /// 1-to-1, identity. Source and destination types must match exactly.
    Scalar {
        source: VariableId,
        destination: VariableId,
        value_type: VariableType,
    },
    /// 1-to-1, `y = factor*x + offset`, reals only.
    LinearTransformation {
        source: VariableId,
        destination: VariableId,
        factor: f64,
        offset: f64,
    },
    /// N-to-1, reals or integers; delivered value is the arithmetic sum in
    /// the common source type.
    Sum {
        sources: Vec<VariableId>,
        destination: VariableId,
        value_type: VariableType,
    },
    /// N vectors of equal arity summed elementwise into one vector of that
    /// arity.
    VectorSum {
        /// `groups[n][k]` is the k-th element of the n-th source vector.
        groups: Vec<Vec<VariableId>>,
        /// `destinations[k]` receives the elementwise sum over `k`.
        destinations: Vec<VariableId>,
        value_type: VariableType,
    },
}

impl Connection {
    pub fn sources(&self) -> Vec<VariableId> {
        match self {
            Connection::Scalar { source, .. } | Connection::LinearTransformation { source, .. } => {
                vec![*source]
            }
            Connection::Sum { sources, .. } => sources.clone(),
            Connection::VectorSum { groups, .. } => groups.iter().flatten().copied().collect(),
        }
    }

    pub fn destinations(&self) -> Vec<VariableId> {
        match self {
            Connection::Scalar { destination, .. } | Connection::LinearTransformation { destination, .. } => {
                vec![*destination]
            }
            Connection::Sum { destination, .. } => vec![*destination],
            Connection::VectorSum { destinations, .. } => destinations.clone(),
        }
    }

    /// The common scalar type this connection routes. Used by the
    /// scheduler's transfer phase to pick the right typed getter when
    /// reading a source endpoint.
    pub(crate) fn value_type(&self) -> VariableType {
        match self {
            Connection::Scalar { value_type, .. }
            | Connection::Sum { value_type, .. }
            | Connection::VectorSum { value_type, .. } => *value_type,
            Connection::LinearTransformation { .. } => VariableType::Real,
        }
    }

    fn validate_shape(&self) -> Result<()> {
        match self {
            Connection::LinearTransformation { .. } => Ok(()),
            Connection::Sum { value_type, .. } => match value_type {
                VariableType::Real | VariableType::Integer => Ok(()),
                _ => Err(Error::InvalidSystemStructure(
                    "sum connections require a real or integer common type".into(),
                )),
            },
            Connection::VectorSum { groups, destinations, .. } => {
                if groups.is_empty() {
                    return Err(Error::InvalidSystemStructure(
                        "vector sum connection requires at least one source group".into(),
                    ));
                }
                let arity = destinations.len();
                if groups.iter().any(|g| g.len() != arity) {
                    return Err(Error::InvalidSystemStructure(
                        "vector sum connection requires all groups to have identical arity".into(),
                    ));
                }
                Ok(())
            }
            Connection::Scalar { .. } => Ok(()),
        }
    }

    fn resolve(&self, source_values: &HashMap<VariableId, Value>) -> Result<Vec<(VariableId, Value)>> {
        let read = |id: &VariableId| -> Value {
            source_values
                .get(id)
                .cloned()
                .unwrap_or_else(|| Value::zero_of(self.value_type()))
        };

        match self {
            Connection::Scalar { source, destination, .. } => Ok(vec![(*destination, read(source))]),

            Connection::LinearTransformation {
                source,
                destination,
                factor,
                offset,
            } => {
                let x = read(source).as_real().ok_or_else(|| {
                    Error::InvalidSystemStructure("linear transformation connection requires real source".into())
                })?;
                Ok(vec![(*destination, Value::Real(factor * x + offset))])
            }

            Connection::Sum {
                sources,
                destination,
                value_type,
            } => {
                let value = match value_type {
                    VariableType::Real => {
                        let sum: f64 = sources.iter().map(|s| read(s).as_real().unwrap_or(0.0)).sum();
                        Value::Real(sum)
                    }
                    VariableType::Integer => {
                        let mut acc: i32 = 0;
                        for s in sources {
                            let v = read(s).as_integer().unwrap_or(0);
                            acc = acc.checked_add(v).ok_or_else(|| {
                                Error::InvalidSystemStructure(format!(
                                    "integer sum connection into {destination:?} overflowed"
                                ))
                            })?;
                        }
                        Value::Integer(acc)
                    }
                    _ => unreachable!("validated at add_connection time"),
                };
                Ok(vec![(*destination, value)])
            }

            Connection::VectorSum {
                groups,
                destinations,
                value_type,
            } => {
                let arity = destinations.len();
                let mut out = Vec::with_capacity(arity);
                for k in 0..arity {
                    let value = match value_type {
                        VariableType::Real => {
                            let sum: f64 = groups.iter().map(|g| read(&g[k]).as_real().unwrap_or(0.0)).sum();
                            Value::Real(sum)
                        }
                        VariableType::Integer => {
                            let mut acc: i32 = 0;
                            for g in groups {
                                let v = read(&g[k]).as_integer().unwrap_or(0);
                                acc = acc.checked_add(v).ok_or_else(|| {
                                    Error::InvalidSystemStructure(format!(
                                        "integer vector sum connection into {:?} overflowed",
                                        destinations[k]
                                    ))
                                })?;
                            }
                            Value::Integer(acc)
                        }
                        _ => unreachable!("validated at add_connection time"),
                    };
                    out.push((destinations[k], value));
                }
                Ok(out)
            }
        }
    }
}

/// The routing substrate: a set of [`Connection`]s plus the invariant that
/// every destination has exactly one source path.
#[derive(Default)]
pub struct ConnectionGraph {
    connections: Vec<Connection>,
    /// Destination -> owning connection index, to reject a second driver.
    destination_owner: HashMap<VariableId, usize>,
    /// Latest value read from each source endpoint.
    source_values: HashMap<VariableId, Value>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        ConnectionGraph::default()
    }

    /// Adds a connection after validating its shape and that none of its
    /// destinations are already driven.
    pub fn add_connection(&mut self, connection: Connection) -> Result<usize> {
        connection.validate_shape()?;
        for dest in connection.destinations() {
            if self.destination_owner.contains_key(&dest) {
                return Err(Error::InvalidSystemStructure(format!(
                    "{dest:?} already has a connected source"
                )));
            }
        }
        let index = self.connections.len();
        for dest in connection.destinations() {
            self.destination_owner.insert(dest, index);
        }
        self.connections.push(connection);
        Ok(index)
    }

    /// Removes every connection touching `simulator`, as either a source
    /// or destination endpoint. Removing a slave between steps removes
    /// all connections touching it.
    pub fn remove_connections_touching(&mut self, simulator: crate::SimulatorIndex) -> Vec<Connection> {
        let mut kept = Vec::with_capacity(self.connections.len());
        let mut removed = Vec::new();
        for conn in std::mem::take(&mut self.connections) {
            let touches = conn.sources().iter().any(|s| s.simulator == simulator)
                || conn.destinations().iter().any(|d| d.simulator == simulator);
            if touches {
                removed.push(conn);
            } else {
                kept.push(conn);
            }
        }
        self.connections = kept;
        self.destination_owner.clear();
        for (index, conn) in self.connections.iter().enumerate() {
            for dest in conn.destinations() {
                self.destination_owner.insert(dest, index);
            }
        }
        self.source_values.retain(|id, _| id.simulator != simulator);
        removed
    }

    pub fn disconnect(&mut self, destination: VariableId) -> Option<Connection> {
        let index = self.destination_owner.remove(&destination)?;
        let conn = self.connections.remove(index);
        // Reindex owners above `index`.
        for owner in self.destination_owner.values_mut() {
            if *owner > index {
                *owner -= 1;
            }
        }
        Some(conn)
    }

    pub fn is_destination_connected(&self, destination: VariableId) -> bool {
        self.destination_owner.contains_key(&destination)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Stores the latest reading from a source endpoint.
    pub fn set_source_value(&mut self, id: VariableId, value: Value) {
        self.source_values.insert(id, value);
    }

    /// Computes every connection's destination values from the current
    /// source readings, invoked once per destination per transfer phase.
    pub fn resolve_all(&self) -> Result<Vec<(VariableId, Value)>> {
        let mut out = Vec::new();
        for conn in &self.connections {
            out.extend(conn.resolve(&self.source_values)?);
        }
        Ok(out)
    }

    /// Snapshots the current source-value buffer for a `save_state` call.
    /// A save/restore cycle must restore connection buffers too.
    pub(crate) fn snapshot_sources(&self) -> HashMap<VariableId, Value> {
        self.source_values.clone()
    }

    pub(crate) fn restore_sources(&mut self, values: HashMap<VariableId, Value>) {
        self.source_values = values;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatorIndex;

    fn vid(sim: usize, vr: u32) -> VariableId {
        VariableId::new(SimulatorIndex(sim), vr.into())
    }

    #[test]
    fn scalar_connection_is_identity() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::Scalar {
                source: vid(0, 0),
                destination: vid(1, 0),
                value_type: VariableType::Real,
            })
            .unwrap();
        graph.set_source_value(vid(0, 0), Value::Real(5.0));
        let resolved = graph.resolve_all().unwrap();
        assert_eq!(resolved, vec![(vid(1, 0), Value::Real(5.0))]);
    }

    #[test]
    fn scalar_connection_defaults_to_zero_before_any_source_read() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::Scalar {
                source: vid(0, 0),
                destination: vid(1, 0),
                value_type: VariableType::Real,
            })
            .unwrap();
        let resolved = graph.resolve_all().unwrap();
        assert_eq!(resolved, vec![(vid(1, 0), Value::Real(0.0))]);
    }

    #[test]
    fn linear_transformation_applies_factor_and_offset() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::LinearTransformation {
                source: vid(0, 0),
                destination: vid(1, 0),
                factor: 1.3,
                offset: 50.0,
            })
            .unwrap();
        graph.set_source_value(vid(0, 0), Value::Real(2.0));
        let resolved = graph.resolve_all().unwrap();
        match resolved[0].1 {
            Value::Real(v) => assert!((v - 52.6).abs() < 1e-9),
            _ => panic!("expected real"),
        }
    }

    #[test]
    fn vector_sum_sums_elementwise() {
        let mut graph = ConnectionGraph::new();
        let v1 = [vid(1, 0), vid(1, 1), vid(1, 2)];
        let v2 = [vid(2, 0), vid(2, 1), vid(2, 2)];
        let v3 = [vid(3, 0), vid(3, 1), vid(3, 2)];
        let dest = [vid(4, 0), vid(4, 1), vid(4, 2)];
        graph
            .add_connection(Connection::VectorSum {
                groups: vec![v1.to_vec(), v2.to_vec(), v3.to_vec()],
                destinations: dest.to_vec(),
                value_type: VariableType::Real,
            })
            .unwrap();
        for (id, v) in v1.iter().zip([1.0, 2.0, 3.0]) {
            graph.set_source_value(*id, Value::Real(v));
        }
        for (id, v) in v2.iter().zip([4.0, 5.0, 6.0]) {
            graph.set_source_value(*id, Value::Real(v));
        }
        for (id, v) in v3.iter().zip([7.0, 8.0, 9.0]) {
            graph.set_source_value(*id, Value::Real(v));
        }
        let resolved = graph.resolve_all().unwrap();
        let values: Vec<f64> = resolved.iter().map(|(_, v)| v.as_real().unwrap()).collect();
        assert_eq!(values, vec![12.0, 15.0, 18.0]);
    }

    #[test]
    fn duplicate_destination_driver_is_rejected() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::Scalar {
                source: vid(0, 0),
                destination: vid(1, 0),
                value_type: VariableType::Real,
            })
            .unwrap();
        let err = graph
            .add_connection(Connection::Scalar {
                source: vid(2, 0),
                destination: vid(1, 0),
                value_type: VariableType::Real,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSystemStructure(_)));
    }

    #[test]
    fn integer_sum_overflow_is_an_error() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::Sum {
                sources: vec![vid(0, 0), vid(1, 0)],
                destination: vid(2, 0),
                value_type: VariableType::Integer,
            })
            .unwrap();
        graph.set_source_value(vid(0, 0), Value::Integer(i32::MAX));
        graph.set_source_value(vid(1, 0), Value::Integer(1));
        assert!(graph.resolve_all().is_err());
    }

    #[test]
    fn removing_a_slave_drops_its_connections() {
        let mut graph = ConnectionGraph::new();
        graph
            .add_connection(Connection::Scalar {
                source: vid(0, 0),
                destination: vid(1, 0),
                value_type: VariableType::Real,
            })
            .unwrap();
        let removed = graph.remove_connections_touching(SimulatorIndex(1));
        assert_eq!(removed.len(), 1);
        assert!(!graph.is_destination_connected(vid(1, 0)));
    }
}
