//! Graph container: an arena of vertices forming a directed acyclic graph,
//! with exclusive parent-owns-child nesting via `Subgraph` vertices.

pub mod ops;

use crate::ir::ops::{AnyOp, Op, OpKind};
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum IrError {
    #[error("unknown vertex {0}")]
    UnknownVertex(VertexId),
    #[error("reference to nonexistent output port {port}")]
    InvalidPort { port: PortRef },
    #[error("vertex {vertex} is still referenced by {referenced_by:?}")]
    DanglingReference {
        vertex: VertexId,
        /// `None` when the reference comes from a declared graph output.
        referenced_by: Option<VertexId>,
    },
    #[error("non-input vertex {0} has no input edges")]
    MissingInputs(VertexId),
    #[error("input vertex {0} cannot have input edges")]
    InputWithInputs(VertexId),
    #[error("duplicate vertex id {0}")]
    DuplicateVertexId(VertexId),
    #[error("declared graph inputs do not match the set of input vertices")]
    InputListMismatch,
    #[error("graph contains a reference cycle")]
    CycleDetected,
    #[error("invalid subgraph splice: {0}")]
    InvalidSplice(String),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Stable vertex identity within one container. Never reused after removal.
#[derive(
    Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct VertexId(usize);

impl VertexId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Reference to one output port of a producing vertex.
#[derive(
    Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct PortRef {
    pub vertex: VertexId,
    pub output: usize,
}

impl PortRef {
    pub fn new(vertex: VertexId, output: usize) -> Self {
        Self { vertex, output }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.vertex, self.output)
    }
}

/// One atomic computational unit. Identity and operation kind are fixed at
/// creation; configuration changes go through the rewrite or pruning paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    name: String,
    inputs: Vec<PortRef>,
    output_shapes: Vec<Shape>,
    op: AnyOp,
}

impl Vertex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[PortRef] {
        &self.inputs
    }

    pub fn output_shapes(&self) -> &[Shape] {
        &self.output_shapes
    }

    pub fn op(&self) -> &AnyOp {
        &self.op
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

/// Input reference used while splicing replacement vertices, before the
/// replacements have real ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplicePort {
    Existing(PortRef),
    New { vertex: usize, output: usize },
}

/// Replacement vertex description consumed by [`GraphContainer::replace_subgraph`].
#[derive(Debug, Clone)]
pub struct SpliceVertex {
    pub name: String,
    pub inputs: Vec<SplicePort>,
    pub op: AnyOp,
}

/// Arena of vertices plus the declared external interface. Acyclic by
/// construction: `add_vertex` only accepts references to vertices already
/// present, and every bulk mutation re-validates before committing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphContainer {
    vertices: HashMap<VertexId, Vertex>,
    /// Insertion order; drives every deterministic traversal.
    order: Vec<VertexId>,
    inputs: Vec<VertexId>,
    outputs: Vec<PortRef>,
    next_vertex_id: usize,
}

impl GraphContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    pub fn require(&self, id: VertexId) -> Result<&Vertex, IrError> {
        self.vertices.get(&id).ok_or(IrError::UnknownVertex(id))
    }

    /// Vertex ids in insertion order.
    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.order.iter().copied()
    }

    pub fn inputs(&self) -> &[VertexId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortRef] {
        &self.outputs
    }

    pub fn output_shape(&self, port: PortRef) -> Result<&Shape, IrError> {
        self.require(port.vertex)?
            .output_shapes
            .get(port.output)
            .ok_or(IrError::InvalidPort { port })
    }

    pub fn declared_input_shape(&self, slot: usize) -> Option<&Shape> {
        let id = *self.inputs.get(slot)?;
        self.vertices.get(&id)?.output_shapes.first()
    }

    pub fn declared_output_shapes(&self) -> Option<Vec<Shape>> {
        self.outputs
            .iter()
            .map(|port| self.output_shape(*port).ok().cloned())
            .collect()
    }

    /// All (consumer, input slot) pairs reading any output of `id`.
    pub fn consumers(&self, id: VertexId) -> Vec<(VertexId, usize)> {
        let mut result = Vec::new();
        for other in &self.order {
            let vertex = &self.vertices[other];
            for (slot, port) in vertex.inputs.iter().enumerate() {
                if port.vertex == id {
                    result.push((*other, slot));
                }
            }
        }
        result
    }

    pub fn add_vertex(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<PortRef>,
        op: AnyOp,
    ) -> Result<VertexId, IrError> {
        let input_shapes = self.resolve_input_shapes(&inputs)?;
        let id = VertexId(self.next_vertex_id);
        if op.kind() == OpKind::Input {
            if !inputs.is_empty() {
                return Err(IrError::InputWithInputs(id));
            }
        } else if inputs.is_empty() {
            return Err(IrError::MissingInputs(id));
        }
        let output_shapes = op.infer_output_shapes(&input_shapes)?;
        self.next_vertex_id += 1;
        if op.kind() == OpKind::Input {
            self.inputs.push(id);
        }
        self.vertices.insert(
            id,
            Vertex {
                name: name.into(),
                inputs,
                output_shapes,
                op,
            },
        );
        self.order.push(id);
        Ok(id)
    }

    /// Removes a vertex. Fails with `DanglingReference` if any remaining
    /// vertex or declared graph output still references it.
    pub fn remove_vertex(&mut self, id: VertexId) -> Result<Vertex, IrError> {
        self.require(id)?;
        for other in &self.order {
            if *other == id {
                continue;
            }
            if self.vertices[other].inputs.iter().any(|p| p.vertex == id) {
                return Err(IrError::DanglingReference {
                    vertex: id,
                    referenced_by: Some(*other),
                });
            }
        }
        if self.outputs.iter().any(|p| p.vertex == id) {
            return Err(IrError::DanglingReference {
                vertex: id,
                referenced_by: None,
            });
        }
        self.order.retain(|v| *v != id);
        self.inputs.retain(|v| *v != id);
        Ok(self.vertices.remove(&id).expect("checked above"))
    }

    /// Declares the ordered external outputs of the container.
    pub fn set_outputs(&mut self, outputs: Vec<PortRef>) -> Result<(), IrError> {
        for port in &outputs {
            self.output_shape(*port)?;
        }
        self.outputs = outputs;
        Ok(())
    }

    /// Deterministic topological order: ties broken by insertion order, so
    /// repeated calls on an unmodified container return the same permutation.
    pub fn topological_order(&self) -> Vec<VertexId> {
        self.kahn()
            .expect("container invariant violated: reference cycle")
    }

    fn kahn(&self) -> Result<Vec<VertexId>, IrError> {
        let position: HashMap<VertexId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, v)| (*v, i))
            .collect();
        let mut indegree: HashMap<VertexId, usize> = HashMap::new();
        let mut successors: HashMap<VertexId, Vec<VertexId>> = HashMap::new();
        for id in &self.order {
            indegree.entry(*id).or_insert(0);
            for port in &self.vertices[id].inputs {
                *indegree.entry(*id).or_insert(0) += 1;
                successors.entry(port.vertex).or_default().push(*id);
            }
        }
        let mut ready: BinaryHeap<Reverse<(usize, VertexId)>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| Reverse((position[v], *v)))
            .collect();
        let mut result = Vec::with_capacity(self.order.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            result.push(id);
            if let Some(next) = successors.get(&id) {
                for succ in next {
                    let d = indegree.get_mut(succ).expect("successor tracked");
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse((position[succ], *succ)));
                    }
                }
            }
        }
        if result.len() == self.order.len() {
            Ok(result)
        } else {
            Err(IrError::CycleDetected)
        }
    }

    /// Atomically replaces the vertices in `old` with the given replacement
    /// set, rewiring all external references through `rewires` (a map from
    /// old output ports to surviving or replacement ports). Validates the
    /// whole splice on a scratch copy; on any failure the container is left
    /// untouched.
    pub fn replace_subgraph(
        &mut self,
        old: &[VertexId],
        replacements: Vec<SpliceVertex>,
        rewires: &[(PortRef, SplicePort)],
    ) -> Result<Vec<VertexId>, IrError> {
        let old_set: HashSet<VertexId> = old.iter().copied().collect();
        for id in old {
            self.require(*id)?;
        }

        let mut scratch = self.clone();

        // Install replacements first; they may only reference surviving
        // vertices or earlier replacements.
        let mut new_ids = Vec::with_capacity(replacements.len());
        for spliced in replacements {
            let mut inputs = Vec::with_capacity(spliced.inputs.len());
            for port in spliced.inputs {
                inputs.push(resolve_splice_port(port, &old_set, &new_ids)?);
            }
            new_ids.push(scratch.add_vertex(spliced.name, inputs, spliced.op)?);
        }

        let rewire_map: HashMap<PortRef, SplicePort> = rewires.iter().copied().collect();
        let survivors: Vec<VertexId> = scratch
            .order
            .iter()
            .copied()
            .filter(|id| !old_set.contains(id))
            .collect();
        for id in survivors {
            let ports: Vec<PortRef> = scratch.vertices[&id].inputs.clone();
            let mut rewired = Vec::with_capacity(ports.len());
            for port in ports {
                rewired.push(if old_set.contains(&port.vertex) {
                    let target = rewire_map.get(&port).copied().ok_or(
                        IrError::DanglingReference {
                            vertex: port.vertex,
                            referenced_by: Some(id),
                        },
                    )?;
                    resolve_splice_port(target, &old_set, &new_ids)?
                } else {
                    port
                });
            }
            scratch
                .vertices
                .get_mut(&id)
                .expect("survivor present")
                .inputs = rewired;
        }
        let mut outputs = scratch.outputs.clone();
        for port in &mut outputs {
            if old_set.contains(&port.vertex) {
                let target =
                    rewire_map
                        .get(port)
                        .copied()
                        .ok_or(IrError::DanglingReference {
                            vertex: port.vertex,
                            referenced_by: None,
                        })?;
                *port = resolve_splice_port(target, &old_set, &new_ids)?;
            }
        }
        scratch.outputs = outputs;

        for id in old {
            scratch.order.retain(|v| v != id);
            scratch.inputs.retain(|v| v != id);
            scratch.vertices.remove(id);
        }

        scratch.refresh_shapes()?;
        *self = scratch;
        Ok(new_ids)
    }

    /// Replaces every `Subgraph` vertex by its body, recursively, yielding a
    /// flat container. Child vertex names are qualified with the owning
    /// vertex's name.
    pub fn inline_all_subgraphs(&mut self) -> Result<(), IrError> {
        loop {
            let next = self
                .order
                .iter()
                .copied()
                .find(|id| self.vertices[id].kind() == OpKind::Subgraph);
            match next {
                Some(id) => self.inline_subgraph(id)?,
                None => return Ok(()),
            }
        }
    }

    fn inline_subgraph(&mut self, id: VertexId) -> Result<(), IrError> {
        let vertex = self.require(id)?;
        let AnyOp::Subgraph(sub) = &vertex.op else {
            return Err(IrError::InvalidSplice(format!(
                "vertex {id} is not a subgraph"
            )));
        };
        let outer_name = vertex.name.clone();
        let outer_inputs = vertex.inputs.clone();
        let body = sub.body().clone();

        let child_inputs = body.inputs().to_vec();
        let child_slot: HashMap<VertexId, usize> = child_inputs
            .iter()
            .enumerate()
            .map(|(slot, v)| (*v, slot))
            .collect();

        // Interior child vertices in topological order, with their index in
        // the replacement list.
        let mut interior_index: HashMap<VertexId, usize> = HashMap::new();
        let mut replacements = Vec::new();
        for child_id in body.topological_order() {
            if child_slot.contains_key(&child_id) {
                continue;
            }
            let child = &body.vertices[&child_id];
            let mut inputs = Vec::with_capacity(child.inputs.len());
            for port in &child.inputs {
                inputs.push(match child_slot.get(&port.vertex) {
                    Some(slot) => SplicePort::Existing(outer_inputs[*slot]),
                    None => SplicePort::New {
                        vertex: interior_index[&port.vertex],
                        output: port.output,
                    },
                });
            }
            interior_index.insert(child_id, replacements.len());
            replacements.push(SpliceVertex {
                name: format!("{}/{}", outer_name, child.name),
                inputs,
                op: child.op.clone(),
            });
        }

        let mut rewires = Vec::new();
        for (j, port) in body.outputs().iter().enumerate() {
            let target = match child_slot.get(&port.vertex) {
                Some(slot) => SplicePort::Existing(outer_inputs[*slot]),
                None => SplicePort::New {
                    vertex: interior_index[&port.vertex],
                    output: port.output,
                },
            };
            rewires.push((PortRef::new(id, j), target));
        }

        self.replace_subgraph(&[id], replacements, &rewires)?;
        Ok(())
    }

    /// Recomputes every cached output shape in topological order and
    /// re-checks the structural invariants. Any inconsistency fails before
    /// partial state can leak: callers invoke this on scratch copies.
    pub(crate) fn refresh_shapes(&mut self) -> Result<(), IrError> {
        let order = self.kahn()?;
        for id in order {
            let vertex = &self.vertices[&id];
            if vertex.kind() == OpKind::Input {
                if !vertex.inputs.is_empty() {
                    return Err(IrError::InputWithInputs(id));
                }
            } else if vertex.inputs.is_empty() {
                return Err(IrError::MissingInputs(id));
            }
            let input_ports = vertex.inputs.clone();
            let input_shapes = self.resolve_input_shapes(&input_ports)?;
            let vertex = self.vertices.get_mut(&id).expect("walked above");
            vertex.output_shapes = vertex.op.infer_output_shapes(&input_shapes)?;
        }
        let outputs = self.outputs.clone();
        for port in &outputs {
            self.output_shape(*port)?;
        }
        Ok(())
    }

    fn resolve_input_shapes(&self, inputs: &[PortRef]) -> Result<Vec<Shape>, IrError> {
        inputs
            .iter()
            .map(|port| self.output_shape(*port).cloned())
            .collect()
    }

    /// Rebuilds a container from serialized parts, re-validating every
    /// invariant (reference resolution, acyclicity, shape consistency).
    pub(crate) fn from_parts(
        entries: Vec<(VertexId, String, Vec<PortRef>, AnyOp)>,
        inputs: Vec<VertexId>,
        outputs: Vec<PortRef>,
    ) -> Result<Self, IrError> {
        let mut graph = Self::new();
        for (id, name, vertex_inputs, op) in entries {
            if graph.vertices.contains_key(&id) {
                return Err(IrError::DuplicateVertexId(id));
            }
            graph.next_vertex_id = graph.next_vertex_id.max(id.0 + 1);
            graph.order.push(id);
            graph.vertices.insert(
                id,
                Vertex {
                    name,
                    inputs: vertex_inputs,
                    output_shapes: vec![],
                    op,
                },
            );
        }
        let declared: HashSet<VertexId> = inputs.iter().copied().collect();
        let actual: HashSet<VertexId> = graph
            .order
            .iter()
            .copied()
            .filter(|id| graph.vertices[id].kind() == OpKind::Input)
            .collect();
        if declared.len() != inputs.len() || declared != actual {
            return Err(IrError::InputListMismatch);
        }
        graph.inputs = inputs;
        graph.outputs = outputs;
        graph.refresh_shapes()?;
        Ok(graph)
    }

    /// Mutable access to a vertex's operation for boundary-preserving
    /// edits. Callers must not change the inferred output shapes.
    pub(crate) fn vertex_op_mut(&mut self, id: VertexId) -> Option<&mut AnyOp> {
        self.vertices.get_mut(&id).map(|v| &mut v.op)
    }

    pub(crate) fn shrink_vertex_output(
        &mut self,
        id: VertexId,
        output: usize,
        keep: &[usize],
    ) -> Result<(), IrError> {
        let vertex = self
            .vertices
            .get_mut(&id)
            .ok_or(IrError::UnknownVertex(id))?;
        vertex.op.shrink_output_channels(output, keep)?;
        Ok(())
    }

    pub(crate) fn shrink_vertex_input(
        &mut self,
        id: VertexId,
        input: usize,
        keep: &[usize],
    ) -> Result<(), IrError> {
        let vertex = self
            .vertices
            .get_mut(&id)
            .ok_or(IrError::UnknownVertex(id))?;
        vertex.op.shrink_input_channels(input, keep)?;
        Ok(())
    }
}

fn resolve_splice_port(
    port: SplicePort,
    old_set: &HashSet<VertexId>,
    new_ids: &[VertexId],
) -> Result<PortRef, IrError> {
    match port {
        SplicePort::Existing(port) => {
            if old_set.contains(&port.vertex) {
                Err(IrError::InvalidSplice(format!(
                    "replacement references removed port {port}"
                )))
            } else {
                Ok(port)
            }
        }
        SplicePort::New { vertex, output } => match new_ids.get(vertex) {
            Some(id) => Ok(PortRef::new(*id, output)),
            None => Err(IrError::InvalidSplice(format!(
                "replacement references later replacement #{vertex}"
            ))),
        },
    }
}
