//! Pattern-based graph rewriting: declarative local motifs, atomic
//! pattern application, and wrapping vertex subsets into sub-graph
//! vertices. Patterns are bounded linear chains, never arbitrary subgraph
//! isomorphism, so matching stays linear in graph size.

use crate::ir::ops::{AnyOp, InputOp, NormalizationOp, OpKind, SubgraphOp};
use crate::ir::{GraphContainer, IrError, PortRef, SplicePort, SpliceVertex, VertexId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("wrap target is not closed under internal dependency at vertex {vertex}")]
    NotConnected { vertex: VertexId },
    #[error("rewrite rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Linear motif: a chain of operation kinds connected through output 0,
/// with `exclusive` requiring interior links to have no other consumers
/// (no intervening branch).
#[derive(Debug, Clone)]
pub struct Pattern {
    pub steps: Vec<OpKind>,
    pub exclusive: bool,
}

impl Pattern {
    pub fn chain(steps: Vec<OpKind>) -> Self {
        Self {
            steps,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub vertices: Vec<VertexId>,
}

/// Replacement produced by a builder callback: new vertices plus the
/// rewiring of every old output port that the rest of the graph may still
/// reference.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub vertices: Vec<SpliceVertex>,
    pub rewires: Vec<(PortRef, SplicePort)>,
}

/// Lazily scans the current graph state for pattern occurrences, in
/// topological order of the chain head. Each call re-scans from scratch;
/// matches are never cached across mutations.
pub fn find_matches<'a>(
    graph: &'a GraphContainer,
    pattern: &'a Pattern,
) -> impl Iterator<Item = Match> + 'a {
    let order = graph.topological_order();
    order
        .into_iter()
        .filter_map(move |head| match_chain_at(graph, pattern, head))
}

fn match_chain_at(graph: &GraphContainer, pattern: &Pattern, head: VertexId) -> Option<Match> {
    let first = *pattern.steps.first()?;
    if graph.get(head)?.kind() != first {
        return None;
    }
    let mut vertices = vec![head];
    extend_chain(graph, pattern, head, 1, &mut vertices).then(|| Match { vertices })
}

/// Extends a partial chain by one step, trying every consumer that could
/// continue it and backtracking when a candidate dead-ends further down.
fn extend_chain(
    graph: &GraphContainer,
    pattern: &Pattern,
    current: VertexId,
    depth: usize,
    vertices: &mut Vec<VertexId>,
) -> bool {
    let Some(step) = pattern.steps.get(depth) else {
        return true;
    };
    let consumers = graph.consumers(current);
    if pattern.exclusive && consumers.len() != 1 {
        return false;
    }
    for (candidate, slot) in consumers {
        let Some(vertex) = graph.get(candidate) else {
            continue;
        };
        // The chain follows output 0 only.
        if vertex.kind() != *step || vertex.inputs()[slot] != PortRef::new(current, 0) {
            continue;
        }
        vertices.push(candidate);
        if extend_chain(graph, pattern, candidate, depth + 1, vertices) {
            return true;
        }
        vertices.pop();
    }
    false
}

/// Applies a replacement built from the matched vertices. The splice is
/// validated in full before commit: on any failure the container is left
/// exactly as it was.
pub fn apply<F>(graph: &mut GraphContainer, m: &Match, builder: F) -> Result<Vec<VertexId>, RewriteError>
where
    F: FnOnce(&GraphContainer, &Match) -> Result<Replacement, RewriteError>,
{
    for id in &m.vertices {
        graph.require(*id)?;
    }
    let replacement = builder(graph, m)?;
    let new_ids = graph.replace_subgraph(&m.vertices, replacement.vertices, &replacement.rewires)?;
    Ok(new_ids)
}

/// Groups a dependency-closed vertex subset into a new sub-graph vertex.
/// `boundary` declares, in order, the external ports the subset is allowed
/// to read; any other external dependency fails with `NotConnected`.
pub fn wrap(
    graph: &mut GraphContainer,
    members: &[VertexId],
    boundary: &[PortRef],
    name: impl Into<String>,
) -> Result<VertexId, RewriteError> {
    let name = name.into();
    let member_set: HashSet<VertexId> = members.iter().copied().collect();
    let boundary_slot: HashMap<PortRef, usize> = boundary
        .iter()
        .enumerate()
        .map(|(slot, port)| (*port, slot))
        .collect();

    for id in members {
        let vertex = graph.require(*id)?;
        if vertex.kind() == OpKind::Input {
            return Err(RewriteError::Rejected(format!(
                "graph input {id} cannot be wrapped"
            )));
        }
        for port in vertex.inputs() {
            if !member_set.contains(&port.vertex) && !boundary_slot.contains_key(port) {
                return Err(RewriteError::NotConnected { vertex: *id });
            }
        }
    }

    // Child outputs: member ports visible outside the subset, ordered by
    // the owning vertex's position for determinism.
    let mut exported: Vec<PortRef> = Vec::new();
    for id in graph.topological_order() {
        if !member_set.contains(&id) {
            continue;
        }
        let width = graph.get(id).map(|v| v.output_shapes().len()).unwrap_or(0);
        for output in 0..width {
            let port = PortRef::new(id, output);
            let externally_used = graph
                .consumers(id)
                .iter()
                .any(|(consumer, slot)| {
                    !member_set.contains(consumer)
                        && graph
                            .get(*consumer)
                            .map(|v| v.inputs()[*slot] == port)
                            .unwrap_or(false)
                })
                || graph.outputs().contains(&port);
            if externally_used {
                exported.push(port);
            }
        }
    }
    if exported.is_empty() {
        return Err(RewriteError::Rejected(format!(
            "subset for \"{name}\" has no externally visible outputs"
        )));
    }

    // Build the child container: one input vertex per boundary port, then
    // the members in topological order with remapped wiring.
    let mut body = GraphContainer::new();
    let mut child_input_ports = Vec::with_capacity(boundary.len());
    for (slot, port) in boundary.iter().enumerate() {
        let shape = graph.output_shape(*port)?.clone();
        let id = body.add_vertex(
            format!("{name}_in{slot}"),
            vec![],
            AnyOp::Input(InputOp::new(shape)),
        )?;
        child_input_ports.push(PortRef::new(id, 0));
    }
    let mut child_of: HashMap<VertexId, VertexId> = HashMap::new();
    for id in graph.topological_order() {
        if !member_set.contains(&id) {
            continue;
        }
        let vertex = graph.require(id)?;
        let inputs = vertex
            .inputs()
            .iter()
            .map(|port| {
                if let Some(slot) = boundary_slot.get(port) {
                    child_input_ports[*slot]
                } else {
                    PortRef::new(child_of[&port.vertex], port.output)
                }
            })
            .collect();
        let child_id = body.add_vertex(vertex.name().to_string(), inputs, vertex.op().clone())?;
        child_of.insert(id, child_id);
    }
    body.set_outputs(
        exported
            .iter()
            .map(|port| PortRef::new(child_of[&port.vertex], port.output))
            .collect(),
    )?;

    let wrapper = SpliceVertex {
        name,
        inputs: boundary.iter().map(|p| SplicePort::Existing(*p)).collect(),
        op: AnyOp::Subgraph(SubgraphOp::new(body)),
    };
    let rewires = exported
        .iter()
        .enumerate()
        .map(|(j, port)| (*port, SplicePort::New { vertex: 0, output: j }))
        .collect::<Vec<_>>();
    let new_ids = graph.replace_subgraph(members, vec![wrapper], &rewires)?;
    Ok(new_ids[0])
}

/// Canned pass: gives every convolution that is not already followed by a
/// normalization a fresh one, splicing it in behind the convolution.
/// Returns how many were inserted.
pub fn insert_normalization_after_conv(graph: &mut GraphContainer) -> Result<usize, RewriteError> {
    let pattern = Pattern {
        steps: vec![OpKind::Conv],
        exclusive: false,
    };
    let mut inserted = 0;
    loop {
        let candidate = find_matches(graph, &pattern).find(|m| {
            graph
                .consumers(m.vertices[0])
                .iter()
                .all(|(consumer, _)| {
                    graph
                        .get(*consumer)
                        .map(|v| v.kind() != OpKind::Normalization)
                        .unwrap_or(true)
                })
        });
        let Some(m) = candidate else {
            return Ok(inserted);
        };
        apply(graph, &m, |graph, m| {
            let conv_id = m.vertices[0];
            let conv = graph.require(conv_id)?;
            let AnyOp::Conv(op) = conv.op() else {
                return Err(RewriteError::Rejected("matched vertex is not a conv".into()));
            };
            let channels = op.out_channels();
            Ok(Replacement {
                vertices: vec![
                    SpliceVertex {
                        name: conv.name().to_string(),
                        inputs: conv.inputs().iter().map(|p| SplicePort::Existing(*p)).collect(),
                        op: conv.op().clone(),
                    },
                    SpliceVertex {
                        name: format!("{}_norm", conv.name()),
                        inputs: vec![SplicePort::New { vertex: 0, output: 0 }],
                        op: AnyOp::Normalization(NormalizationOp::new(channels)),
                    },
                ],
                rewires: vec![(
                    PortRef::new(conv_id, 0),
                    SplicePort::New { vertex: 1, output: 0 },
                )],
            })
        })?;
        inserted += 1;
        log::debug!("inserted normalization after convolution");
    }
}
