//! Channel pruning over a trained graph. Channel coupling is propagated
//! through the whole container first, producing groups of output ports whose
//! channels must be dropped together; each group is then scored, narrowed and
//! materialized independently, so one failing group never poisons the rest.

mod union_find;

use crate::ir::ops::{AnyOp, ChannelRule, Op, OpKind};
use crate::ir::{GraphContainer, IrError, PortRef, VertexId};
use std::collections::{BTreeMap, HashMap, HashSet};
use union_find::UnionFind;

#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("coupled channel widths disagree at {vertex}: {left} vs {right}")]
    ShapeMismatch {
        vertex: VertexId,
        left: usize,
        right: usize,
    },
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Resolution when one channel group is reached by conflicting block
/// constraints (e.g. a grouped convolution and an attention block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayConflict {
    /// Leave the group untouched.
    #[default]
    MarkUnprunable,
    /// Drop in blocks sized to the least common multiple of all constraints.
    LeastCommonMultiple,
}

/// How per-port importance scores are combined for a channel that spans
/// several ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupReduce {
    #[default]
    Sum,
    Max,
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    /// Fraction of each group's channels to drop, rounded down to the
    /// group's block size.
    pub drop_ratio: f32,
    /// Flatten nested sub-graphs before pruning instead of recursing into
    /// them with their boundaries held fixed.
    pub inline_subgraphs: bool,
    pub overlay_conflict: OverlayConflict,
    pub group_reduce: GroupReduce,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            drop_ratio: 0.5,
            inline_subgraphs: false,
            overlay_conflict: OverlayConflict::default(),
            group_reduce: GroupReduce::default(),
        }
    }
}

/// Per-channel importance for a producing port. Returning `None` leaves the
/// port unscored; a channel with no scored port anywhere counts as zero.
pub trait ImportanceScorer {
    fn score_port(&self, graph: &GraphContainer, port: PortRef) -> Option<Vec<f32>>;
}

impl<F> ImportanceScorer for F
where
    F: Fn(&GraphContainer, PortRef) -> Option<Vec<f32>>,
{
    fn score_port(&self, graph: &GraphContainer, port: PortRef) -> Option<Vec<f32>> {
        self(graph, port)
    }
}

/// Default scorer: L1 mass of the producing vertex's stored parameters.
pub struct MagnitudeScorer;

impl ImportanceScorer for MagnitudeScorer {
    fn score_port(&self, graph: &GraphContainer, port: PortRef) -> Option<Vec<f32>> {
        if port.output != 0 {
            return None;
        }
        graph.get(port.vertex)?.op().channel_importance()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupStatus {
    Pruned,
    /// The requested ratio rounded down to zero channels.
    Skipped,
    Unprunable,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct GroupReport {
    /// Output ports whose channels are coupled, sorted.
    pub ports: Vec<PortRef>,
    pub channels: usize,
    pub block: usize,
    pub dropped: usize,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub groups: Vec<GroupReport>,
    /// Reports for sub-graph bodies pruned in place, by vertex name.
    pub nested: Vec<(String, PruneReport)>,
}

impl PruneReport {
    pub fn dropped_channels(&self) -> usize {
        self.groups.iter().map(|g| g.dropped).sum::<usize>()
            + self.nested.iter().map(|(_, r)| r.dropped_channels()).sum::<usize>()
    }

    pub fn pruned_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status == GroupStatus::Pruned)
            .count()
    }
}

/// Dense (port, channel) index space over all channel-tracked output ports.
#[derive(Default)]
struct ElementTable {
    ports: HashMap<PortRef, PortEntry>,
    owners: Vec<(PortRef, usize)>,
}

#[derive(Clone, Copy)]
struct PortEntry {
    base: usize,
    width: usize,
}

impl ElementTable {
    fn track(&mut self, port: PortRef, width: usize) -> PortEntry {
        let entry = PortEntry {
            base: self.owners.len(),
            width,
        };
        for channel in 0..width {
            self.owners.push((port, channel));
        }
        self.ports.insert(port, entry);
        entry
    }

    fn entry(&self, port: PortRef) -> Option<PortEntry> {
        self.ports.get(&port).copied()
    }
}

struct Component {
    /// Lowest channel index per member port; one coupled channel coordinate.
    /// A component can span several channels of one port (a split whose
    /// sub-ranges re-merge downstream); only the lowest survives here, so
    /// such a group fails shape validation at materialization and is
    /// reported `Failed` instead of dropping the coupled channels together.
    ports: BTreeMap<PortRef, usize>,
    poisoned: bool,
}

/// Prunes the container in place. Groups that cannot be narrowed are
/// reported, not fatal; a structural inconsistency in the input graph is.
pub fn prune(
    graph: &mut GraphContainer,
    scorer: &dyn ImportanceScorer,
    options: &PruneOptions,
) -> Result<PruneReport, PruneError> {
    let mut report = PruneReport::default();

    if options.inline_subgraphs {
        graph.inline_all_subgraphs()?;
    } else {
        // Recurse into nested bodies first. Their declared inputs and
        // outputs are pinned, so the boundary shapes the parent cached
        // stay valid.
        let ids: Vec<VertexId> = graph.vertex_ids().collect();
        for id in ids {
            let Some(vertex) = graph.get(id) else { continue };
            if vertex.kind() != OpKind::Subgraph {
                continue;
            }
            let name = vertex.name().to_string();
            let Some(AnyOp::Subgraph(sub)) = graph.vertex_op_mut(id) else {
                continue;
            };
            let nested = prune(sub.body_mut(), scorer, options)?;
            report.nested.push((name, nested));
        }
    }

    let (table, mut uf, poison) = propagate(graph)?;
    let groups = collect_groups(&table, &mut uf, &poison);

    // Original channel indices still present per port, updated as groups
    // commit. Keep lists handed to the shrink hooks are positions in the
    // port's current width.
    let mut remaining: HashMap<PortRef, Vec<usize>> = HashMap::new();
    let mut score_cache: HashMap<PortRef, Option<Vec<f32>>> = HashMap::new();

    for (signature, components) in groups {
        let channels = components.len();
        let poisoned = components.iter().any(|c| c.poisoned);
        let block = match group_block(graph, &signature, options.overlay_conflict) {
            Some(block) => block,
            None => {
                log::warn!(
                    "channel group over {signature:?} has conflicting block constraints, leaving it intact"
                );
                report.groups.push(GroupReport {
                    ports: signature,
                    channels,
                    block: 0,
                    dropped: 0,
                    status: GroupStatus::Unprunable,
                });
                continue;
            }
        };
        if poisoned {
            report.groups.push(GroupReport {
                ports: signature,
                channels,
                block,
                dropped: 0,
                status: GroupStatus::Unprunable,
            });
            continue;
        }

        let target = drop_target(channels, block, options.drop_ratio);
        if target == 0 {
            report.groups.push(GroupReport {
                ports: signature,
                channels,
                block,
                dropped: 0,
                status: GroupStatus::Skipped,
            });
            continue;
        }

        let selected = select_drops(
            graph,
            scorer,
            &mut score_cache,
            &signature,
            &components,
            target,
            options.group_reduce,
        );

        let status = match materialize(graph, &table, &mut remaining, &signature, &selected) {
            Ok(()) => GroupStatus::Pruned,
            Err(e) => {
                log::warn!("channel group over {signature:?} failed to materialize: {e}");
                GroupStatus::Failed(e.to_string())
            }
        };
        let dropped = if status == GroupStatus::Pruned { target } else { 0 };
        report.groups.push(GroupReport {
            ports: signature,
            channels,
            block,
            dropped,
            status,
        });
    }

    Ok(report)
}

/// Walks the container once in topological order, tracking channel-bearing
/// output ports and unioning the (port, channel) pairs that must be dropped
/// together. Returns the element table, the union-find over it and the
/// per-element unprunable marks.
fn propagate(
    graph: &GraphContainer,
) -> Result<(ElementTable, UnionFind, Vec<bool>), PruneError> {
    let mut table = ElementTable::default();
    let mut unions: Vec<(usize, usize)> = Vec::new();
    let mut marks: Vec<usize> = Vec::new();
    let poison_port = |table: &ElementTable, marks: &mut Vec<usize>, port: PortRef| {
        if let Some(entry) = table.entry(port) {
            marks.extend(entry.base..entry.base + entry.width);
        }
    };

    for id in graph.topological_order() {
        let vertex = graph.require(id)?;
        let op = vertex.op();
        match vertex.kind() {
            OpKind::Concat => {
                let AnyOp::Concat(concat) = op else { unreachable!() };
                let axis = concat.axis();
                let out_width = vertex.output_shapes()[0][axis];
                let out = table.track(PortRef::new(id, 0), out_width);
                let mut offset = 0;
                for port in vertex.inputs() {
                    let width = graph.output_shape(*port)?[axis];
                    match table.entry(*port) {
                        Some(entry) if entry.width == width => {
                            for c in 0..width {
                                unions.push((entry.base + c, out.base + offset + c));
                            }
                        }
                        // Untracked or reinterpreted source: its sub-range
                        // of the merged axis cannot move.
                        _ => marks.extend(out.base + offset..out.base + offset + width),
                    }
                    offset += width;
                }
            }
            OpKind::Split => {
                let AnyOp::Split(split) = op else { unreachable!() };
                let source = vertex.inputs()[0];
                if let Some(entry) = table.entry(source) {
                    let mut offset = 0;
                    for (j, size) in split.sizes().iter().enumerate() {
                        let out = table.track(PortRef::new(id, j), *size);
                        for c in 0..*size {
                            unions.push((entry.base + offset + c, out.base + c));
                        }
                        offset += *size;
                    }
                }
            }
            _ => {
                let mut out_entry = None;
                if let Some(width) = op.prunable_channels(0) {
                    out_entry = Some(table.track(PortRef::new(id, 0), width));
                }

                let mut tracked: Vec<PortEntry> = Vec::new();
                let mut untracked_passthrough = false;
                for (slot, port) in vertex.inputs().iter().enumerate() {
                    match op.input_rule(slot) {
                        ChannelRule::PassThrough => match table.entry(*port) {
                            Some(entry) => tracked.push(entry),
                            None => untracked_passthrough = true,
                        },
                        ChannelRule::Fixed | ChannelRule::None => {
                            poison_port(&table, &mut marks, *port);
                        }
                        ChannelRule::Consume => {}
                    }
                }
                if let Some(first) = tracked.first() {
                    for other in &tracked[1..] {
                        if other.width != first.width {
                            return Err(PruneError::ShapeMismatch {
                                vertex: id,
                                left: first.width,
                                right: other.width,
                            });
                        }
                    }
                    let out = match out_entry {
                        Some(entry) if entry.width != first.width => {
                            return Err(PruneError::ShapeMismatch {
                                vertex: id,
                                left: entry.width,
                                right: first.width,
                            });
                        }
                        Some(entry) => entry,
                        None => table.track(PortRef::new(id, 0), first.width),
                    };
                    for entry in &tracked {
                        for c in 0..entry.width {
                            unions.push((entry.base + c, out.base + c));
                        }
                    }
                    // A pass-through operand whose width is pinned elsewhere
                    // pins the whole coupled set.
                    if untracked_passthrough {
                        marks.extend(out.base..out.base + out.width);
                        for entry in &tracked {
                            marks.extend(entry.base..entry.base + entry.width);
                        }
                    }
                }
            }
        }
    }

    // Declared container outputs are part of the external contract.
    for port in graph.outputs() {
        poison_port(&table, &mut marks, *port);
    }

    let mut uf = UnionFind::new(table.owners.len());
    for (a, b) in unions {
        uf.union(a, b);
    }
    let mut poison = vec![false; table.owners.len()];
    for mark in marks {
        poison[mark] = true;
    }
    Ok((table, uf, poison))
}

/// Buckets union-find components by the sorted set of ports they span.
/// Components sharing a signature form one prunable group, ordered by their
/// channel index at the first port.
fn collect_groups(
    table: &ElementTable,
    uf: &mut UnionFind,
    poison: &[bool],
) -> Vec<(Vec<PortRef>, Vec<Component>)> {
    let mut components: BTreeMap<usize, Component> = BTreeMap::new();
    for i in 0..table.owners.len() {
        let root = uf.find(i);
        let (port, channel) = table.owners[i];
        let component = components.entry(root).or_insert_with(|| Component {
            ports: BTreeMap::new(),
            poisoned: false,
        });
        let slot = component.ports.entry(port).or_insert(channel);
        *slot = (*slot).min(channel);
        component.poisoned |= poison[i];
    }

    let mut groups: BTreeMap<Vec<PortRef>, Vec<Component>> = BTreeMap::new();
    for (_, component) in components {
        let signature: Vec<PortRef> = component.ports.keys().copied().collect();
        groups.entry(signature).or_default().push(component);
    }
    groups
        .into_iter()
        .map(|(signature, mut components)| {
            let canonical = signature[0];
            components.sort_by_key(|c| c.ports[&canonical]);
            (signature, components)
        })
        .collect()
}

/// Effective block size for a group, collected from the block constraints
/// of the ports' owning vertices. `None` means an unresolvable conflict
/// under `MarkUnprunable`.
fn group_block(
    graph: &GraphContainer,
    signature: &[PortRef],
    conflict: OverlayConflict,
) -> Option<usize> {
    let mut constraints: Vec<usize> = Vec::new();
    for port in signature {
        let Some(vertex) = graph.get(port.vertex) else { continue };
        if vertex.op().prunable_channels(port.output).is_some()
            && let Some(block) = vertex.op().block_constraint()
        {
            constraints.push(block);
        }
    }
    constraints.retain(|b| *b > 1);
    constraints.sort_unstable();
    constraints.dedup();
    match (constraints.len(), conflict) {
        (0, _) => Some(1),
        (1, _) => Some(constraints[0]),
        (_, OverlayConflict::LeastCommonMultiple) => {
            Some(constraints.into_iter().fold(1, lcm))
        }
        (_, OverlayConflict::MarkUnprunable) => None,
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Channels to drop: the requested fraction, rounded down to whole blocks,
/// never the whole group.
fn drop_target(channels: usize, block: usize, ratio: f32) -> usize {
    let ratio = ratio.clamp(0.0, 1.0);
    let mut target = (ratio * channels as f32).floor() as usize;
    target -= target % block;
    let max_drop = channels.saturating_sub(block);
    target.min(max_drop - max_drop % block)
}

fn select_drops<'a>(
    graph: &GraphContainer,
    scorer: &dyn ImportanceScorer,
    cache: &mut HashMap<PortRef, Option<Vec<f32>>>,
    signature: &[PortRef],
    components: &'a [Component],
    target: usize,
    reduce: GroupReduce,
) -> Vec<&'a Component> {
    let mut scored: Vec<(f32, usize)> = components
        .iter()
        .enumerate()
        .map(|(i, component)| {
            let mut score: Option<f32> = None;
            for port in signature {
                let per_port = cache
                    .entry(*port)
                    .or_insert_with(|| scorer.score_port(graph, *port));
                let Some(values) = per_port else { continue };
                let Some(value) = values.get(component.ports[port]).copied() else {
                    continue;
                };
                score = Some(match (score, reduce) {
                    (None, _) => value,
                    (Some(acc), GroupReduce::Sum) => acc + value,
                    (Some(acc), GroupReduce::Max) => acc.max(value),
                });
            }
            (score.unwrap_or(0.0), i)
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(target)
        .map(|(_, i)| &components[i])
        .collect()
}

/// Applies one group's drop set on a scratch copy, shrinking every member
/// port and every consuming slot that re-slices its own parameters, then
/// re-validates shapes. The live container and the remap state are only
/// touched when the whole group succeeds.
fn materialize(
    graph: &mut GraphContainer,
    table: &ElementTable,
    remaining: &mut HashMap<PortRef, Vec<usize>>,
    signature: &[PortRef],
    selected: &[&Component],
) -> Result<(), IrError> {
    let mut scratch = graph.clone();
    let mut committed: Vec<(PortRef, Vec<usize>)> = Vec::new();

    for port in signature {
        let width = table
            .entry(*port)
            .map(|e| e.width)
            .unwrap_or_default();
        let current = remaining
            .get(port)
            .cloned()
            .unwrap_or_else(|| (0..width).collect());
        let dropped: HashSet<usize> = selected
            .iter()
            .filter_map(|c| c.ports.get(port).copied())
            .collect();
        let keep: Vec<usize> = (0..current.len())
            .filter(|i| !dropped.contains(&current[*i]))
            .collect();
        if keep.len() == current.len() {
            continue;
        }
        scratch.shrink_vertex_output(port.vertex, port.output, &keep)?;
        for (consumer, slot) in graph.consumers(port.vertex) {
            let vertex = graph.require(consumer)?;
            if vertex.inputs()[slot] != *port {
                continue;
            }
            if vertex.op().input_rule(slot) == ChannelRule::Consume {
                scratch.shrink_vertex_input(consumer, slot, &keep)?;
            }
        }
        let survivors = keep.iter().map(|i| current[*i]).collect();
        committed.push((*port, survivors));
    }

    scratch.refresh_shapes()?;
    *graph = scratch;
    for (port, survivors) in committed {
        remaining.insert(port, survivors);
    }
    Ok(())
}
