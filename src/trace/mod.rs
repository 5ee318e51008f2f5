//! Constructor: collapses a flat traced operation sequence into a
//! normalized graph container. Computational records become vertices;
//! structural and scalar records are folded into downstream configuration;
//! frontend idioms for the same mathematical operation normalize to one
//! canonical vertex kind so later pattern matching never sees the idiom.

use crate::ir::ops::{
    AnyOp, AttentionOp, ConcatOp, ConvOp, ElementwiseOp, FixedHeadOp, InputOp, LinearOp,
    NormalizationOp, OpaqueOp, ReshapeOp, SplitOp, WhichElementwise,
};
use crate::ir::{GraphContainer, IrError, PortRef, VertexId};
use crate::shape::Shape;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace is not representable as an acyclic reference graph: {0}")]
    UntraceableStructure(String),
    #[error("record {record} ({op}) is missing \"{what}\"")]
    MissingDetail {
        record: usize,
        op: String,
        what: &'static str,
    },
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Plain (non-tensor) value carried by a trace record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TraceValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntList(Vec<i64>),
}

impl TraceValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            TraceValue::Int(x) => Some(*x),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            TraceValue::Int(x) => Some(*x as f64),
            TraceValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    fn as_int_list(&self) -> Option<Vec<i64>> {
        match self {
            TraceValue::IntList(x) => Some(x.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TraceArg {
    /// Reference to an output of an earlier record.
    Ref { record: usize, output: usize },
    Value(TraceValue),
}

impl TraceArg {
    pub fn to(record: usize) -> Self {
        TraceArg::Ref { record, output: 0 }
    }

    pub fn int(value: i64) -> Self {
        TraceArg::Value(TraceValue::Int(value))
    }
}

/// One low-level operation record emitted by the tracing frontend. Shape
/// metadata is trusted as given and never re-derived here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub op: String,
    pub name: Option<String>,
    pub args: Vec<TraceArg>,
    pub attrs: BTreeMap<String, TraceValue>,
    pub params: BTreeMap<String, ArrayD<f32>>,
    pub output_shapes: Vec<Shape>,
}

impl TraceRecord {
    pub fn new(op: impl Into<String>, args: Vec<TraceArg>, output_shapes: Vec<Shape>) -> Self {
        Self {
            op: op.into(),
            name: None,
            args,
            attrs: BTreeMap::new(),
            params: BTreeMap::new(),
            output_shapes,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: TraceValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ArrayD<f32>) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// What a record lowered to: a real vertex, or a folded plain value that
/// gets inlined into downstream configuration.
#[derive(Clone, Debug)]
enum Lowered {
    Vertex(VertexId),
    Value(TraceValue),
}

#[derive(Clone, Debug)]
enum Resolved {
    Port(PortRef),
    Value(TraceValue),
}

/// Builds a normalized graph container from a traced operation sequence.
/// `outputs` names the (record, output) pairs that form the graph's
/// external outputs, in order.
pub fn build_graph(
    records: &[TraceRecord],
    outputs: &[(usize, usize)],
) -> Result<GraphContainer, TraceError> {
    check_reference_structure(records)?;

    let mut graph = GraphContainer::new();
    let mut lowered: Vec<Lowered> = Vec::with_capacity(records.len());

    for (idx, rec) in records.iter().enumerate() {
        let resolved = resolve_args(rec, &lowered);
        let ports: Vec<PortRef> = resolved
            .iter()
            .filter_map(|r| match r {
                Resolved::Port(p) => Some(*p),
                Resolved::Value(_) => None,
            })
            .collect();
        let name = rec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", rec.op, idx));

        let low = match rec.op.as_str() {
            "input" | "placeholder" => {
                let shape = rec
                    .output_shapes
                    .first()
                    .ok_or(missing(idx, rec, "output shape"))?
                    .clone();
                vertex(&mut graph, name, vec![], AnyOp::Input(InputOp::new(shape)))?
            }
            "conv" | "conv1d" | "conv2d" | "conv3d" | "convolution" => {
                let weight = param(idx, rec, "weight")?;
                let bias = rec.params.get("bias").cloned();
                let groups = attr_int(rec, "groups").unwrap_or(1) as usize;
                let out_channels = weight.shape()[0];
                let in_channels = weight.shape()[1] * groups;
                let kernel: Vec<usize> = weight.shape()[2..].to_vec();
                let rank = kernel.len();
                let op = ConvOp::new(in_channels, out_channels, kernel)
                    .with_groups(groups)
                    .map_err(IrError::from)?
                    .with_strides(attr_dims(rec, "stride", rank, 1))
                    .with_pads(attr_dims(rec, "padding", rank, 0))
                    .with_dilations(attr_dims(rec, "dilation", rank, 1))
                    .with_weight(weight, bias);
                vertex(&mut graph, name, ports, AnyOp::Conv(op))?
            }
            "linear" | "addmm" | "dense" => {
                let weight = param(idx, rec, "weight")?;
                let bias = rec.params.get("bias").cloned();
                let op = LinearOp::new(weight.shape()[1], weight.shape()[0])
                    .with_weight(weight, bias);
                vertex(&mut graph, name, ports, AnyOp::Linear(op))?
            }
            "batch_norm" | "instance_norm" | "layer_norm" => {
                let scale = param(idx, rec, "weight")?;
                let shift = rec
                    .params
                    .get("bias")
                    .cloned()
                    .unwrap_or_else(|| ArrayD::zeros(vec![scale.len()]));
                let axis = match attr_int(rec, "axis") {
                    Some(axis) => axis as usize,
                    None if rec.op == "layer_norm" => rec
                        .output_shapes
                        .first()
                        .map(|s| s.len().saturating_sub(1))
                        .unwrap_or(1),
                    None => 1,
                };
                let op = NormalizationOp::with_axis(scale.len(), axis).with_params(scale, shift);
                vertex(&mut graph, name, ports, AnyOp::Normalization(op))?
            }
            // Every frontend spelling of the same pointwise math collapses
            // to the one canonical Elementwise kind.
            "add" | "add_" | "__add__" | "__iadd__" | "iadd" => {
                binary_or_fold(&mut graph, idx, rec, name, resolved, WhichElementwise::Add)?
            }
            "mul" | "mul_" | "__mul__" | "__imul__" | "multiply" => {
                binary_or_fold(&mut graph, idx, rec, name, resolved, WhichElementwise::Mul)?
            }
            "relu" | "relu_" => unary(&mut graph, name, ports, WhichElementwise::Relu)?,
            "sigmoid" => unary(&mut graph, name, ports, WhichElementwise::Sigmoid)?,
            "tanh" => unary(&mut graph, name, ports, WhichElementwise::Tanh)?,
            "gelu" => unary(&mut graph, name, ports, WhichElementwise::Gelu)?,
            "cat" | "concat" | "concatenate" => {
                let axis = attr_int(rec, "axis")
                    .or_else(|| attr_int(rec, "dim"))
                    .unwrap_or(1) as usize;
                vertex(&mut graph, name, ports, AnyOp::Concat(ConcatOp::new(axis)))?
            }
            "split" | "chunk" => {
                let axis = attr_int(rec, "axis")
                    .or_else(|| attr_int(rec, "dim"))
                    .unwrap_or(1) as usize;
                let sizes: Vec<usize> = rec
                    .output_shapes
                    .iter()
                    .map(|s| s.get(axis).copied().ok_or(missing(idx, rec, "axis")))
                    .collect::<Result<_, _>>()?;
                vertex(
                    &mut graph,
                    name,
                    ports,
                    AnyOp::Split(SplitOp::new(axis, sizes)),
                )?
            }
            "reshape" | "view" | "flatten" => {
                let declared = rec
                    .output_shapes
                    .first()
                    .ok_or(missing(idx, rec, "output shape"))?;
                let target = reshape_target(&resolved, rec, declared);
                vertex(
                    &mut graph,
                    name,
                    ports,
                    AnyOp::Reshape(ReshapeOp::new(target)),
                )?
            }
            "attention" | "scaled_dot_product_attention" | "multi_head_attention" => {
                let weight = param(idx, rec, "weight")?;
                let bias = rec.params.get("bias").cloned();
                let num_heads = attr_int(rec, "num_heads")
                    .ok_or(missing(idx, rec, "num_heads"))? as usize;
                let embed = weight.shape()[0];
                let in_dim = weight.shape()[1];
                let op = AttentionOp::new(in_dim, num_heads, embed / num_heads)
                    .with_weight(weight, bias);
                vertex(&mut graph, name, ports, AnyOp::Attention(op))?
            }
            "head" | "classifier" | "fixed_head" => {
                let weight = param(idx, rec, "weight")?;
                let bias = rec.params.get("bias").cloned();
                let op = FixedHeadOp::new(weight.shape()[1], weight.shape()[0])
                    .with_weight(weight, bias);
                vertex(&mut graph, name, ports, AnyOp::FixedHead(op))?
            }
            // Structural and scalar records fold away entirely.
            "size" | "shape" | "getattr" | "getitem" | "floordiv" | "floor_divide" | "item"
            | "int" => match fold_structural(rec, &resolved, records) {
                Some(value) => Lowered::Value(value),
                None => opaque(&mut graph, idx, rec, name, ports)?,
            },
            _ => opaque(&mut graph, idx, rec, name, ports)?,
        };
        lowered.push(low);
    }

    let mut output_ports = Vec::with_capacity(outputs.len());
    for (record, output) in outputs {
        match lowered.get(*record) {
            Some(Lowered::Vertex(id)) => output_ports.push(PortRef::new(*id, *output)),
            Some(Lowered::Value(_)) => {
                return Err(TraceError::UntraceableStructure(format!(
                    "declared output record {record} folded to a scalar"
                )));
            }
            None => {
                return Err(TraceError::UntraceableStructure(format!(
                    "declared output record {record} does not exist"
                )));
            }
        }
    }
    graph.set_outputs(output_ports)?;
    Ok(graph)
}

/// A trace is only representable if every reference points strictly
/// backward; anything else means the frontend emitted data-dependent
/// control flow or a malformed sequence.
fn check_reference_structure(records: &[TraceRecord]) -> Result<(), TraceError> {
    for (idx, rec) in records.iter().enumerate() {
        for arg in &rec.args {
            if let TraceArg::Ref { record, output } = arg {
                if *record >= idx {
                    return Err(TraceError::UntraceableStructure(format!(
                        "record {idx} ({}) references record {record}, which does not precede it",
                        rec.op
                    )));
                }
                let available = records[*record].output_shapes.len().max(1);
                if *output >= available {
                    return Err(TraceError::UntraceableStructure(format!(
                        "record {idx} ({}) references missing output {output} of record {record}",
                        rec.op
                    )));
                }
            }
        }
    }
    Ok(())
}

fn resolve_args(rec: &TraceRecord, lowered: &[Lowered]) -> Vec<Resolved> {
    rec.args
        .iter()
        .map(|arg| match arg {
            TraceArg::Value(v) => Resolved::Value(v.clone()),
            TraceArg::Ref { record, output } => match &lowered[*record] {
                Lowered::Vertex(id) => Resolved::Port(PortRef::new(*id, *output)),
                Lowered::Value(v) => Resolved::Value(v.clone()),
            },
        })
        .collect()
}

fn vertex(
    graph: &mut GraphContainer,
    name: String,
    ports: Vec<PortRef>,
    op: AnyOp,
) -> Result<Lowered, TraceError> {
    Ok(Lowered::Vertex(graph.add_vertex(name, ports, op)?))
}

fn unary(
    graph: &mut GraphContainer,
    name: String,
    ports: Vec<PortRef>,
    which: WhichElementwise,
) -> Result<Lowered, TraceError> {
    vertex(
        graph,
        name,
        ports,
        AnyOp::Elementwise(ElementwiseOp::new(which)),
    )
}

/// A binary arithmetic record is computational when two tensor operands
/// are present, a plain constant fold when no tensor is involved, and an
/// opaque vertex for the mixed tensor-scalar case.
fn binary_or_fold(
    graph: &mut GraphContainer,
    idx: usize,
    rec: &TraceRecord,
    name: String,
    resolved: Vec<Resolved>,
    which: WhichElementwise,
) -> Result<Lowered, TraceError> {
    let ports: Vec<PortRef> = resolved
        .iter()
        .filter_map(|r| match r {
            Resolved::Port(p) => Some(*p),
            Resolved::Value(_) => None,
        })
        .collect();
    if ports.len() == 2 {
        return vertex(
            graph,
            name,
            ports,
            AnyOp::Elementwise(ElementwiseOp::new(which)),
        );
    }
    if ports.is_empty() {
        let ints: Option<Vec<i64>> = resolved
            .iter()
            .map(|r| match r {
                Resolved::Value(v) => v.as_int(),
                Resolved::Port(_) => None,
            })
            .collect();
        if let Some(ints) = ints {
            let value = match which {
                WhichElementwise::Add => ints.iter().sum(),
                _ => ints.iter().product(),
            };
            return Ok(Lowered::Value(TraceValue::Int(value)));
        }
        // Plain float arithmetic folds the same way.
        let floats: Option<Vec<f64>> = resolved
            .iter()
            .map(|r| match r {
                Resolved::Value(v) => v.as_float(),
                Resolved::Port(_) => None,
            })
            .collect();
        if let Some(floats) = floats {
            let value = match which {
                WhichElementwise::Add => floats.iter().sum(),
                _ => floats.iter().product(),
            };
            return Ok(Lowered::Value(TraceValue::Float(value)));
        }
    }
    log::debug!(
        "record {idx} ({}) mixes tensor and scalar operands, keeping it opaque",
        rec.op
    );
    opaque(graph, idx, rec, name, ports)
}

fn opaque(
    graph: &mut GraphContainer,
    idx: usize,
    rec: &TraceRecord,
    name: String,
    ports: Vec<PortRef>,
) -> Result<Lowered, TraceError> {
    if ports.is_empty() {
        return Err(TraceError::UntraceableStructure(format!(
            "record {idx} ({}) has no tensor inputs and cannot be folded",
            rec.op
        )));
    }
    if rec.output_shapes.is_empty() {
        return Err(TraceError::UntraceableStructure(format!(
            "record {idx} ({}) has no declared outputs",
            rec.op
        )));
    }
    log::debug!("record {idx} ({}) lowered as an opaque vertex", rec.op);
    let op = OpaqueOp::new(rec.op.clone(), ports.len(), rec.output_shapes.clone());
    vertex(graph, name, ports, AnyOp::Opaque(op))
}

/// Constant-folds a structural/scalar record. Returns `None` when the
/// record cannot be evaluated from its resolved arguments.
fn fold_structural(
    rec: &TraceRecord,
    resolved: &[Resolved],
    records: &[TraceRecord],
) -> Option<TraceValue> {
    match rec.op.as_str() {
        "size" | "shape" => {
            let TraceArg::Ref { record, output } = rec.args.first()? else {
                return None;
            };
            let shape = records.get(*record)?.output_shapes.get(*output)?;
            match rec.attrs.get("dim").and_then(TraceValue::as_int) {
                Some(dim) => Some(TraceValue::Int(*shape.get(dim as usize)? as i64)),
                None => Some(TraceValue::IntList(
                    shape.iter().map(|d| *d as i64).collect(),
                )),
            }
        }
        "getattr" => match rec.attrs.get("name") {
            Some(TraceValue::Str(attr)) if attr == "shape" => {
                let TraceArg::Ref { record, output } = rec.args.first()? else {
                    return None;
                };
                let shape = records.get(*record)?.output_shapes.get(*output)?;
                Some(TraceValue::IntList(
                    shape.iter().map(|d| *d as i64).collect(),
                ))
            }
            _ => None,
        },
        "getitem" => {
            let list = resolved_value(resolved, 0)?.as_int_list()?;
            let index = rec
                .attrs
                .get("index")
                .and_then(TraceValue::as_int)
                .or_else(|| resolved_value(resolved, 1)?.as_int())?;
            Some(TraceValue::Int(*list.get(index as usize)?))
        }
        "floordiv" | "floor_divide" => {
            let a = resolved_value(resolved, 0)?.as_int()?;
            let b = resolved_value(resolved, 1)?.as_int()?;
            (b != 0).then(|| TraceValue::Int(a.div_euclid(b)))
        }
        "item" => resolved_value(resolved, 0).cloned(),
        "int" => match resolved_value(resolved, 0)? {
            TraceValue::Int(x) => Some(TraceValue::Int(*x)),
            TraceValue::Float(x) => Some(TraceValue::Int(x.trunc() as i64)),
            _ => None,
        },
        _ => None,
    }
}

fn resolved_value(resolved: &[Resolved], index: usize) -> Option<&TraceValue> {
    match resolved.get(index)? {
        Resolved::Value(v) => Some(v),
        Resolved::Port(_) => None,
    }
}

/// Reshape targets arrive either as a folded int-list argument (possibly
/// containing -1 placeholders), a "shape" attribute, or implicitly via the
/// record's own output shape metadata.
fn reshape_target(resolved: &[Resolved], rec: &TraceRecord, declared: &Shape) -> Shape {
    let listed = resolved
        .iter()
        .find_map(|r| match r {
            Resolved::Value(v) => v.as_int_list(),
            Resolved::Port(_) => None,
        })
        .or_else(|| rec.attrs.get("shape").and_then(TraceValue::as_int_list));
    match listed {
        Some(list) if list.len() == declared.len() => list
            .iter()
            .zip(declared.iter())
            .map(|(wanted, actual)| {
                if *wanted >= 0 {
                    *wanted as usize
                } else {
                    *actual
                }
            })
            .collect(),
        _ => declared.clone(),
    }
}

fn attr_int(rec: &TraceRecord, name: &str) -> Option<i64> {
    rec.attrs.get(name).and_then(TraceValue::as_int)
}

/// Per-spatial-dimension attribute: a scalar is replicated across the rank.
fn attr_dims(rec: &TraceRecord, name: &str, rank: usize, default: usize) -> Vec<usize> {
    match rec.attrs.get(name) {
        Some(TraceValue::Int(x)) => vec![*x as usize; rank],
        Some(TraceValue::IntList(xs)) if xs.len() == rank => {
            xs.iter().map(|x| *x as usize).collect()
        }
        _ => vec![default; rank],
    }
}

fn param(idx: usize, rec: &TraceRecord, name: &'static str) -> Result<ArrayD<f32>, TraceError> {
    rec.params
        .get(name)
        .cloned()
        .ok_or(TraceError::MissingDetail {
            record: idx,
            op: rec.op.clone(),
            what: name,
        })
}

fn missing(idx: usize, rec: &TraceRecord, what: &'static str) -> TraceError {
    TraceError::MissingDetail {
        record: idx,
        op: rec.op.clone(),
        what,
    }
}
