mod attention;
mod concat;
mod conv;
mod elementwise;
mod fixed_head;
mod input;
mod linear;
mod normalization;
mod opaque;
mod reshape;
mod split;
mod subgraph;

pub use attention::AttentionOp;
pub use concat::ConcatOp;
pub use conv::ConvOp;
pub use elementwise::{ElementwiseOp, WhichElementwise};
pub use fixed_head::FixedHeadOp;
pub use input::InputOp;
pub use linear::LinearOp;
pub use normalization::NormalizationOp;
pub use opaque::OpaqueOp;
pub use reshape::ReshapeOp;
pub use split::SplitOp;
pub use subgraph::SubgraphOp;

use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

/// Closed set of operation kinds supported by the representation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::VariantNames,
)]
pub enum OpKind {
    Input,
    Conv,
    Linear,
    Normalization,
    Elementwise,
    Concat,
    Split,
    Reshape,
    Attention,
    FixedHead,
    Opaque,
    Subgraph,
}

/// How a vertex constrains the channels it consumes on one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRule {
    /// Input channels couple one-to-one with this vertex's output channels
    /// (elementwise, normalization, residual add, depthwise conv).
    PassThrough,
    /// The vertex re-slices its own input-axis parameters when the producer
    /// is pruned; the producer's channels stay decoupled from this vertex's
    /// output channels.
    Consume,
    /// The input width is externally fixed; the producer must not be pruned.
    Fixed,
    /// Not channel-bearing, or the vertex cannot adapt to a narrower input.
    None,
}

/// Capability surface every operation exposes: pure shape inference plus
/// the prunable-axis descriptors consumed by the pruning engine.
pub trait Op {
    fn kind(&self) -> OpKind;

    /// Output shapes as a pure function of input shapes and configuration.
    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError>;

    /// Channel count of an output whose width is owned by this vertex's
    /// configuration. Pass-through widths are derived by the engine instead.
    fn prunable_channels(&self, output: usize) -> Option<usize> {
        let _ = output;
        None
    }

    fn input_rule(&self, input: usize) -> ChannelRule {
        let _ = input;
        ChannelRule::None
    }

    /// Hard constraint: output channels may only be dropped in contiguous
    /// blocks of this size (grouped conv group count, attention head width).
    fn block_constraint(&self) -> Option<usize> {
        None
    }

    /// Per-output-channel L1 parameter mass, where parameters exist.
    fn channel_importance(&self) -> Option<Vec<f32>> {
        None
    }

    /// Shrink the given output to the kept channel indices, slicing stored
    /// parameters along the output channel axis. Only the pruning engine
    /// calls this.
    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        let _ = (output, keep);
        Err(ShapeError::NotPrunable { op: self.kind() })
    }

    /// Shrink the given input to the kept producer channel indices, slicing
    /// stored parameters along the input channel axis.
    fn shrink_input_channels(&mut self, input: usize, keep: &[usize]) -> Result<(), ShapeError> {
        let _ = (input, keep);
        Err(ShapeError::NotPrunable { op: self.kind() })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, strum_macros::VariantNames)]
pub enum AnyOp {
    Input(InputOp),
    Conv(ConvOp),
    Linear(LinearOp),
    Normalization(NormalizationOp),
    Elementwise(ElementwiseOp),
    Concat(ConcatOp),
    Split(SplitOp),
    Reshape(ReshapeOp),
    Attention(AttentionOp),
    FixedHead(FixedHeadOp),
    Opaque(OpaqueOp),
    Subgraph(SubgraphOp),
}

macro_rules! delegate {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&self, $($arg: $ty),*) -> $ret {
            match self {
                AnyOp::Input(x) => x.$name($($arg),*),
                AnyOp::Conv(x) => x.$name($($arg),*),
                AnyOp::Linear(x) => x.$name($($arg),*),
                AnyOp::Normalization(x) => x.$name($($arg),*),
                AnyOp::Elementwise(x) => x.$name($($arg),*),
                AnyOp::Concat(x) => x.$name($($arg),*),
                AnyOp::Split(x) => x.$name($($arg),*),
                AnyOp::Reshape(x) => x.$name($($arg),*),
                AnyOp::Attention(x) => x.$name($($arg),*),
                AnyOp::FixedHead(x) => x.$name($($arg),*),
                AnyOp::Opaque(x) => x.$name($($arg),*),
                AnyOp::Subgraph(x) => x.$name($($arg),*),
            }
        }
    };
    (mut $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&mut self, $($arg: $ty),*) -> $ret {
            match self {
                AnyOp::Input(x) => x.$name($($arg),*),
                AnyOp::Conv(x) => x.$name($($arg),*),
                AnyOp::Linear(x) => x.$name($($arg),*),
                AnyOp::Normalization(x) => x.$name($($arg),*),
                AnyOp::Elementwise(x) => x.$name($($arg),*),
                AnyOp::Concat(x) => x.$name($($arg),*),
                AnyOp::Split(x) => x.$name($($arg),*),
                AnyOp::Reshape(x) => x.$name($($arg),*),
                AnyOp::Attention(x) => x.$name($($arg),*),
                AnyOp::FixedHead(x) => x.$name($($arg),*),
                AnyOp::Opaque(x) => x.$name($($arg),*),
                AnyOp::Subgraph(x) => x.$name($($arg),*),
            }
        }
    };
}

impl Op for AnyOp {
    delegate!(kind() -> OpKind);
    delegate!(infer_output_shapes(inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError>);
    delegate!(prunable_channels(output: usize) -> Option<usize>);
    delegate!(input_rule(input: usize) -> ChannelRule);
    delegate!(block_constraint() -> Option<usize>);
    delegate!(channel_importance() -> Option<Vec<f32>>);
    delegate!(mut shrink_output_channels(output: usize, keep: &[usize]) -> Result<(), ShapeError>);
    delegate!(mut shrink_input_channels(input: usize, keep: &[usize]) -> Result<(), ShapeError>);
}

pub(crate) fn check_input_count(
    op: OpKind,
    inputs: &[Shape],
    expected: usize,
) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        Err(ShapeError::WrongInputCount {
            op,
            expected,
            actual: inputs.len(),
        })
    } else {
        Ok(())
    }
}
