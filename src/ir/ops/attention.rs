use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, validate_keep};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Multi-head attention block collapsed to a single vertex. The projection
/// weight is `[num_heads * head_dim, in_dim]`; output channels can only be
/// dropped in whole heads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionOp {
    in_dim: usize,
    num_heads: usize,
    head_dim: usize,
    weight: ArrayD<f32>,
    bias: Option<ArrayD<f32>>,
}

impl AttentionOp {
    pub fn new(in_dim: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            in_dim,
            num_heads,
            head_dim,
            weight: ArrayD::zeros(vec![num_heads * head_dim, in_dim]),
            bias: None,
        }
    }

    pub fn with_weight(mut self, weight: ArrayD<f32>, bias: Option<ArrayD<f32>>) -> Self {
        self.weight = weight;
        self.bias = bias;
        self
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn embed_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

impl Op for AttentionOp {
    fn kind(&self) -> OpKind {
        OpKind::Attention
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        let input = &inputs[0];
        if input.last() != Some(&self.in_dim) {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: input.clone(),
            });
        }
        let mut out = input.clone();
        *out.last_mut().unwrap() = self.embed_dim();
        Ok(vec![out])
    }

    fn prunable_channels(&self, output: usize) -> Option<usize> {
        (output == 0).then_some(self.embed_dim())
    }

    fn input_rule(&self, input: usize) -> ChannelRule {
        if input == 0 {
            ChannelRule::Consume
        } else {
            ChannelRule::None
        }
    }

    fn block_constraint(&self) -> Option<usize> {
        Some(self.head_dim)
    }

    fn channel_importance(&self) -> Option<Vec<f32>> {
        Some(
            (0..self.embed_dim())
                .map(|i| self.weight.index_axis(Axis(0), i).iter().map(|w| w.abs()).sum())
                .collect(),
        )
    }

    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 || keep.len() % self.head_dim != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.embed_dim())?;
        self.weight = self.weight.select(Axis(0), keep);
        if let Some(bias) = &self.bias {
            self.bias = Some(bias.select(Axis(0), keep));
        }
        self.num_heads = keep.len() / self.head_dim;
        Ok(())
    }

    fn shrink_input_channels(&mut self, input: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if input != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.in_dim)?;
        self.weight = self.weight.select(Axis(1), keep);
        self.in_dim = keep.len();
        Ok(())
    }
}
