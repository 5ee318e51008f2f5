use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, validate_keep};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// N-dimensional convolution, including grouped and depthwise variants.
/// Weight layout is `[out_channels, in_channels / groups, kernel...]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvOp {
    in_channels: usize,
    out_channels: usize,
    groups: usize,
    kernel_shape: Vec<usize>,
    strides: Vec<usize>,
    pads: Vec<usize>,
    dilations: Vec<usize>,
    weight: ArrayD<f32>,
    bias: Option<ArrayD<f32>>,
}

impl ConvOp {
    pub fn new(in_channels: usize, out_channels: usize, kernel_shape: Vec<usize>) -> Self {
        let rank = kernel_shape.len();
        let mut weight_shape = vec![out_channels, in_channels];
        weight_shape.extend_from_slice(&kernel_shape);
        Self {
            in_channels,
            out_channels,
            groups: 1,
            strides: vec![1; rank],
            pads: vec![0; rank],
            dilations: vec![1; rank],
            kernel_shape,
            weight: ArrayD::zeros(weight_shape),
            bias: None,
        }
    }

    pub fn with_groups(mut self, groups: usize) -> Result<Self, ShapeError> {
        if groups == 0 || self.in_channels % groups != 0 || self.out_channels % groups != 0 {
            return Err(ShapeError::IncompatibleInput {
                op: OpKind::Conv,
                shape: vec![self.in_channels, self.out_channels, groups],
            });
        }
        self.groups = groups;
        let mut weight_shape = vec![self.out_channels, self.in_channels / groups];
        weight_shape.extend_from_slice(&self.kernel_shape);
        self.weight = ArrayD::zeros(weight_shape);
        Ok(self)
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_pads(mut self, pads: Vec<usize>) -> Self {
        self.pads = pads;
        self
    }

    pub fn with_dilations(mut self, dilations: Vec<usize>) -> Self {
        self.dilations = dilations;
        self
    }

    pub fn with_weight(mut self, weight: ArrayD<f32>, bias: Option<ArrayD<f32>>) -> Self {
        self.weight = weight;
        self.bias = bias;
        self
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn weight(&self) -> &ArrayD<f32> {
        &self.weight
    }

    fn is_depthwise(&self) -> bool {
        self.groups > 1 && self.groups == self.in_channels && self.in_channels == self.out_channels
    }
}

impl Op for ConvOp {
    fn kind(&self) -> OpKind {
        OpKind::Conv
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        let input = &inputs[0];
        let rank = self.kernel_shape.len();
        if input.len() != rank + 2 || input[1] != self.in_channels {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: input.clone(),
            });
        }
        let mut out = vec![input[0], self.out_channels];
        for i in 0..rank {
            let span = self.dilations[i] * (self.kernel_shape[i] - 1) + 1;
            let padded = input[2 + i] + 2 * self.pads[i];
            if padded < span {
                return Err(ShapeError::IncompatibleInput {
                    op: self.kind(),
                    shape: input.clone(),
                });
            }
            out.push((padded - span) / self.strides[i] + 1);
        }
        Ok(vec![out])
    }

    fn prunable_channels(&self, output: usize) -> Option<usize> {
        (output == 0).then_some(self.out_channels)
    }

    fn input_rule(&self, input: usize) -> ChannelRule {
        if input != 0 {
            ChannelRule::None
        } else if self.is_depthwise() {
            ChannelRule::PassThrough
        } else if self.groups == 1 {
            ChannelRule::Consume
        } else {
            // Grouped non-depthwise input slicing would have to respect the
            // per-group weight partitioning; the producer is left intact.
            ChannelRule::Fixed
        }
    }

    fn block_constraint(&self) -> Option<usize> {
        (self.groups > 1 && !self.is_depthwise()).then_some(self.groups)
    }

    fn channel_importance(&self) -> Option<Vec<f32>> {
        Some(
            (0..self.out_channels)
                .map(|i| self.weight.index_axis(Axis(0), i).iter().map(|w| w.abs()).sum())
                .collect(),
        )
    }

    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.out_channels)?;
        let depthwise = self.is_depthwise();
        self.weight = self.weight.select(Axis(0), keep);
        if let Some(bias) = &self.bias {
            self.bias = Some(bias.select(Axis(0), keep));
        }
        self.out_channels = keep.len();
        if depthwise {
            self.in_channels = keep.len();
            self.groups = keep.len();
        }
        Ok(())
    }

    fn shrink_input_channels(&mut self, input: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if input != 0 || self.groups != 1 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.in_channels)?;
        self.weight = self.weight.select(Axis(1), keep);
        self.in_channels = keep.len();
        Ok(())
    }
}
