use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, validate_keep};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Channel-wise normalization with learned scale and shift along one axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizationOp {
    channels: usize,
    axis: usize,
    eps: f32,
    scale: ArrayD<f32>,
    shift: ArrayD<f32>,
}

impl NormalizationOp {
    pub fn new(channels: usize) -> Self {
        Self::with_axis(channels, 1)
    }

    pub fn with_axis(channels: usize, axis: usize) -> Self {
        Self {
            channels,
            axis,
            eps: 1e-5,
            scale: ArrayD::ones(vec![channels]),
            shift: ArrayD::zeros(vec![channels]),
        }
    }

    pub fn with_params(mut self, scale: ArrayD<f32>, shift: ArrayD<f32>) -> Self {
        self.scale = scale;
        self.shift = shift;
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl Op for NormalizationOp {
    fn kind(&self) -> OpKind {
        OpKind::Normalization
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        let input = &inputs[0];
        if input.get(self.axis) != Some(&self.channels) {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: input.clone(),
            });
        }
        Ok(vec![input.clone()])
    }

    fn input_rule(&self, input: usize) -> ChannelRule {
        if input == 0 {
            ChannelRule::PassThrough
        } else {
            ChannelRule::None
        }
    }

    fn channel_importance(&self) -> Option<Vec<f32>> {
        Some(self.scale.iter().map(|w| w.abs()).collect())
    }

    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.channels)?;
        self.scale = self.scale.select(Axis(0), keep);
        self.shift = self.shift.select(Axis(0), keep);
        self.channels = keep.len();
        Ok(())
    }
}
