use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, validate_keep};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Fully connected layer over the last axis. Weight layout is
/// `[out_features, in_features]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearOp {
    in_features: usize,
    out_features: usize,
    weight: ArrayD<f32>,
    bias: Option<ArrayD<f32>>,
}

impl LinearOp {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            weight: ArrayD::zeros(vec![out_features, in_features]),
            bias: None,
        }
    }

    pub fn with_weight(mut self, weight: ArrayD<f32>, bias: Option<ArrayD<f32>>) -> Self {
        self.weight = weight;
        self.bias = bias;
        self
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &ArrayD<f32> {
        &self.weight
    }
}

impl Op for LinearOp {
    fn kind(&self) -> OpKind {
        OpKind::Linear
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        let input = &inputs[0];
        if input.last() != Some(&self.in_features) {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: input.clone(),
            });
        }
        let mut out = input.clone();
        *out.last_mut().unwrap() = self.out_features;
        Ok(vec![out])
    }

    fn prunable_channels(&self, output: usize) -> Option<usize> {
        (output == 0).then_some(self.out_features)
    }

    fn input_rule(&self, input: usize) -> ChannelRule {
        if input == 0 {
            ChannelRule::Consume
        } else {
            ChannelRule::None
        }
    }

    fn channel_importance(&self) -> Option<Vec<f32>> {
        Some(
            (0..self.out_features)
                .map(|i| self.weight.index_axis(Axis(0), i).iter().map(|w| w.abs()).sum())
                .collect(),
        )
    }

    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.out_features)?;
        self.weight = self.weight.select(Axis(0), keep);
        if let Some(bias) = &self.bias {
            self.bias = Some(bias.select(Axis(0), keep));
        }
        self.out_features = keep.len();
        Ok(())
    }

    fn shrink_input_channels(&mut self, input: usize, keep: &[usize]) -> Result<(), ShapeError> {
        if input != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        validate_keep(keep, self.in_features)?;
        self.weight = self.weight.select(Axis(1), keep);
        self.in_features = keep.len();
        Ok(())
    }
}
