use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Task head whose output width is part of the external contract (e.g. a
/// classifier over a fixed label set). Its input is a fixed-size sink:
/// every channel group reaching it is excluded from pruning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedHeadOp {
    in_features: usize,
    out_features: usize,
    weight: ArrayD<f32>,
    bias: Option<ArrayD<f32>>,
}

impl FixedHeadOp {
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

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Op for FixedHeadOp {
    fn kind(&self) -> OpKind {
        OpKind::FixedHead
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

    fn input_rule(&self, input: usize) -> ChannelRule {
        if input == 0 {
            ChannelRule::Fixed
        } else {
            ChannelRule::None
        }
    }
}
