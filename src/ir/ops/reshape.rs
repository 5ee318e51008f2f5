use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, element_count};
use serde::{Deserialize, Serialize};

/// Free-form reshape to a fixed target shape. Channel identity does not
/// survive an arbitrary reshape, so the producer is pinned; attention-style
/// head reshapes are normalized into `Attention` vertices by the
/// constructor instead of passing through here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReshapeOp {
    target: Shape,
}

impl ReshapeOp {
    pub fn new(target: Shape) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Shape {
        &self.target
    }
}

impl Op for ReshapeOp {
    fn kind(&self) -> OpKind {
        OpKind::Reshape
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        if element_count(&inputs[0]) != element_count(&self.target) {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: inputs[0].clone(),
            });
        }
        Ok(vec![self.target.clone()])
    }

    fn input_rule(&self, _input: usize) -> ChannelRule {
        ChannelRule::Fixed
    }
}
