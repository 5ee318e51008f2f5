use crate::ir::ops::{Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

/// Declared graph input. Its width is part of the external contract, so the
/// output is never prunable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputOp {
    shape: Shape,
}

impl InputOp {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl Op for InputOp {
    fn kind(&self) -> OpKind {
        OpKind::Input
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 0)?;
        Ok(vec![self.shape.clone()])
    }
}
