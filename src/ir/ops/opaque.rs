use crate::ir::ops::{Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

/// Atomic fallback for trace records that cannot be classified or safely
/// collapsed. Correct by construction (declared shapes are carried through
/// verbatim) but invisible to pruning and rewriting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpaqueOp {
    op_name: String,
    num_inputs: usize,
    output_shapes: Vec<Shape>,
}

impl OpaqueOp {
    pub fn new(op_name: impl Into<String>, num_inputs: usize, output_shapes: Vec<Shape>) -> Self {
        Self {
            op_name: op_name.into(),
            num_inputs,
            output_shapes,
        }
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }
}

impl Op for OpaqueOp {
    fn kind(&self) -> OpKind {
        OpKind::Opaque
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, self.num_inputs)?;
        Ok(self.output_shapes.clone())
    }
}
