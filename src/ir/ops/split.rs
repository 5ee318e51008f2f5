use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError, validate_keep};
use serde::{Deserialize, Serialize};

/// Split along one axis into consecutive sub-ranges of the given sizes,
/// one output per size. The inverse of concatenation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitOp {
    axis: usize,
    sizes: Vec<usize>,
}

impl SplitOp {
    pub fn new(axis: usize, sizes: Vec<usize>) -> Self {
        Self { axis, sizes }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

impl Op for SplitOp {
    fn kind(&self) -> OpKind {
        OpKind::Split
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, 1)?;
        let input = &inputs[0];
        if input.len() <= self.axis {
            return Err(ShapeError::AxisOutOfRange {
                axis: self.axis,
                shape: input.clone(),
            });
        }
        if input[self.axis] != self.sizes.iter().sum::<usize>() {
            return Err(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: input.clone(),
            });
        }
        Ok(self
            .sizes
            .iter()
            .map(|size| {
                let mut out = input.clone();
                out[self.axis] = *size;
                out
            })
            .collect())
    }

    fn input_rule(&self, _input: usize) -> ChannelRule {
        // Sub-range coupling is handled structurally by the pruning engine.
        ChannelRule::PassThrough
    }

    fn shrink_output_channels(&mut self, output: usize, keep: &[usize]) -> Result<(), ShapeError> {
        let size = self
            .sizes
            .get_mut(output)
            .ok_or(ShapeError::NotPrunable { op: OpKind::Split })?;
        validate_keep(keep, *size)?;
        *size = keep.len();
        Ok(())
    }
}
