use crate::ir::ops::{ChannelRule, Op, OpKind};
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

/// Concatenation along one axis. Each source keeps its own channel group;
/// the merged axis is a view over the per-source sub-ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcatOp {
    axis: usize,
}

impl ConcatOp {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl Op for ConcatOp {
    fn kind(&self) -> OpKind {
        OpKind::Concat
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        let first = inputs.first().ok_or(ShapeError::WrongInputCount {
            op: self.kind(),
            expected: 1,
            actual: 0,
        })?;
        if first.len() <= self.axis {
            return Err(ShapeError::AxisOutOfRange {
                axis: self.axis,
                shape: first.clone(),
            });
        }
        let mut out = first.clone();
        for input in &inputs[1..] {
            let compatible = input.len() == first.len()
                && input
                    .iter()
                    .zip(first.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == self.axis || a == b);
            if !compatible {
                return Err(ShapeError::IncompatibleInput {
                    op: self.kind(),
                    shape: input.clone(),
                });
            }
            out[self.axis] += input[self.axis];
        }
        Ok(vec![out])
    }

    fn input_rule(&self, _input: usize) -> ChannelRule {
        // Sub-range coupling is handled structurally by the pruning engine.
        ChannelRule::PassThrough
    }

    fn shrink_output_channels(&mut self, output: usize, _keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        // Width is derived from the producers.
        Ok(())
    }
}
