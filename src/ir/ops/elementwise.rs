use crate::ir::ops::{ChannelRule, Op, OpKind, check_input_count};
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum WhichElementwise {
    Add,
    Mul,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
}

impl WhichElementwise {
    pub fn arity(&self) -> usize {
        match self {
            WhichElementwise::Add | WhichElementwise::Mul => 2,
            _ => 1,
        }
    }
}

/// Pointwise operation. All operands and the result share one channel
/// layout, so every input is a pass-through coupling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementwiseOp {
    which: WhichElementwise,
}

impl ElementwiseOp {
    pub fn new(which: WhichElementwise) -> Self {
        Self { which }
    }

    pub fn which(&self) -> WhichElementwise {
        self.which
    }
}

impl Op for ElementwiseOp {
    fn kind(&self) -> OpKind {
        OpKind::Elementwise
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, self.which.arity())?;
        // Operand shapes come from trusted tracer metadata; cross-operand
        // channel agreement is enforced by the pruning engine's propagation.
        Ok(vec![inputs[0].clone()])
    }

    fn input_rule(&self, _input: usize) -> ChannelRule {
        ChannelRule::PassThrough
    }

    fn shrink_output_channels(&mut self, output: usize, _keep: &[usize]) -> Result<(), ShapeError> {
        if output != 0 {
            return Err(ShapeError::NotPrunable { op: self.kind() });
        }
        // No stored parameters; the width follows the producers.
        Ok(())
    }
}
