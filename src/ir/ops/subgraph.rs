use crate::ir::ops::{Op, OpKind, check_input_count};
use crate::ir::GraphContainer;
use crate::shape::{Shape, ShapeError};
use serde::{Deserialize, Serialize};

/// Vertex whose body is a nested graph container. Ownership is exclusive:
/// the body belongs to this vertex and is dropped with it. Flat traversals
/// treat the vertex as atomic through its declared boundary shapes;
/// structural algorithms recurse into `body`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphOp {
    body: GraphContainer,
}

impl SubgraphOp {
    pub fn new(body: GraphContainer) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &GraphContainer {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut GraphContainer {
        &mut self.body
    }

    pub fn into_body(self) -> GraphContainer {
        self.body
    }
}

impl Op for SubgraphOp {
    fn kind(&self) -> OpKind {
        OpKind::Subgraph
    }

    fn infer_output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        check_input_count(self.kind(), inputs, self.body.inputs().len())?;
        for (slot, input) in inputs.iter().enumerate() {
            let declared = self.body.declared_input_shape(slot);
            if declared != Some(input) {
                return Err(ShapeError::IncompatibleInput {
                    op: self.kind(),
                    shape: input.clone(),
                });
            }
        }
        self.body
            .declared_output_shapes()
            .ok_or(ShapeError::IncompatibleInput {
                op: self.kind(),
                shape: vec![],
            })
    }
}
