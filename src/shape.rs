use crate::ir::ops::OpKind;

/// Static tensor shape. The tracing frontend supplies fully known
/// dimensions, so no symbolic dimension machinery is needed here.
pub type Shape = Vec<usize>;

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("{op} expected {expected} inputs, got {actual}")]
    WrongInputCount {
        op: OpKind,
        expected: usize,
        actual: usize,
    },
    #[error("{op} cannot accept input shape {shape:?}")]
    IncompatibleInput { op: OpKind, shape: Shape },
    #[error("axis {axis} out of range for shape {shape:?}")]
    AxisOutOfRange { axis: usize, shape: Shape },
    #[error("{op} has no prunable channels on the requested slot")]
    NotPrunable { op: OpKind },
    #[error("channel selection {keep:?} is invalid for width {width}")]
    BadChannelSelection { keep: Vec<usize>, width: usize },
}

/// Checks that a keep-list is sorted, unique and in range for `width`.
pub(crate) fn validate_keep(keep: &[usize], width: usize) -> Result<(), ShapeError> {
    let ok = !keep.is_empty()
        && keep.windows(2).all(|w| w[0] < w[1])
        && *keep.last().unwrap() < width;
    if ok {
        Ok(())
    } else {
        Err(ShapeError::BadChannelSelection {
            keep: keep.to_vec(),
            width,
        })
    }
}

pub(crate) fn element_count(shape: &Shape) -> usize {
    shape.iter().product()
}
