//! Persisted document format for graph containers. The document is
//! self-contained: ids, kinds, configurations and wiring are stored
//! explicitly, with nested sub-graph documents recursively, so a round trip
//! never needs the original construction code.

use crate::ir::ops::{AnyOp, Op, OpKind, SubgraphOp};
use crate::ir::{GraphContainer, IrError, PortRef, VertexId};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("unsupported document version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("document decoding error")]
    Decode(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ir(#[from] IrError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub version: u32,
    pub vertices: Vec<VertexDocument>,
    pub inputs: Vec<VertexId>,
    pub outputs: Vec<PortRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexDocument {
    pub id: VertexId,
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<PortRef>,
    pub config: OpDocument,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpDocument {
    Atomic(AnyOp),
    Subgraph(Box<GraphDocument>),
}

pub fn to_document(graph: &GraphContainer) -> GraphDocument {
    let vertices = graph
        .vertex_ids()
        .map(|id| {
            let vertex = graph.get(id).expect("iterating existing ids");
            let config = match vertex.op() {
                AnyOp::Subgraph(sub) => OpDocument::Subgraph(Box::new(to_document(sub.body()))),
                op => OpDocument::Atomic(op.clone()),
            };
            VertexDocument {
                id,
                name: vertex.name().to_string(),
                kind: vertex.kind(),
                inputs: vertex.inputs().to_vec(),
                config,
            }
        })
        .collect();
    GraphDocument {
        version: DOCUMENT_VERSION,
        vertices,
        inputs: graph.inputs().to_vec(),
        outputs: graph.outputs().to_vec(),
    }
}

pub fn from_document(doc: &GraphDocument) -> Result<GraphContainer, SerializeError> {
    if doc.version != DOCUMENT_VERSION {
        return Err(SerializeError::UnsupportedVersion(doc.version));
    }
    let mut entries = Vec::with_capacity(doc.vertices.len());
    for vertex in &doc.vertices {
        let op = match &vertex.config {
            OpDocument::Atomic(AnyOp::Subgraph(_)) => {
                return Err(SerializeError::MalformedDocument(format!(
                    "vertex {} stores a subgraph as an atomic config",
                    vertex.id
                )));
            }
            OpDocument::Atomic(op) => op.clone(),
            OpDocument::Subgraph(body) => AnyOp::Subgraph(SubgraphOp::new(from_document(body)?)),
        };
        if op.kind() != vertex.kind {
            return Err(SerializeError::MalformedDocument(format!(
                "vertex {} declares kind {} but its config is {}",
                vertex.id,
                vertex.kind,
                op.kind()
            )));
        }
        entries.push((vertex.id, vertex.name.clone(), vertex.inputs.clone(), op));
    }
    Ok(GraphContainer::from_parts(
        entries,
        doc.inputs.clone(),
        doc.outputs.clone(),
    )?)
}

/// Writes the container as a JSON document. The handle is scoped to this
/// function and closed on every exit path.
pub fn save_json(graph: &GraphContainer, path: impl AsRef<Path>) -> Result<(), SerializeError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &to_document(graph))
        .map_err(|e| SerializeError::Decode(anyhow::Error::from(e)))?;
    Ok(())
}

/// Reads a JSON document and reconstructs a fully validated container.
pub fn load_json(path: impl AsRef<Path>) -> Result<GraphContainer, SerializeError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let doc: GraphDocument = serde_json::from_reader(reader)
        .map_err(|e| SerializeError::Decode(anyhow::Error::from(e)))?;
    from_document(&doc)
}
