use ndarray::ArrayD;
use slimgraph::ir::ops::WhichElementwise;
use slimgraph::trace::{build_graph, TraceArg, TraceError, TraceRecord, TraceValue};
use slimgraph::{AnyOp, Op, OpKind};

fn weight(shape: Vec<usize>) -> ArrayD<f32> {
    ArrayD::zeros(shape)
}

#[test]
fn frontend_idioms_collapse_to_canonical_vertices() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![1, 3, 8, 8]]),
        TraceRecord::new("conv2d", vec![TraceArg::to(0)], vec![vec![1, 8, 8, 8]])
            .with_attr("padding", TraceValue::Int(1))
            .with_param("weight", weight(vec![8, 3, 3, 3])),
        TraceRecord::new("relu_", vec![TraceArg::to(1)], vec![vec![1, 8, 8, 8]]),
        TraceRecord::new("conv2d", vec![TraceArg::to(2)], vec![vec![1, 8, 8, 8]])
            .with_attr("padding", TraceValue::Int(1))
            .with_param("weight", weight(vec![8, 8, 3, 3])),
        // Residual written with the in-place idiom.
        TraceRecord::new(
            "__iadd__",
            vec![TraceArg::to(3), TraceArg::to(2)],
            vec![vec![1, 8, 8, 8]],
        ),
        TraceRecord::new("classifier", vec![TraceArg::to(4)], vec![vec![1, 8, 8, 10]])
            .with_param("weight", weight(vec![10, 8])),
    ];

    let graph = build_graph(&records, &[(5, 0)]).unwrap();

    let kinds: Vec<OpKind> = graph
        .topological_order()
        .into_iter()
        .map(|id| graph.get(id).unwrap().kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            OpKind::Input,
            OpKind::Conv,
            OpKind::Elementwise,
            OpKind::Conv,
            OpKind::Elementwise,
            OpKind::FixedHead,
        ]
    );

    let adds = graph
        .vertex_ids()
        .filter(|id| match graph.get(*id).unwrap().op() {
            AnyOp::Elementwise(op) => op.which() == WhichElementwise::Add,
            _ => false,
        })
        .count();
    assert_eq!(adds, 1);
    assert_eq!(
        graph.output_shape(graph.outputs()[0]).unwrap(),
        &vec![1, 8, 8, 10]
    );
}

#[test]
fn structural_records_fold_into_configuration() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new("size", vec![TraceArg::to(0)], vec![]),
        TraceRecord::new(
            "getitem",
            vec![TraceArg::to(1), TraceArg::int(1)],
            vec![],
        ),
        TraceRecord::new(
            "floordiv",
            vec![TraceArg::to(2), TraceArg::int(2)],
            vec![],
        ),
        // The folded scalar rides along as an argument without ever
        // becoming a vertex.
        TraceRecord::new(
            "view",
            vec![TraceArg::to(0), TraceArg::to(3)],
            vec![vec![2, 4, 2]],
        )
        .with_attr("shape", TraceValue::IntList(vec![-1, 4, 2])),
    ];

    let graph = build_graph(&records, &[(4, 0)]).unwrap();

    // Only the tensor-bearing records became vertices.
    assert_eq!(graph.len(), 2);
    let kinds: Vec<OpKind> = graph
        .topological_order()
        .into_iter()
        .map(|id| graph.get(id).unwrap().kind())
        .collect();
    assert_eq!(kinds, vec![OpKind::Input, OpKind::Reshape]);
    assert_eq!(
        graph.output_shape(graph.outputs()[0]).unwrap(),
        &vec![2, 4, 2]
    );
}

#[test]
fn folded_records_cannot_be_graph_outputs() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new("size", vec![TraceArg::to(0)], vec![]),
    ];
    let err = build_graph(&records, &[(1, 0)]).unwrap_err();
    assert!(matches!(err, TraceError::UntraceableStructure(_)));
}

#[test]
fn mixed_tensor_scalar_arithmetic_stays_opaque() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new(
            "add",
            vec![TraceArg::to(0), TraceArg::int(1)],
            vec![vec![2, 8]],
        ),
    ];
    let graph = build_graph(&records, &[(1, 0)]).unwrap();
    let last = graph.topological_order().pop().unwrap();
    assert_eq!(graph.get(last).unwrap().kind(), OpKind::Opaque);
}

#[test]
fn unknown_operations_become_opaque_vertices() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new("fancy_rotary", vec![TraceArg::to(0)], vec![vec![2, 8]]),
    ];
    let graph = build_graph(&records, &[(1, 0)]).unwrap();
    let last = graph.topological_order().pop().unwrap();
    match graph.get(last).unwrap().op() {
        AnyOp::Opaque(op) => assert_eq!(op.op_name(), "fancy_rotary"),
        other => panic!("expected opaque, got {:?}", other.kind()),
    }
}

#[test]
fn forward_references_are_untraceable() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new(
            "add",
            vec![
                TraceArg::to(0),
                TraceArg::Ref {
                    record: 2,
                    output: 0,
                },
            ],
            vec![vec![2, 8]],
        ),
        TraceRecord::new("relu", vec![TraceArg::to(1)], vec![vec![2, 8]]),
    ];
    let err = build_graph(&records, &[(2, 0)]).unwrap_err();
    assert!(matches!(err, TraceError::UntraceableStructure(_)));
}

#[test]
fn chunk_records_become_split_vertices() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![1, 6, 4]]),
        TraceRecord::new(
            "chunk",
            vec![TraceArg::to(0)],
            vec![vec![1, 2, 4], vec![1, 4, 4]],
        )
        .with_attr("dim", TraceValue::Int(1)),
        TraceRecord::new(
            "relu",
            vec![TraceArg::Ref {
                record: 1,
                output: 1,
            }],
            vec![vec![1, 4, 4]],
        ),
    ];

    let graph = build_graph(&records, &[(2, 0)]).unwrap();

    let order = graph.topological_order();
    let split = order[1];
    match graph.get(split).unwrap().op() {
        AnyOp::Split(op) => assert_eq!(op.sizes(), &[2, 4]),
        other => panic!("expected split, got {:?}", other.kind()),
    }
    let relu = order[2];
    assert_eq!(graph.get(relu).unwrap().inputs()[0].output, 1);
    assert_eq!(
        graph.get(relu).unwrap().output_shapes(),
        &[vec![1, 4, 4]]
    );
}

#[test]
fn scalar_float_arithmetic_folds_away() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![2, 8]]),
        TraceRecord::new(
            "mul",
            vec![
                TraceArg::Value(TraceValue::Float(1.5)),
                TraceArg::Value(TraceValue::Float(2.0)),
            ],
            vec![],
        ),
        // Truncated back to an integer before feeding integer folding.
        TraceRecord::new("int", vec![TraceArg::to(1)], vec![]),
        TraceRecord::new(
            "floordiv",
            vec![TraceArg::to(2), TraceArg::int(3)],
            vec![],
        ),
        TraceRecord::new("relu", vec![TraceArg::to(0)], vec![vec![2, 8]]),
    ];
    let graph = build_graph(&records, &[(4, 0)]).unwrap();

    // The whole scalar chain folded without producing a vertex.
    assert_eq!(graph.len(), 2);
}

#[test]
fn missing_parameters_are_reported_with_context() {
    let records = vec![
        TraceRecord::new("input", vec![], vec![vec![1, 3, 8, 8]]),
        TraceRecord::new("conv2d", vec![TraceArg::to(0)], vec![vec![1, 8, 6, 6]]),
    ];
    let err = build_graph(&records, &[(1, 0)]).unwrap_err();
    assert!(matches!(
        err,
        TraceError::MissingDetail {
            record: 1,
            what: "weight",
            ..
        }
    ));
}
