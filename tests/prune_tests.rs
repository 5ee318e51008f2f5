use ndarray::ArrayD;
use slimgraph::ir::ops::{
    AttentionOp, ConcatOp, ConvOp, ElementwiseOp, FixedHeadOp, InputOp, LinearOp,
    NormalizationOp, SplitOp, WhichElementwise,
};
use slimgraph::prune::{
    prune, GroupStatus, MagnitudeScorer, OverlayConflict, PruneError, PruneOptions,
};
use slimgraph::{AnyOp, GraphContainer, Op, OpKind, PortRef, VertexId};
use std::sync::Once;

static INIT: Once = Once::new();

fn port(v: VertexId) -> Vec<PortRef> {
    vec![PortRef::new(v, 0)]
}

fn array(values: Vec<f32>) -> ArrayD<f32> {
    let len = values.len();
    ArrayD::from_shape_vec(vec![len], values).unwrap()
}

fn half() -> PruneOptions {
    // Initialize Logger
    INIT.call_once(|| {
        env_logger::init();
    });
    PruneOptions {
        drop_ratio: 0.5,
        ..PruneOptions::default()
    }
}

/// input -> conv -> norm -> relu -> conv -> fixed head
fn layer_chain() -> (GraphContainer, Vec<VertexId>) {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 8, 8])))
        .unwrap();
    let c1 = graph
        .add_vertex("c1", port(inp), AnyOp::Conv(ConvOp::new(3, 8, vec![1, 1])))
        .unwrap();
    let scale = array((0..8).map(|i| i as f32).collect());
    let shift = array(vec![0.0; 8]);
    let n = graph
        .add_vertex(
            "n",
            port(c1),
            AnyOp::Normalization(NormalizationOp::new(8).with_params(scale, shift)),
        )
        .unwrap();
    let r = graph
        .add_vertex(
            "r",
            port(n),
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Relu)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(r), AnyOp::Conv(ConvOp::new(8, 16, vec![1, 1])))
        .unwrap();
    let h = graph
        .add_vertex("h", port(c2), AnyOp::FixedHead(FixedHeadOp::new(8, 10)))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(h, 0)]).unwrap();
    (graph, vec![inp, c1, n, r, c2, h])
}

fn conv_of(graph: &GraphContainer, id: VertexId) -> &ConvOp {
    match graph.get(id).unwrap().op() {
        AnyOp::Conv(op) => op,
        other => panic!("expected a conv, got {:?}", other.kind()),
    }
}

#[test]
fn coupled_chain_prunes_as_one_group() {
    let (mut graph, ids) = layer_chain();
    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    // One prunable group across conv, norm and relu; the head pins c2.
    assert_eq!(report.pruned_groups(), 1);
    assert_eq!(report.dropped_channels(), 4);
    let pinned = report
        .groups
        .iter()
        .find(|g| g.ports == vec![PortRef::new(ids[4], 0)])
        .unwrap();
    assert_eq!(pinned.status, GroupStatus::Unprunable);

    assert_eq!(conv_of(&graph, ids[1]).out_channels(), 4);
    assert_eq!(conv_of(&graph, ids[4]).in_channels(), 4);
    assert_eq!(conv_of(&graph, ids[4]).out_channels(), 16);
    assert_eq!(graph.get(ids[2]).unwrap().output_shapes(), &[vec![1, 4, 8, 8]]);

    // Lowest-magnitude channels went first: the norm scale was 0..8.
    assert_eq!(
        graph.get(ids[2]).unwrap().op().channel_importance(),
        Some(vec![4.0, 5.0, 6.0, 7.0])
    );
}

#[test]
fn graph_outputs_are_never_pruned() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 8, 8])))
        .unwrap();
    let c = graph
        .add_vertex("c", port(inp), AnyOp::Conv(ConvOp::new(3, 8, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c, 0)]).unwrap();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();
    assert_eq!(report.dropped_channels(), 0);
    assert_eq!(report.groups[0].status, GroupStatus::Unprunable);
    assert_eq!(conv_of(&graph, c).out_channels(), 8);
}

#[test]
fn concat_subranges_prune_independently() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 4, 4])))
        .unwrap();
    let a = graph
        .add_vertex("a", port(inp), AnyOp::Conv(ConvOp::new(3, 4, vec![1, 1])))
        .unwrap();
    let b = graph
        .add_vertex("b", port(inp), AnyOp::Conv(ConvOp::new(3, 6, vec![1, 1])))
        .unwrap();
    let cat = graph
        .add_vertex(
            "cat",
            vec![PortRef::new(a, 0), PortRef::new(b, 0)],
            AnyOp::Concat(ConcatOp::new(1)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(cat), AnyOp::Conv(ConvOp::new(10, 4, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    // One group per source sub-range, no cross coupling.
    assert_eq!(report.pruned_groups(), 2);
    assert_eq!(report.dropped_channels(), 5);
    assert_eq!(conv_of(&graph, a).out_channels(), 2);
    assert_eq!(conv_of(&graph, b).out_channels(), 3);
    assert_eq!(conv_of(&graph, c2).in_channels(), 5);
    assert_eq!(
        graph.get(cat).unwrap().output_shapes(),
        &[vec![1, 5, 4, 4]]
    );
}

#[test]
fn split_subranges_stay_consistent_with_their_source() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 4, 4])))
        .unwrap();
    let c = graph
        .add_vertex("c", port(inp), AnyOp::Conv(ConvOp::new(3, 10, vec![1, 1])))
        .unwrap();
    let split = graph
        .add_vertex("split", port(c), AnyOp::Split(SplitOp::new(1, vec![4, 6])))
        .unwrap();
    let ca = graph
        .add_vertex(
            "ca",
            vec![PortRef::new(split, 0)],
            AnyOp::Conv(ConvOp::new(4, 2, vec![1, 1])),
        )
        .unwrap();
    let cb = graph
        .add_vertex(
            "cb",
            vec![PortRef::new(split, 1)],
            AnyOp::Conv(ConvOp::new(6, 2, vec![1, 1])),
        )
        .unwrap();
    graph
        .set_outputs(vec![PortRef::new(ca, 0), PortRef::new(cb, 0)])
        .unwrap();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    assert_eq!(report.pruned_groups(), 2);
    assert_eq!(report.dropped_channels(), 5);
    assert_eq!(conv_of(&graph, c).out_channels(), 5);
    assert_eq!(conv_of(&graph, ca).in_channels(), 2);
    assert_eq!(conv_of(&graph, cb).in_channels(), 3);
    assert_eq!(
        graph.get(split).unwrap().output_shapes(),
        &[vec![1, 2, 4, 4], vec![1, 3, 4, 4]]
    );
}

#[test]
fn remerged_split_halves_fail_without_touching_the_graph() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 4, 4])))
        .unwrap();
    let c = graph
        .add_vertex("c", port(inp), AnyOp::Conv(ConvOp::new(3, 4, vec![1, 1])))
        .unwrap();
    let split = graph
        .add_vertex("split", port(c), AnyOp::Split(SplitOp::new(1, vec![2, 2])))
        .unwrap();
    let add = graph
        .add_vertex(
            "add",
            vec![PortRef::new(split, 0), PortRef::new(split, 1)],
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Add)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(add), AnyOp::Conv(ConvOp::new(2, 2, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();
    let before = graph.clone();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    // The add couples each source channel with its counterpart in the
    // other half, so one coupled pair spans two channels of the conv
    // output. Narrowing a single pair cannot keep the split sizes valid;
    // the group is reported, nothing is mutated.
    let group = report.groups.iter().find(|g| g.ports.len() == 4).unwrap();
    assert!(matches!(group.status, GroupStatus::Failed(_)));
    assert_eq!(report.dropped_channels(), 0);
    assert_eq!(graph, before);
}

#[test]
fn grouped_conv_drops_whole_blocks() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 4, 4])))
        .unwrap();
    let c0 = graph
        .add_vertex("c0", port(inp), AnyOp::Conv(ConvOp::new(3, 8, vec![1, 1])))
        .unwrap();
    let grouped = ConvOp::new(8, 16, vec![1, 1]).with_groups(4).unwrap();
    let cg = graph
        .add_vertex("cg", port(c0), AnyOp::Conv(grouped))
        .unwrap();
    let r = graph
        .add_vertex(
            "r",
            port(cg),
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Relu)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(r), AnyOp::Conv(ConvOp::new(16, 4, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    let group = report
        .groups
        .iter()
        .find(|g| g.status == GroupStatus::Pruned)
        .unwrap();
    assert_eq!(group.block, 4);
    assert_eq!(group.dropped % 4, 0);
    assert_eq!(conv_of(&graph, cg).out_channels(), 8);
    assert_eq!(conv_of(&graph, c2).in_channels(), 8);
    // Its own producer feeds a grouped input, so it is pinned.
    assert_eq!(conv_of(&graph, c0).out_channels(), 8);
}

#[test]
fn attention_drops_in_head_multiples() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![2, 8])))
        .unwrap();
    let att = graph
        .add_vertex("att", port(inp), AnyOp::Attention(AttentionOp::new(8, 4, 4)))
        .unwrap();
    let lin = graph
        .add_vertex("lin", port(att), AnyOp::Linear(LinearOp::new(16, 4)))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(lin, 0)]).unwrap();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    assert_eq!(report.dropped_channels(), 8);
    match graph.get(att).unwrap().op() {
        AnyOp::Attention(op) => assert_eq!(op.num_heads(), 2),
        other => panic!("expected attention, got {:?}", other.kind()),
    }
    match graph.get(lin).unwrap().op() {
        AnyOp::Linear(op) => assert_eq!(op.in_features(), 8),
        other => panic!("expected linear, got {:?}", other.kind()),
    }
}

fn conflicting_blocks() -> (GraphContainer, VertexId, VertexId) {
    let mut graph = GraphContainer::new();
    let inp1 = graph
        .add_vertex("input1", vec![], AnyOp::Input(InputOp::new(vec![1, 8, 4])))
        .unwrap();
    let cg = graph
        .add_vertex(
            "cg",
            port(inp1),
            AnyOp::Conv(ConvOp::new(8, 16, vec![1]).with_groups(4).unwrap()),
        )
        .unwrap();
    let inp2 = graph
        .add_vertex("input2", vec![], AnyOp::Input(InputOp::new(vec![2, 8])))
        .unwrap();
    let att = graph
        .add_vertex("att", port(inp2), AnyOp::Attention(AttentionOp::new(8, 2, 8)))
        .unwrap();
    let add = graph
        .add_vertex(
            "add",
            vec![PortRef::new(cg, 0), PortRef::new(att, 0)],
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Add)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(add), AnyOp::Conv(ConvOp::new(16, 2, vec![1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();
    (graph, cg, att)
}

#[test]
fn conflicting_block_constraints_pin_the_group_by_default() {
    let (mut graph, cg, _) = conflicting_blocks();
    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    let group = report.groups.iter().find(|g| g.ports.len() == 3).unwrap();
    assert_eq!(group.status, GroupStatus::Unprunable);
    assert_eq!(conv_of(&graph, cg).out_channels(), 16);
}

#[test]
fn conflicting_block_constraints_can_widen_to_the_lcm() {
    let (mut graph, cg, att) = conflicting_blocks();
    let options = PruneOptions {
        overlay_conflict: OverlayConflict::LeastCommonMultiple,
        ..half()
    };
    let report = prune(&mut graph, &MagnitudeScorer, &options).unwrap();

    let group = report.groups.iter().find(|g| g.ports.len() == 3).unwrap();
    assert_eq!(group.block, 8);
    assert_eq!(group.dropped, 8);
    assert_eq!(conv_of(&graph, cg).out_channels(), 8);
    match graph.get(att).unwrap().op() {
        AnyOp::Attention(op) => assert_eq!(op.num_heads(), 1),
        other => panic!("expected attention, got {:?}", other.kind()),
    }
}

#[test]
fn disagreeing_coupled_widths_are_an_error() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 4, 4])))
        .unwrap();
    let c = graph
        .add_vertex("c", port(inp), AnyOp::Conv(ConvOp::new(3, 10, vec![1, 1])))
        .unwrap();
    let split = graph
        .add_vertex("split", port(c), AnyOp::Split(SplitOp::new(1, vec![4, 6])))
        .unwrap();
    // Elementwise construction trusts the traced metadata; the engine is
    // where the 4-vs-6 disagreement must surface.
    let add = graph
        .add_vertex(
            "add",
            vec![PortRef::new(split, 0), PortRef::new(split, 1)],
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Add)),
        )
        .unwrap();
    graph.set_outputs(vec![PortRef::new(add, 0)]).unwrap();

    let err = prune(&mut graph, &MagnitudeScorer, &half()).unwrap_err();
    assert!(matches!(
        err,
        PruneError::ShapeMismatch { left: 4, right: 6, .. }
    ));
}

#[test]
fn nested_bodies_are_pruned_with_their_boundary_fixed() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 8, 8])))
        .unwrap();
    let c1 = graph
        .add_vertex("c1", port(inp), AnyOp::Conv(ConvOp::new(3, 8, vec![1, 1])))
        .unwrap();
    let r = graph
        .add_vertex(
            "r",
            port(c1),
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Relu)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(r), AnyOp::Conv(ConvOp::new(8, 4, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();
    let sub = slimgraph::rewrite::wrap(&mut graph, &[c1, r, c2], &[PortRef::new(inp, 0)], "block")
        .unwrap();
    let boundary_shape = graph.get(sub).unwrap().output_shapes().to_vec();

    let report = prune(&mut graph, &MagnitudeScorer, &half()).unwrap();

    assert_eq!(report.nested.len(), 1);
    assert_eq!(report.nested[0].0, "block");
    assert_eq!(report.nested[0].1.dropped_channels(), 4);
    assert_eq!(graph.get(sub).unwrap().output_shapes(), &boundary_shape[..]);
    // Interior narrowed inside the body.
    match graph.get(sub).unwrap().op() {
        AnyOp::Subgraph(op) => {
            let body = op.body();
            let narrowed = body.vertex_ids().any(|id| match body.get(id).unwrap().op() {
                AnyOp::Conv(c) => c.out_channels() == 4 && c.in_channels() == 3,
                _ => false,
            });
            assert!(narrowed);
        }
        other => panic!("expected subgraph, got {:?}", other.kind()),
    }
}

#[test]
fn inlining_flattens_before_pruning() {
    let mut graph = GraphContainer::new();
    let inp = graph
        .add_vertex("input", vec![], AnyOp::Input(InputOp::new(vec![1, 3, 8, 8])))
        .unwrap();
    let c1 = graph
        .add_vertex("c1", port(inp), AnyOp::Conv(ConvOp::new(3, 8, vec![1, 1])))
        .unwrap();
    let r = graph
        .add_vertex(
            "r",
            port(c1),
            AnyOp::Elementwise(ElementwiseOp::new(WhichElementwise::Relu)),
        )
        .unwrap();
    let c2 = graph
        .add_vertex("c2", port(r), AnyOp::Conv(ConvOp::new(8, 4, vec![1, 1])))
        .unwrap();
    graph.set_outputs(vec![PortRef::new(c2, 0)]).unwrap();
    slimgraph::rewrite::wrap(&mut graph, &[c1, r, c2], &[PortRef::new(inp, 0)], "block").unwrap();

    let options = PruneOptions {
        inline_subgraphs: true,
        ..half()
    };
    let report = prune(&mut graph, &MagnitudeScorer, &options).unwrap();

    assert!(report.nested.is_empty());
    assert_eq!(report.dropped_channels(), 4);
    assert!(
        graph
            .vertex_ids()
            .all(|id| graph.get(id).unwrap().kind() != OpKind::Subgraph)
    );
    assert_eq!(graph.len(), 4);
}
