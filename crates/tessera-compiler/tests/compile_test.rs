//! End-to-end tests of the rewrite pipeline.

mod common;

use common::*;
use tessera_compiler::{CompileOptions, CompilerPipeline, compile};
use tessera_core::{
    BatchNormConfig, ConvolutionConfig, EltwiseConfig, Error, FusionType, GraphBuilder,
    GraphModel, LayerConfig, PoolingConfig, RewriteStage, ScaleConfig,
};

fn conv_of<'a>(graph: &'a GraphModel, name: &str) -> &'a tessera_core::ConvolutionConfig {
    let index = graph.find_node(name).unwrap();
    match &graph.nodes()[index].config {
        LayerConfig::Convolution(conv) => conv,
        other => panic!("{name} is {}", other.op_type()),
    }
}

#[test]
fn test_norm_affine_scenario() -> anyhow::Result<()> {
    init_tracing();
    let graph = norm_affine_graph();
    let compiled = compile(&graph, &CompileOptions::default())?;
    let out = compiled.graph();

    assert_eq!(out.len(), graph.len() - 1);
    assert!(out.find_node("B").is_none());
    let a = &out.nodes()[out.find_node("A").unwrap()];
    assert_eq!(a.outputs, vec!["y"]);
    assert!(matches!(&a.config, LayerConfig::BatchNorm(bn) if bn.scale_bias));
    assert!(out.compile_state.norm_affine_merged);
    Ok(())
}

#[test]
fn test_sibling_stride_scenario() -> anyhow::Result<()> {
    init_tracing();
    let options = CompileOptions::none().enable(RewriteStage::StrideRedistribution);
    let compiled = compile(&sibling_stride_graph(), &options)?;
    let out = compiled.graph();

    assert_eq!(conv_of(out, "C").stride, [2, 2]);
    assert_eq!(conv_of(out, "D1").stride, [1, 1]);
    assert_eq!(conv_of(out, "D2").stride, [1, 1]);
    assert_eq!(out.output_edges(), vec!["out"]);
    Ok(())
}

#[test]
fn test_compile_is_idempotent() -> anyhow::Result<()> {
    init_tracing();
    for options in [CompileOptions::default(), CompileOptions::all()] {
        for graph in [norm_affine_graph(), sibling_stride_graph(), residual_graph()] {
            let once = compile(&graph, &options)?;
            let twice = compile(once.graph(), &options)?;
            assert_eq!(twice, once, "graph {}", graph.name);
        }
    }
    Ok(())
}

#[test]
fn test_outputs_preserved() -> anyhow::Result<()> {
    init_tracing();
    for graph in [norm_affine_graph(), sibling_stride_graph(), residual_graph()] {
        let compiled = compile(&graph, &CompileOptions::all())?;
        assert_eq!(
            compiled.graph().output_edges(),
            graph.output_edges(),
            "graph {}",
            graph.name
        );
    }
    Ok(())
}

#[test]
fn test_residual_graph_shrinks() -> anyhow::Result<()> {
    init_tracing();
    let graph = residual_graph();
    let compiled = compile(&graph, &CompileOptions::all())?;
    let out = compiled.graph();

    // scale1 and every relu are absorbed, the block sums fold into branch2b
    for gone in ["scale1", "relu1", "res2a_branch2a_relu", "res2a", "res2a_relu"] {
        assert!(out.find_node(gone).is_none(), "{gone} should be fused");
    }
    let fused = conv_of(out, "res2a_branch2b");
    assert_eq!(fused.fusion, FusionType::Sum);
    assert!(fused.relu);
    assert_eq!(out.output_edges(), vec!["res2b"]);
    Ok(())
}

#[test]
fn test_sum_operand_rewritten_in_place_stays_unfused() -> anyhow::Result<()> {
    init_tracing();
    let graph = GraphBuilder::new("rewritten")
        .input("data", &[1, 4, 8, 8])
        .convolution("shortcut", "data", "a", ConvolutionConfig::new(4, 1))
        .convolution("branch", "data", "b", ConvolutionConfig::new(4, 3).with_pad(1))
        .leaky_relu("r", "a", "a", 0.1)
        .eltwise("sum", &["a", "b"], "s", EltwiseConfig::sum())
        .build();

    let only_sum = CompileOptions::none().enable(RewriteStage::ConvSumFusion);
    let compiled = compile(&graph, &only_sum)?;
    assert_eq!(compiled.graph().nodes(), graph.nodes());

    let compiled = compile(&graph, &CompileOptions::all())?;
    assert!(compiled.graph().find_node("sum").is_some());
    assert_eq!(conv_of(compiled.graph(), "branch").fusion, FusionType::None);
    Ok(())
}

#[test]
fn test_multi_consumer_guard() -> anyhow::Result<()> {
    init_tracing();
    let graph = GraphBuilder::new("fanout")
        .input("data", &[1, 2, 4, 4])
        .convolution("conv", "data", "conv", ConvolutionConfig::new(2, 1))
        .relu("relu", "conv", "r")
        .pooling("pool", "conv", "p", PoolingConfig::max(2, 2))
        .batch_norm("bn", "p", "b", BatchNormConfig::default())
        .scale("scale", "b", "s1", ScaleConfig::default())
        .scale("scale2", "b", "s2", ScaleConfig::default())
        .build();
    let compiled = compile(&graph, &CompileOptions::all())?;
    let out = compiled.graph();

    assert_eq!(out.len(), graph.len());
    assert!(!conv_of(out, "conv").relu);
    assert!(matches!(
        &out.nodes()[out.find_node("bn").unwrap()].config,
        LayerConfig::BatchNorm(bn) if !bn.scale_bias
    ));
    Ok(())
}

#[test]
fn test_affine_fusion_precedes_activation_fusion() -> anyhow::Result<()> {
    init_tracing();
    let graph = GraphBuilder::new("bn_scale_relu")
        .input("data", &[1, 2, 4, 4])
        .batch_norm("bn", "data", "x", BatchNormConfig::default())
        .scale("scale", "x", "x", ScaleConfig::default())
        .relu("relu", "x", "x")
        .build();

    let out = compile(&graph, &CompileOptions::default())?.into_graph();
    assert_eq!(out.len(), 2);
    assert!(matches!(
        &out.nodes()[1].config,
        LayerConfig::BatchNorm(bn) if bn.scale_bias && bn.relu
    ));

    // Without the affine merge the rectifier's producer is the Scale node,
    // so nothing fuses.
    let options = CompileOptions::default().disable(RewriteStage::NormAffineFusion);
    let out = compile(&graph, &options)?.into_graph();
    assert_eq!(out, graph);
    Ok(())
}

#[test]
fn test_disabled_pipeline_only_validates() -> anyhow::Result<()> {
    let graph = residual_graph();
    let compiled = compile(&graph, &CompileOptions::none())?;
    assert_eq!(compiled.graph().nodes(), graph.nodes());
    Ok(())
}

#[test]
fn test_unknown_bottom_is_configuration_error() {
    let graph = GraphBuilder::new("broken")
        .input("data", &[1, 2, 4, 4])
        .relu("relu", "missing", "out")
        .build();
    let err = compile(&graph, &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("Unknown bottom blob 'missing'"));
}

#[test]
fn test_custom_pass_runs_in_its_stage() -> anyhow::Result<()> {
    struct Rename;

    impl tessera_core::Pass for Rename {
        fn name(&self) -> &str {
            "rename"
        }

        fn stage(&self) -> RewriteStage {
            RewriteStage::NormAffineFusion
        }

        fn run(&self, graph: &GraphModel) -> tessera_core::Result<GraphModel> {
            let mut out = graph.clone();
            out.name = format!("{}_renamed", graph.name);
            Ok(out)
        }
    }

    let mut pipeline = CompilerPipeline::new(CompileOptions::default());
    pipeline.add_pass(Rename);
    let names = pipeline.pass_names();
    assert_eq!(names[0], "norm_affine_fusion");
    assert_eq!(names[1], "rename");

    let compiled = pipeline.compile(&norm_affine_graph())?;
    assert_eq!(compiled.graph().name, "norm_affine_renamed");
    Ok(())
}
