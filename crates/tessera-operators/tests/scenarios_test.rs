//! End-to-end runs of compiled nets against their uncompiled originals.

mod common;

use common::*;
use tessera_compiler::{CompileOptions, compile};
use tessera_core::LayerConfig;
use tessera_runtime::{DataType, MemoryFormat, NetConfig};

fn uncompiled() -> NetConfig {
    NetConfig::default().with_compile(CompileOptions::none())
}

/// NCHW 1x1 convolution with bias, computed directly.
fn pointwise(input: &[f32], shape: [usize; 4], weight: &[f32], bias: &[f32]) -> Vec<f32> {
    let [n, c, h, w] = shape;
    let outputs = bias.len();
    let plane = h * w;
    let mut y = Vec::with_capacity(n * outputs * plane);
    for b in 0..n {
        for o in 0..outputs {
            for p in 0..plane {
                let acc: f32 = (0..c)
                    .map(|ic| weight[o * c + ic] * input[(b * c + ic) * plane + p])
                    .sum();
                y.push(acc + bias[o]);
            }
        }
    }
    y
}

/// Values stored at `scale` in `S8`, read back.
fn quantize(values: &[f32], scale: f32) -> Vec<f32> {
    values
        .iter()
        .map(|v| (v * scale).round().clamp(-128.0, 127.0) / scale)
        .collect()
}

#[test]
fn test_norm_affine_fusion_matches_unfused() -> anyhow::Result<()> {
    init_tracing();
    let graph = norm_affine_graph();
    let compiled = compile(&graph, &CompileOptions::default())?;
    assert_eq!(compiled.graph().len(), graph.len() - 1);
    let norm = &compiled.graph().nodes()[compiled.graph().find_node("A").unwrap()];
    assert_eq!(norm.outputs, vec!["y"]);

    let input = input_tensor(&[1, 4, 4, 4], 7);
    let (mut fused, mut ctx) = build_and_run(&graph, NetConfig::default(), &input)?;
    let (mut reference, mut ref_ctx) = build_and_run(&graph, uncompiled(), &input)?;
    assert!(!fused.has_layer("B"));
    assert!(reference.has_layer("B"));
    assert_eq!(fused.layer_by_name("A").unwrap().weights().len(), 5);

    let y = fused.output("y", &mut ctx)?;
    let expected = reference.output("y", &mut ref_ctx)?;
    assert_eq!(y.shape(), &[1, 4, 4, 4]);
    assert!(max_diff(&y, &expected) < 1e-5, "diff {}", max_diff(&y, &expected));
    Ok(())
}

#[test]
fn test_stride_redistribution_keeps_output() -> anyhow::Result<()> {
    init_tracing();
    let graph = sibling_stride_graph();
    let compiled = compile(&graph, &CompileOptions::default())?;
    let strides: Vec<[usize; 2]> = ["C", "D1", "D2"]
        .iter()
        .map(|name| {
            let node = &compiled.graph().nodes()[compiled.graph().find_node(name).unwrap()];
            match &node.config {
                LayerConfig::Convolution(conv) => conv.stride,
                other => panic!("{} is {}", name, other.op_type()),
            }
        })
        .collect();
    assert_eq!(strides, vec![[2, 2], [1, 1], [1, 1]]);

    let input = input_tensor(&[1, 4, 8, 8], 3);
    let (mut net, mut ctx) = build_and_run(&graph, NetConfig::default(), &input)?;
    let (mut reference, mut ref_ctx) = build_and_run(&graph, uncompiled(), &input)?;

    assert_eq!(net.blob_shape("c")?, vec![1, 4, 4, 4]);
    let out = net.output("out", &mut ctx)?;
    let expected = reference.output("out", &mut ref_ctx)?;
    assert_eq!(out.shape(), &[1, 8, 4, 4]);
    assert!(max_diff(&out, &expected) < 1e-5, "diff {}", max_diff(&out, &expected));
    Ok(())
}

#[test]
fn test_concat_rescales_to_smallest_scale() -> anyhow::Result<()> {
    init_tracing();
    let graph = quantized_concat_graph(1, [(3, 1.0), (3, 0.5)]);
    let input = integer_input(&[1, 2, 2, 2]);
    let (mut net, mut ctx) = build_and_run(&graph, NetConfig::default(), &input)?;

    let merged = net.blob_layout("cat")?;
    assert_eq!(merged.scale(), 0.5);
    assert_eq!(merged.dtype(), DataType::S8);
    assert_eq!(net.blob_layout("a")?.scale(), 1.0);
    assert_eq!(net.blob_layout("b")?.scale(), 0.5);
    let a_id = net.blob_by_name("a").unwrap();
    assert!(net.arena().get(a_id)?.alias_target().is_none());

    let nodes = graph.nodes();
    let (a, b) = (&nodes[1].weights, &nodes[2].weights);
    let x = input.as_slice();
    // a is stored at scale 1, then requantized to the merged scale
    let a_ref = quantize(&quantize(&pointwise(x, [1, 2, 2, 2], &a[0].data, &a[1].data), 1.0), 0.5);
    let b_ref = quantize(&pointwise(x, [1, 2, 2, 2], &b[0].data, &b[1].data), 0.5);
    let expected: Vec<f32> = a_ref.into_iter().chain(b_ref).collect();

    let out = net.output("cat", &mut ctx)?;
    assert_eq!(out.shape(), &[1, 6, 2, 2]);
    assert_eq!(out.to_vec(), expected);
    Ok(())
}

#[test]
fn test_repeated_forward_rebuilds_no_conversions() -> anyhow::Result<()> {
    init_tracing();
    let cases = [
        (norm_affine_graph(), "y", input_tensor(&[1, 4, 4, 4], 1)),
        (sibling_stride_graph(), "out", input_tensor(&[1, 4, 8, 8], 2)),
        (
            quantized_concat_graph(1, [(8, 1.0), (3, 1.0)]),
            "cat",
            integer_input(&[1, 2, 2, 2]),
        ),
    ];
    for (graph, output, input) in cases {
        let (mut net, mut ctx) = build_and_run(&graph, NetConfig::default(), &input)?;
        let first = net.output(output, &mut ctx)?;
        assert!(ctx.stats().builds > 0, "graph {}", graph.name);

        ctx.reset_stats();
        for _ in 0..3 {
            net.set_input("data", &input, &mut ctx)?;
            net.forward(&mut ctx, true)?;
            assert_eq!(net.output(output, &mut ctx)?, first, "graph {}", graph.name);
        }
        let stats = ctx.stats();
        assert_eq!(stats.builds, 0, "graph {}", graph.name);
        assert!(stats.hits > 0, "graph {}", graph.name);
        assert_eq!(stats.hit_ratio(), 1.0);
    }
    Ok(())
}

#[test]
fn test_reference_engine_agrees_with_native() -> anyhow::Result<()> {
    init_tracing();
    let graph = sibling_stride_graph();
    let input = input_tensor(&[1, 4, 8, 8], 9);
    let (mut native, mut ctx) = build_and_run(&graph, NetConfig::default(), &input)?;
    let (mut reference, mut ref_ctx) =
        build_and_run(&graph, NetConfig::default().with_engine("REFERENCE"), &input)?;

    assert_eq!(native.blob_layout("c")?.format(), MemoryFormat::Blocked8);
    assert!(reference.blob_layout("c")?.is_canonical());
    let out = native.output("out", &mut ctx)?;
    let expected = reference.output("out", &mut ref_ctx)?;
    assert!(max_diff(&out, &expected) < 1e-6);
    Ok(())
}
