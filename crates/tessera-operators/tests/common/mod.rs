//! Common test utilities for operator integration tests.
//!
//! Provides deterministic weights and the graphs the integration tests run:
//! - normalization + affine chains
//! - sibling strided convolutions merged by an add
//! - quantized branches joined by a concatenation

#![allow(dead_code)]

use tessera_core::{
    BatchNormConfig, ConcatConfig, ConvolutionConfig, EltwiseConfig, GraphBuilder, GraphModel,
    ScaleConfig, WeightBlob,
};
use tessera_operators::core_operator_registry;
use tessera_runtime::{ExecutionContext, Net, NetConfig, Tensor};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// Deterministic values in `[-1, 1)`.
pub fn wave(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 37 + seed * 101) % 64) as f32 / 32.0 - 1.0)
        .collect()
}

/// Deterministic small integers in `[-2, 2]`.
pub fn small_ints(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + seed * 3) % 5) as f32 - 2.0)
        .collect()
}

pub fn blob(shape: &[usize], values: Vec<f32>) -> WeightBlob {
    WeightBlob::new(shape.to_vec(), values).unwrap()
}

pub fn wave_blob(shape: &[usize], seed: usize) -> WeightBlob {
    let len = shape.iter().product();
    blob(shape, wave(len, seed))
}

/// Input values in `[-0.25, 0.25)`.
pub fn input_tensor(shape: &[usize], seed: usize) -> Tensor {
    let len = shape.iter().product();
    let values = wave(len, seed).into_iter().map(|v| v * 0.25).collect();
    Tensor::from_vec(values, shape).unwrap()
}

/// Normalization weights for `channels`: sums, positive variances, and a
/// moving-average factor of 2.
pub fn norm_weights(channels: usize, seed: usize) -> Vec<WeightBlob> {
    let var: Vec<f32> = wave(channels, seed + 1).iter().map(|v| v.abs() + 0.5).collect();
    vec![
        wave_blob(&[channels], seed),
        blob(&[channels], var),
        blob(&[1], vec![2.0]),
    ]
}

/// Convolution, in-place normalization on `x`, affine producing `y`.
pub fn norm_affine_graph() -> GraphModel {
    GraphBuilder::new("norm_affine")
        .input("data", &[1, 4, 4, 4])
        .convolution("conv", "data", "x", ConvolutionConfig::new(4, 3).with_pad(1))
        .weights(vec![wave_blob(&[4, 4, 3, 3], 1), wave_blob(&[4], 2)])
        .batch_norm("A", "x", "x", BatchNormConfig::default())
        .weights(norm_weights(4, 3))
        .scale("B", "x", "y", ScaleConfig::default())
        .weights(vec![wave_blob(&[4], 5), wave_blob(&[4], 6)])
        .build()
}

/// Convolution C feeding two stride-2 1x1 siblings merged by an add.
pub fn sibling_stride_graph() -> GraphModel {
    GraphBuilder::new("siblings")
        .input("data", &[1, 4, 8, 8])
        .convolution("C", "data", "c", ConvolutionConfig::new(4, 3).with_pad(1))
        .weights(vec![wave_blob(&[4, 4, 3, 3], 1), wave_blob(&[4], 2)])
        .convolution("D1", "c", "d1", ConvolutionConfig::new(8, 1).with_stride(2))
        .weights(vec![wave_blob(&[8, 4, 1, 1], 3), wave_blob(&[8], 4)])
        .convolution("D2", "c", "d2", ConvolutionConfig::new(8, 1).with_stride(2))
        .weights(vec![wave_blob(&[8, 4, 1, 1], 5), wave_blob(&[8], 6)])
        .eltwise("add", &["d1", "d2"], "out", EltwiseConfig::sum())
        .build()
}

/// Two quantized 1x1 convolutions over `data` joined on channels.
///
/// Weights and biases are small integers, so with integer input every
/// convolution result is exact before quantization.
pub fn quantized_concat_graph(
    batch: usize,
    branches: [(usize, f32); 2],
) -> GraphModel {
    let [(ca, sa), (cb, sb)] = branches;
    GraphBuilder::new("quantized_concat")
        .input("data", &[batch, 2, 2, 2])
        .convolution("a", "data", "a", ConvolutionConfig::new(ca, 1).with_output_scale(sa))
        .weights(vec![
            blob(&[ca, 2, 1, 1], small_ints(ca * 2, 1)),
            blob(&[ca], small_ints(ca, 2)),
        ])
        .convolution("b", "data", "b", ConvolutionConfig::new(cb, 1).with_output_scale(sb))
        .weights(vec![
            blob(&[cb, 2, 1, 1], small_ints(cb * 2, 3)),
            blob(&[cb], small_ints(cb, 4)),
        ])
        .concat("cat", &["a", "b"], "cat", ConcatConfig::default())
        .build()
}

/// Integer input values `0, 1, 2, ...` wrapped at 7.
pub fn integer_input(shape: &[usize]) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_vec((0..len).map(|i| (i % 7) as f32).collect(), shape).unwrap()
}

/// Build `graph` with the core operators and run one forward pass.
pub fn build_and_run(
    graph: &GraphModel,
    config: NetConfig,
    input: &Tensor,
) -> anyhow::Result<(Net, ExecutionContext)> {
    let mut ctx = ExecutionContext::new();
    let mut net = Net::from_graph(graph, &core_operator_registry(), config, &mut ctx)?;
    net.set_input("data", input, &mut ctx)?;
    net.forward(&mut ctx, true)?;
    Ok((net, ctx))
}

/// Largest elementwise difference between two equally shaped tensors.
pub fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.shape(), b.shape());
    a.max_abs_diff(b).unwrap()
}
