//! Shared graph builders for the compiler integration tests.

#![allow(dead_code)]

use tessera_core::{
    BatchNormConfig, ConvolutionConfig, EltwiseConfig, GraphBuilder, GraphModel, PoolingConfig,
    ScaleConfig,
};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// Convolution, in-place normalization on `x`, affine producing `y`.
pub fn norm_affine_graph() -> GraphModel {
    GraphBuilder::new("norm_affine")
        .input("data", &[1, 2, 4, 4])
        .convolution("conv", "data", "x", ConvolutionConfig::new(2, 3).with_pad(1))
        .batch_norm("A", "x", "x", BatchNormConfig::default())
        .scale("B", "x", "y", ScaleConfig::default())
        .build()
}

/// Convolution C feeding two stride-2 1x1 siblings merged by an add.
pub fn sibling_stride_graph() -> GraphModel {
    GraphBuilder::new("siblings")
        .input("data", &[1, 4, 8, 8])
        .convolution("C", "data", "c", ConvolutionConfig::new(4, 3).with_pad(1))
        .convolution("D1", "c", "d1", ConvolutionConfig::new(8, 1).with_stride(2))
        .convolution("D2", "c", "d2", ConvolutionConfig::new(8, 1).with_stride(2))
        .eltwise("add", &["d1", "d2"], "out", EltwiseConfig::sum())
        .build()
}

/// Two residual blocks in the usual conv/bn/scale/relu arrangement.
pub fn residual_graph() -> GraphModel {
    let mut builder = GraphBuilder::new("resnet")
        .input("data", &[1, 8, 16, 16])
        .convolution("conv1", "data", "conv1", ConvolutionConfig::new(8, 3).with_pad(1))
        .batch_norm("bn1", "conv1", "conv1", BatchNormConfig::default())
        .scale("scale1", "conv1", "conv1", ScaleConfig::default())
        .relu("relu1", "conv1", "conv1")
        .pooling("pool1", "conv1", "pool1", PoolingConfig::max(3, 2));

    let mut input = "pool1".to_string();
    for block in ["res2a", "res2b"] {
        let branch_a = format!("{block}_branch2a");
        let branch_b = format!("{block}_branch2b");
        let bn_a = format!("bn_{block}_branch2a");
        let bn_b = format!("bn_{block}_branch2b");
        let relu = format!("{block}_relu");
        builder = builder
            .convolution(&branch_a, &input, &branch_a, ConvolutionConfig::new(8, 3).with_pad(1))
            .batch_norm(&bn_a, &branch_a, &branch_a, BatchNormConfig::default())
            .relu(&format!("{branch_a}_relu"), &branch_a, &branch_a)
            .convolution(&branch_b, &branch_a, &branch_b, ConvolutionConfig::new(8, 3).with_pad(1))
            .batch_norm(&bn_b, &branch_b, &branch_b, BatchNormConfig::default())
            .eltwise(block, &[input.as_str(), branch_b.as_str()], block, EltwiseConfig::sum())
            .relu(&relu, block, block);
        input = block.to_string();
    }
    builder.build()
}
