use graphfuse_core::{
    model::Model,
    node::Node,
    op::{BatchNormalization, Conv2d, MaxPool, Op},
    optimize::conv_bn_fusion::fuse_conv_batch_norm,
    tensor::{Tensor, TensorElemType, TypedShape},
    value::ValueId,
};
use graphfuse_interpreter::run;

#[derive(Clone)]
struct ConvBn {
    in_channels: usize,
    out_channels: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: Vec<usize>,
    auto_pad: &'static str,
    dilation: [usize; 2],
    group: usize,
    bias: bool,
}

impl Default for ConvBn {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel: [3, 3],
            stride: [1, 1],
            padding: vec![0, 0],
            auto_pad: "",
            dilation: [1, 1],
            group: 1,
            bias: true,
        }
    }
}

/// Random values centered on zero so stacked layers keep moderate magnitudes.
fn rand_centered(dims: Vec<usize>) -> Tensor {
    let mut t = Tensor::rand::<f32>(dims.into());
    for v in t.data_mut::<f32>() {
        *v -= 0.5;
    }
    t
}

/// Random values bounded away from zero, for scales and variances.
fn rand_positive(dims: Vec<usize>, offset: f32) -> Tensor {
    let mut t = Tensor::rand::<f32>(dims.into());
    for v in t.data_mut::<f32>() {
        *v += offset;
    }
    t
}

fn push_conv_bn(model: &mut Model, input: ValueId, layer: &ConvBn) -> ValueId {
    let c = layer.out_channels;

    let weight = model.graph.values.new_val();
    let fan_in = (layer.in_channels / layer.group) * layer.kernel[0] * layer.kernel[1];
    let mut weight_data = rand_centered(vec![
        c,
        layer.in_channels / layer.group,
        layer.kernel[0],
        layer.kernel[1],
    ]);
    // Keep activations at unit scale through deep chains.
    for v in weight_data.data_mut::<f32>() {
        *v /= (fan_in as f32).sqrt();
    }
    model.graph.inits.insert(weight, weight_data);
    let mut conv_ins = vec![input, weight];
    if layer.bias {
        let bias = model.graph.values.new_val();
        model.graph.inits.insert(bias, rand_centered(vec![c]));
        conv_ins.push(bias);
    }
    let conv_out = model.graph.values.new_val();
    model.add_node(
        Node::new(Op::Conv2d(Conv2d {
            auto_pad: layer.auto_pad.to_string(),
            kernel_shape: layer.kernel.to_vec().into(),
            strides: layer.stride.to_vec().into(),
            padding: layer.padding.clone().into(),
            dilations: layer.dilation.to_vec().into(),
            group: layer.group as i64,
        }))
        .with_ins(conv_ins)
        .with_out(conv_out),
    );

    let mut bn_ins = vec![conv_out];
    for param in [
        rand_positive(vec![c], 0.5),  // scale
        rand_centered(vec![c]),       // shift
        rand_centered(vec![c]),       // running mean
        rand_positive(vec![c], 0.25), // running variance
    ] {
        let id = model.graph.values.new_val();
        model.graph.inits.insert(id, param);
        bn_ins.push(id);
    }
    let bn_out = model.graph.values.new_val();
    model.add_node(
        Node::new(Op::BatchNormalization(BatchNormalization {
            epsilon: 1e-5,
            momentum: 0.9,
            training_mode: false,
        }))
        .with_ins(bn_ins)
        .with_out(bn_out),
    );

    bn_out
}

fn conv_bn_chain(layers: &[ConvBn], input_dims: Vec<usize>) -> Model {
    let mut model = Model::default();
    let x = model.graph.values.new_val_named_and_shaped(
        "x",
        TypedShape::new(input_dims.into(), TensorElemType::F32),
    );
    model.graph.inputs.push(x);
    let mut cursor = x;
    for layer in layers {
        cursor = push_conv_bn(&mut model, cursor, layer);
    }
    model.graph.outputs.push(cursor);
    model
}

fn live_batch_norm_count(model: &Model) -> usize {
    model
        .graph
        .nodes
        .iter()
        .filter(|(_, n)| !n.deleted && matches!(n.op, Op::BatchNormalization(_)))
        .count()
}

/// Runs the chain unfused and fused on identical input and asserts the
/// outputs agree element-wise within 1e-4 absolute + 1e-4 relative.
fn assert_fusion_equivalence(layers: &[ConvBn], input_dims: [usize; 4]) {
    let _ = env_logger::builder().is_test(true).try_init();
    Tensor::seed_rng_from_u64(0);

    let mut model = conv_bn_chain(layers, input_dims.to_vec());
    let x = rand_centered(input_dims.to_vec());

    let before = run(&model, &[x.clone()]).unwrap();
    assert_eq!(live_batch_norm_count(&model), layers.len());

    fuse_conv_batch_norm(&mut model).unwrap();
    assert_eq!(live_batch_norm_count(&model), 0);

    let after = run(&model, &[x]).unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.dims(), b.dims());
        assert!(a.allclose(b, 1e-4, 1e-4));
    }
}

#[test]
fn fuse_plain_3x3() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 12,
            out_channels: 16,
            ..Default::default()
        }],
        [1, 12, 24, 24],
    );
}

#[test]
fn fuse_rect_kernel_strided() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 16,
            out_channels: 20,
            kernel: [2, 4],
            stride: [2, 1],
            padding: vec![2, 2],
            ..Default::default()
        }],
        [1, 16, 24, 24],
    );
}

#[test]
fn fuse_no_bias_asymmetric_padding() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 20,
            out_channels: 24,
            kernel: [1, 3],
            padding: vec![2, 4],
            bias: false,
            ..Default::default()
        }],
        [1, 20, 16, 16],
    );
}

#[test]
fn fuse_grouped() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 24,
            out_channels: 28,
            kernel: [5, 4],
            group: 4,
            ..Default::default()
        }],
        [1, 24, 16, 16],
    );
}

#[test]
fn fuse_same_padding_dilated_grouped() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 28,
            out_channels: 32,
            kernel: [3, 3],
            padding: vec![],
            auto_pad: "SAME_UPPER",
            dilation: [1, 2],
            group: 2,
            bias: false,
            ..Default::default()
        }],
        [1, 28, 16, 16],
    );
}

#[test]
fn fuse_depthwise() {
    assert_fusion_equivalence(
        &[ConvBn {
            in_channels: 32,
            out_channels: 32,
            kernel: [2, 2],
            stride: [2, 2],
            padding: vec![3, 3],
            group: 32,
            ..Default::default()
        }],
        [1, 32, 16, 16],
    );
}

#[test]
fn fuse_chain() {
    let layers = [
        ConvBn {
            in_channels: 12,
            out_channels: 16,
            ..Default::default()
        },
        ConvBn {
            in_channels: 16,
            out_channels: 20,
            kernel: [2, 4],
            stride: [2, 1],
            padding: vec![2, 2],
            ..Default::default()
        },
        ConvBn {
            in_channels: 20,
            out_channels: 24,
            kernel: [1, 3],
            padding: vec![2, 4],
            bias: false,
            ..Default::default()
        },
        ConvBn {
            in_channels: 24,
            out_channels: 28,
            kernel: [5, 4],
            group: 4,
            ..Default::default()
        },
        ConvBn {
            in_channels: 28,
            out_channels: 32,
            kernel: [3, 3],
            padding: vec![],
            auto_pad: "SAME_UPPER",
            dilation: [1, 2],
            group: 2,
            bias: false,
            ..Default::default()
        },
        ConvBn {
            in_channels: 32,
            out_channels: 32,
            kernel: [2, 2],
            stride: [2, 2],
            padding: vec![3, 3],
            group: 32,
            ..Default::default()
        },
        ConvBn {
            in_channels: 32,
            out_channels: 28,
            kernel: [2, 2],
            padding: vec![2, 2],
            bias: false,
            ..Default::default()
        },
    ];
    assert_fusion_equivalence(&layers, [1, 12, 48, 48]);
}

#[test]
fn fuse_preserves_downstream_ops() {
    let _ = env_logger::builder().is_test(true).try_init();
    Tensor::seed_rng_from_u64(1);

    let mut model = conv_bn_chain(
        &[ConvBn {
            in_channels: 4,
            out_channels: 8,
            ..Default::default()
        }],
        vec![1, 4, 12, 12],
    );
    // Append relu -> maxpool after the normalization.
    let bn_out = model.graph.outputs[0];
    let relu_out = model.graph.values.new_val();
    model.add_node(Node::new(Op::ReLU).with_in(bn_out).with_out(relu_out));
    let pool_out = model.graph.values.new_val();
    model.add_node(
        Node::new(Op::MaxPool(MaxPool {
            kernel_shape: vec![2, 2].into(),
            strides: vec![2, 2].into(),
            padding: vec![0, 0].into(),
        }))
        .with_in(relu_out)
        .with_out(pool_out),
    );
    model.graph.outputs = vec![pool_out];

    let x = rand_centered(vec![1, 4, 12, 12]);
    let before = run(&model, &[x.clone()]).unwrap();
    fuse_conv_batch_norm(&mut model).unwrap();
    assert_eq!(live_batch_norm_count(&model), 0);
    let after = run(&model, &[x]).unwrap();
    assert!(before[0].allclose(&after[0], 1e-4, 1e-4));
}

#[test]
fn branching_conv_is_left_alone() {
    let _ = env_logger::builder().is_test(true).try_init();
    Tensor::seed_rng_from_u64(2);

    let mut model = conv_bn_chain(
        &[ConvBn {
            in_channels: 4,
            out_channels: 8,
            ..Default::default()
        }],
        vec![1, 4, 12, 12],
    );
    // A second consumer of the convolution output: the pattern must not fire.
    let conv_out = model
        .graph
        .nodes
        .iter()
        .find(|(_, n)| !n.deleted && matches!(n.op, Op::Conv2d(_)))
        .map(|(_, n)| n.outputs[0])
        .unwrap();
    let relu_out = model.graph.values.new_val();
    model.add_node(Node::new(Op::ReLU).with_in(conv_out).with_out(relu_out));
    model.graph.outputs.push(relu_out);

    let x = rand_centered(vec![1, 4, 12, 12]);
    let before = run(&model, &[x.clone()]).unwrap();
    fuse_conv_batch_norm(&mut model).unwrap();
    assert_eq!(live_batch_norm_count(&model), 1);
    let after = run(&model, &[x]).unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.data::<f32>(), b.data::<f32>());
    }
}
